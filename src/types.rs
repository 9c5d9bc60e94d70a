//! Shared on-disk primitives: the object header, checksum, and the magic
//! numbers and flag bits that appear throughout the container format.
//!
//! Structs here assume a little-endian host, same as the on-disk format;
//! fine for the x86_64/aarch64 targets this runs on.

use zerocopy::{AsBytes, FromBytes, Unaligned};

pub const OBJ_HEADER_SIZE: usize = 32;

/// Storage-class bits, packed into the high 16 bits of `o_type`.
pub const OBJECT_TYPE_MASK: u32 = 0x0000_ffff;
pub const OBJECT_TYPE_FLAGS_MASK: u32 = 0xffff_0000;

pub const OBJ_VIRTUAL: u32 = 0x0000_0000;
pub const OBJ_EPHEMERAL: u32 = 0x8000_0000;
pub const OBJ_PHYSICAL: u32 = 0x4000_0000;
pub const OBJ_STORAGETYPE_MASK: u32 = OBJ_VIRTUAL | OBJ_EPHEMERAL | OBJ_PHYSICAL;

pub const OBJ_NOHEADER: u32 = 0x2000_0000;
pub const OBJ_ENCRYPTED: u32 = 0x1000_0000;
pub const OBJ_NONPERSISTENT: u32 = 0x0800_0000;

/// Object type codes (low 16 bits of `o_type`) that the checker cares
/// about. Far from exhaustive; unknown codes are `Weird` not `Corruption`.
pub const OBJECT_TYPE_NX_SUPERBLOCK: u32 = 0x0000_0001;
pub const OBJECT_TYPE_BTREE: u32 = 0x0000_0002;
pub const OBJECT_TYPE_BTREE_NODE: u32 = 0x0000_0003;
pub const OBJECT_TYPE_SPACEMAN: u32 = 0x0000_0005;
pub const OBJECT_TYPE_SPACEMAN_CAB: u32 = 0x0000_0006;
pub const OBJECT_TYPE_SPACEMAN_CIB: u32 = 0x0000_0007;
pub const OBJECT_TYPE_SPACEMAN_BITMAP: u32 = 0x0000_0008;
pub const OBJECT_TYPE_OMAP: u32 = 0x0000_000b;
pub const OBJECT_TYPE_CHECKPOINT_MAP: u32 = 0x0000_000c;
pub const OBJECT_TYPE_FS: u32 = 0x0000_000d;
pub const OBJECT_TYPE_FSTREE: u32 = 0x0000_000e;
pub const OBJECT_TYPE_NX_REAPER: u32 = 0x0000_0011;
pub const OBJECT_TYPE_EXTENT_LIST_TREE: u32 = 0x0000_0013;
pub const OBJECT_TYPE_SNAP_META_TREE: u32 = 0x0000_0019;
pub const OBJECT_TYPE_FEXT_TREE: u32 = 0x0000_001f;

pub const APFS_OID_NX_SUPERBLOCK: u64 = 1;
pub const APFS_OID_RESERVED_COUNT: u64 = 1024;

pub const NX_MAGIC: u32 = 0x4253_584e; // "NXSB"
pub const APFS_MAGIC: u32 = 0x4253_5041; // "APSB"
pub const JSDR_MAGIC: u32 = 0x5244_534a; // "RDSJ"

/// Container incompatible-feature flags. Version 2 is the only format
/// this checker speaks.
pub const NX_INCOMPAT_VERSION1: u64 = 0x1;
pub const NX_INCOMPAT_VERSION2: u64 = 0x2;
pub const NX_INCOMPAT_FUSION: u64 = 0x100;

/// Volume incompatible-feature flags the checker must reject outright.
pub const APFS_INCOMPAT_ENCRYPTED: u64 = 0x1;
pub const APFS_INCOMPAT_DATALESS_SNAPS: u64 = 0x2;
pub const APFS_INCOMPAT_ENC_ROLLED: u64 = 0x4;
pub const APFS_INCOMPAT_INCOMPLETE_RESTORE: u64 = 0x20;
pub const APFS_INCOMPAT_SECONDARY_FSROOT: u64 = 0x400;

/// Volume feature flags the checker recognises and supports.
pub const APFS_FEATURE_SEALED_VOLUME: u64 = 0x0004_0000_0000;

/// The 32-byte object header shared by every object on disk.
#[derive(Debug, Clone, Copy, Default, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct ObjPhysHeader {
    pub cksum: u64,
    pub oid: u64,
    pub xid: u64,
    pub otype: u32,
    pub subtype: u32,
}

impl ObjPhysHeader {
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        ObjPhysHeader::read_from_prefix(bytes)
    }

    pub fn storage_class(&self) -> u32 {
        self.otype & OBJECT_TYPE_FLAGS_MASK & OBJ_STORAGETYPE_MASK
    }

    pub fn type_code(&self) -> u32 {
        self.otype & OBJECT_TYPE_MASK
    }

    pub fn is_encrypted(&self) -> bool {
        self.otype & OBJ_ENCRYPTED != 0
    }

    pub fn is_nonpersistent(&self) -> bool {
        self.otype & OBJ_NONPERSISTENT != 0
    }
}

/// Fletcher-64 as used by APFS: the checksum covers every little-endian
/// `u32` word of the object body *except* the first two words (the stored
/// checksum field itself), modulo `2^32 - 1`.
pub fn fletcher64(body: &[u8]) -> u64 {
    const MOD: u64 = 0xffff_ffff;
    let mut sum1: u64 = 0;
    let mut sum2: u64 = 0;

    let words = body.chunks_exact(4);
    let mut word_count = 0u64;
    for chunk in words.clone() {
        let w = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as u64;
        sum1 = (sum1 + w) % MOD;
        sum2 = (sum2 + sum1) % MOD;
        word_count += 1;
    }
    debug_assert_eq!(words.remainder().len(), 0, "object body must be a whole number of u32 words");

    let c1 = MOD - (sum1 + sum2) % MOD;
    let c2 = MOD - (sum1 + c1) % MOD;
    let _ = word_count;
    (c2 << 32) | c1
}

/// Verifies the checksum stored in the first 8 bytes of `object` against
/// the body starting at byte 8 (i.e. past the stored checksum word, as
/// the spec's `cksum` field occupies the header's first two u32 words).
pub fn verify_object_checksum(object: &[u8]) -> bool {
    if object.len() < 8 {
        return false;
    }
    let stored = u64::from_le_bytes(object[0..8].try_into().unwrap());
    fletcher64(&object[8..]) == stored
}
