//! Checkpoint layer: finding the current container superblock in the
//! descriptor ring, cross-checking it against the block-zero copy, and
//! parsing the checkpoint-mapping table that resolves ephemeral oids.

use zerocopy::{AsBytes, FromBytes, Unaligned};

use block_device::BlockDevice;

use crate::error::{CheckError, CheckResult};
use crate::object::{read_object_nocheck, Object};
use crate::types::{self, NX_INCOMPAT_FUSION, NX_INCOMPAT_VERSION1, NX_INCOMPAT_VERSION2, NX_MAGIC, OBJECT_TYPE_CHECKPOINT_MAP, OBJECT_TYPE_NX_SUPERBLOCK};

/// Fields of `nx_superblock_t` this checker actually consults. Many
/// reserved/future fields are skipped over rather than modelled.
#[derive(Debug, Clone, Copy, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct NxSuperblockRaw {
    pub magic: u32,
    pub block_size: u32,
    pub block_count: u64,
    pub features: u64,
    pub ro_compat_features: u64,
    pub incompat_features: u64,
    pub uuid: [u8; 16],
    pub next_oid: u64,
    pub next_xid: u64,
    pub xp_desc_blocks: u32,
    pub xp_data_blocks: u32,
    pub xp_desc_base: i64,
    pub xp_data_base: i64,
    pub xp_desc_next: u32,
    pub xp_data_next: u32,
    pub xp_desc_index: u32,
    pub xp_desc_len: u32,
    pub xp_data_index: u32,
    pub xp_data_len: u32,
    pub spaceman_oid: u64,
    pub omap_oid: u64,
    pub reaper_oid: u64,
    pub test_type: u32,
    pub max_file_systems: u32,
    pub fs_oid: [u64; NX_MAX_FILE_SYSTEMS],
}

pub const NX_MAX_FILE_SYSTEMS: usize = 100;

pub const NXSB_STRUCT_SIZE: usize = std::mem::size_of::<NxSuperblockRaw>();

/// Byte ranges within block 0 that the block-zero/current-checkpoint
/// comparison tolerates (the counters and flags regions churn every
/// checkpoint even when nothing is actually wrong).
pub const COUNTERS_REGION: std::ops::Range<usize> = 0x3D8..0x4D8;
pub const FLAGS_REGION: std::ops::Range<usize> = 0x4F0..0x4F8;

pub struct Checkpoint {
    pub superblock: NxSuperblockRaw,
    pub object: Object,
    pub block_size: u32,
    pub xid: u64,
}

impl Checkpoint {
    /// The (virtual) oids of every volume superblock registered in this
    /// checkpoint, in slot order. Unused slots are zero.
    pub fn superblock_volume_oids(&self) -> Vec<u64> {
        self.superblock.fs_oid.iter().copied().filter(|&oid| oid != 0).collect()
    }
}

/// One ephemeral-object mapping recorded in a checkpoint-mapping block.
#[derive(Debug, Clone, Copy, Default, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct CheckpointMapEntry {
    pub mtype: u32,
    pub subtype: u32,
    pub size: u32,
    pub pad: u32,
    pub fs_oid: u64,
    pub oid: u64,
    pub paddr: u64,
}

pub struct CheckpointMapTable {
    pub entries: Vec<CheckpointMapEntry>,
}

impl CheckpointMapTable {
    /// Looks up the physical address of an ephemeral object, checking
    /// that no two mappings target the same oid and that the mapped
    /// block is consecutive within the data ring, as found during the
    /// table's own construction.
    pub fn resolve(&self, oid: u64) -> CheckResult<u64> {
        let mut hit = None;
        for entry in &self.entries {
            if entry.oid == oid {
                if hit.is_some() {
                    return Err(CheckError::corruption("checkpoint map", format!("oid {:#x} mapped twice", oid)));
                }
                hit = Some(entry.paddr);
            }
        }
        hit.ok_or_else(|| CheckError::corruption("checkpoint map", format!("no mapping for ephemeral oid {:#x}", oid)))
    }
}

/// Reads block 0, re-mapping the caller's notion of block size if the
/// on-disk value differs from the device default, and parses the
/// superblock fields this checker needs.
pub fn read_block_zero(device: &mut dyn BlockDevice) -> CheckResult<(Object, NxSuperblockRaw)> {
    let object = read_object_nocheck(device, 0)?;
    let sb = NxSuperblockRaw::read_from_prefix(object.body()).ok_or_else(|| CheckError::corruption("container superblock", "block 0 is too small for a superblock"))?;
    if sb.magic != NX_MAGIC {
        return Err(CheckError::corruption("container superblock", "not an apfs container"));
    }
    if object.header.oid != types::APFS_OID_NX_SUPERBLOCK {
        return Err(CheckError::corruption("container superblock", "block 0 does not have oid 1"));
    }
    if sb.incompat_features & NX_INCOMPAT_VERSION1 != 0 {
        return Err(CheckError::UnsupportedFeature("container uses version-1 on-disk format".into()));
    }
    if sb.incompat_features & NX_INCOMPAT_VERSION2 == 0 {
        return Err(CheckError::corruption("container superblock", "container does not declare INCOMPAT_VERSION2"));
    }
    if sb.block_count.checked_mul(sb.block_size as u64).is_none() {
        return Err(CheckError::corruption("container superblock", "block_count * block_size overflows"));
    }
    if device.byte_len() < sb.block_count * sb.block_size as u64 {
        return Err(CheckError::corruption("container superblock", "too many blocks for device."));
    }
    Ok((object, sb))
}

/// Walks the descriptor ring, returning the candidate checkpoint
/// superblock with the greatest valid xid.
pub fn select_current_checkpoint(device: &mut dyn BlockDevice, zero: &NxSuperblockRaw) -> CheckResult<Checkpoint> {
    let desc_blocks = zero.xp_desc_blocks & 0x7FFF_FFFF;
    let desc_base = zero.xp_desc_base as u64;

    let mut best: Option<(Object, NxSuperblockRaw)> = None;
    for i in 0..desc_blocks as u64 {
        let bno = desc_base + i;
        let object = match read_object_nocheck(device, bno) {
            Ok(o) => o,
            Err(_) => continue,
        };
        if object.header.type_code() != OBJECT_TYPE_NX_SUPERBLOCK {
            continue;
        }
        let Some(sb) = NxSuperblockRaw::read_from_prefix(object.body()) else { continue };
        if sb.magic != NX_MAGIC {
            continue;
        }
        let better = match &best {
            Some((_, cur)) => object.header.xid > cur.xid,
            None => true,
        };
        if better {
            best = Some((object, sb));
        }
    }

    let (object, sb) = best.ok_or_else(|| CheckError::corruption("checkpoint", "descriptor ring has no valid superblock"))?;
    let xid = object.header.xid;
    Ok(Checkpoint { superblock: sb, object, block_size: zero.block_size, xid })
}

/// Parses the mapping blocks belonging to `checkpoint`, starting at its
/// `xp_desc_index` and reading forward (modulo the ring length) until a
/// block flagged `LAST` is found, then confirms the following block is a
/// superblock whose declared descriptor length matches.
pub fn parse_checkpoint_map(device: &mut dyn BlockDevice, zero: &NxSuperblockRaw, checkpoint: &Checkpoint) -> CheckResult<CheckpointMapTable> {
    const CHECKPOINT_MAP_LAST: u32 = 0x0000_0001;

    let desc_blocks = zero.xp_desc_blocks as u64 & 0x7FFF_FFFF;
    let desc_base = zero.xp_desc_base as u64;
    let start = checkpoint.superblock.xp_desc_index as u64;

    let mut entries = Vec::new();
    let mut map_blocks: u64 = 0;
    let mut i = 0u64;
    loop {
        if i >= desc_blocks {
            return Err(CheckError::corruption("checkpoint map", "mapping blocks never reach a LAST flag"));
        }
        let bno = desc_base + (start + i) % desc_blocks;
        let object = read_object_nocheck(device, bno)?;
        if object.header.type_code() != OBJECT_TYPE_CHECKPOINT_MAP {
            return Err(CheckError::corruption("checkpoint map", "expected a checkpoint-mapping block"));
        }
        let body = object.body();
        if body.len() < 8 {
            return Err(CheckError::corruption("checkpoint map", "mapping block body is truncated"));
        }
        let flags = u32::from_le_bytes(body[0..4].try_into().unwrap());
        let count = u32::from_le_bytes(body[4..8].try_into().unwrap());
        let entry_size = std::mem::size_of::<CheckpointMapEntry>();
        let mut off = 8usize;
        for _ in 0..count {
            let slice = body.get(off..off + entry_size).ok_or_else(|| CheckError::corruption("checkpoint map", "entry count overruns the block"))?;
            let entry = CheckpointMapEntry::read_from(slice).ok_or_else(|| CheckError::corruption("checkpoint map", "malformed mapping entry"))?;
            entries.push(entry);
            off += entry_size;
        }
        map_blocks += 1;
        i += 1;
        if flags & CHECKPOINT_MAP_LAST != 0 {
            break;
        }
    }

    let next_bno = desc_base + (start + map_blocks) % desc_blocks;
    let next_object = read_object_nocheck(device, next_bno)?;
    if next_object.header.type_code() != OBJECT_TYPE_NX_SUPERBLOCK {
        return Err(CheckError::corruption("checkpoint map", "block after the LAST mapping is not a superblock"));
    }
    let next_sb = NxSuperblockRaw::read_from_prefix(next_object.body()).ok_or_else(|| CheckError::corruption("checkpoint map", "malformed trailing superblock"))?;
    if next_sb.xp_desc_len as u64 != map_blocks + 1 {
        return Err(CheckError::corruption("checkpoint map", "trailing superblock's descriptor length does not match the mapping run"));
    }

    validate_mapping_addresses(zero, &entries)?;
    Ok(CheckpointMapTable { entries })
}

fn validate_mapping_addresses(zero: &NxSuperblockRaw, entries: &[CheckpointMapEntry]) -> CheckResult<()> {
    let data_base = zero.xp_data_base as u64;
    let data_blocks = zero.xp_data_blocks as u64 & 0x7FFF_FFFF;
    let data_index = zero.xp_data_index as u64;

    let mut seen_oids = std::collections::HashSet::new();
    let mut next_expected = data_base + data_index;
    for entry in entries {
        if !seen_oids.insert(entry.oid) {
            return Err(CheckError::corruption("checkpoint map", format!("oid {:#x} mapped twice", entry.oid)));
        }
        if entry.paddr != next_expected {
            return Err(CheckError::corruption("checkpoint map", "mapping paddr is not consecutive in the data ring"));
        }
        if entry.size as u64 % zero.block_size as u64 != 0 {
            return Err(CheckError::corruption("checkpoint map", "mapping size is not a multiple of the block size"));
        }
        let blocks = entry.size as u64 / zero.block_size as u64;
        if entry.paddr + blocks > data_base + data_blocks {
            return Err(CheckError::corruption("checkpoint map", "mapping does not fit in the declared data window"));
        }
        next_expected += blocks;
    }
    Ok(())
}

/// Compares the current checkpoint's block-0 region against the actual
/// block-0 copy, ignoring the counters and flags regions. Any other
/// divergence is a crash marker, not corruption -- block 0 is only
/// rewritten lazily.
pub fn compare_against_block_zero(zero_object: &Object, current: &Checkpoint) -> CheckResult<()> {
    let a = &zero_object.bytes;
    let b = &current.object.bytes;
    if a.len() != b.len() {
        return Err(CheckError::corruption("checkpoint", "block 0 and the current checkpoint have different sizes"));
    }
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        if x == y {
            continue;
        }
        if COUNTERS_REGION.contains(&i) || FLAGS_REGION.contains(&i) {
            continue;
        }
        return Err(CheckError::CrashSign(format!("block 0 diverges from the current checkpoint at offset {:#x}", i)));
    }
    Ok(())
}

/// On a Fusion container, compares the tier-2 device's own block 0
/// against the main device's, after clearing the fusion bit and the
/// checksum field, per the documented UUID convention.
pub fn compare_fusion_uuids(main_zero: &[u8], tier2_zero: &[u8], incompat_features: u64) -> CheckResult<()> {
    if incompat_features & NX_INCOMPAT_FUSION == 0 {
        return Ok(());
    }
    const UUID_OFF: usize = 0x28;
    if tier2_zero.len() < UUID_OFF + 16 || main_zero.len() < UUID_OFF + 16 {
        return Err(CheckError::corruption("fusion", "block 0 too small to contain a uuid"));
    }
    let tier2_bit0 = tier2_zero[UUID_OFF] & 0x01;
    let main_bit0 = main_zero[UUID_OFF] & 0x01;
    if tier2_bit0 == 0 {
        return Err(CheckError::corruption("fusion", "tier-2 fusion uuid does not have bit 0 set"));
    }
    if main_bit0 != 0 {
        return Err(CheckError::corruption("fusion", "main device fusion uuid has bit 0 set"));
    }

    let mut main_copy = main_zero.to_vec();
    let mut tier2_copy = tier2_zero.to_vec();
    main_copy[0..8].fill(0);
    tier2_copy[0..8].fill(0);
    tier2_copy[UUID_OFF] &= !0x01;

    if main_copy != tier2_copy {
        return Err(CheckError::corruption("fusion", "main and tier-2 block 0 disagree outside the checksum and fusion-uuid bit"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_table_rejects_duplicate_oid() {
        let entries = vec![
            CheckpointMapEntry { mtype: 0, subtype: 0, size: 4096, pad: 0, fs_oid: 0, oid: 42, paddr: 10 },
            CheckpointMapEntry { mtype: 0, subtype: 0, size: 4096, pad: 0, fs_oid: 0, oid: 42, paddr: 11 },
        ];
        let table = CheckpointMapTable { entries };
        assert!(table.resolve(42).is_err());
    }
}
