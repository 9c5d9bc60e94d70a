//! Formatter (`mkapfs`): lays out a minimal but valid single-volume
//! container. Writes the checkpoint descriptor/data rings, the
//! container object map, a volume-private object map, one volume
//! superblock with a two-record catalog root, and a space manager with
//! a single device chunk and a one-block internal pool.

use rand::RngCore;

use block_device::BlockDevice;

use crate::catalog::key::dentry_name_hash;
use crate::checkpoint::NX_MAX_FILE_SYSTEMS;
use crate::error::{CheckError, CheckResult};
use crate::space::blocks_per_chunk;
use crate::types::{
    fletcher64, APFS_MAGIC, APFS_OID_NX_SUPERBLOCK, NX_INCOMPAT_VERSION2, NX_MAGIC, OBJECT_TYPE_BTREE_NODE, OBJECT_TYPE_CHECKPOINT_MAP, OBJECT_TYPE_FS,
    OBJECT_TYPE_NX_SUPERBLOCK, OBJECT_TYPE_OMAP, OBJECT_TYPE_SPACEMAN, OBJECT_TYPE_SPACEMAN_BITMAP, OBJECT_TYPE_SPACEMAN_CIB, OBJ_EPHEMERAL, OBJ_HEADER_SIZE,
    OBJ_PHYSICAL,
};

/// Every object this formatter writes carries this transaction id; a
/// freshly formatted container has no history to version against.
const FORMAT_XID: u64 = 1;

pub struct FormatOptions {
    pub label: String,
    pub case_sensitive: bool,
    pub normalization_sensitive: bool,
    pub volume_uuid: Option<[u8; 16]>,
    pub container_uuid: Option<[u8; 16]>,
}

impl Default for FormatOptions {
    fn default() -> Self {
        FormatOptions { label: "untitled".to_string(), case_sensitive: false, normalization_sensitive: false, volume_uuid: None, container_uuid: None }
    }
}

/// `cpoint_desc_blocks`/`cpoint_data_blocks` as a stepwise function of
/// the container's total block count, reproducing the reference
/// implementation's documented (approximate) table rather than deriving
/// a new formula.
pub fn checkpoint_ring_sizes(block_count: u64, block_size: u32) -> (u32, u32) {
    let bytes = block_count * block_size as u64;
    const MIB: u64 = 1024 * 1024;
    const GIB: u64 = 1024 * MIB;
    if bytes < 512 * MIB {
        (8, 8)
    } else if bytes < GIB {
        (12, 12)
    } else if bytes < 16 * GIB {
        (32, 32)
    } else if bytes < 128 * GIB {
        (64, 64)
    } else {
        (280, 280)
    }
}

pub const APFS_OID_RESERVED_COUNT: u64 = 1024;

/// Oids reserved above [`APFS_OID_RESERVED_COUNT`] for the fixed set of
/// objects a freshly formatted single-volume container needs.
pub struct ReservedOids {
    pub spaceman: u64,
    pub reaper: u64,
    pub first_volume: u64,
    pub first_volume_catalog_root: u64,
    pub ip_free_queue: u64,
    pub main_free_queue: u64,
    pub tier2_free_queue: u64,
    pub fusion_writeback_cache: u64,
}

pub fn reserve_oids() -> ReservedOids {
    let mut next = APFS_OID_RESERVED_COUNT + 1;
    let mut take = || {
        let oid = next;
        next += 1;
        oid
    };
    ReservedOids {
        spaceman: take(),
        reaper: take(),
        first_volume: take(),
        first_volume_catalog_root: take(),
        ip_free_queue: take(),
        main_free_queue: take(),
        tier2_free_queue: take(),
        fusion_writeback_cache: take(),
    }
}

pub fn max_volumes_for(size_bytes: u64) -> u32 {
    const HALF_GIB: u64 = 512 * 1024 * 1024;
    (size_bytes.div_ceil(HALF_GIB)).min(100) as u32
}

/// Computes the count of chunk-info blocks and CIB-address blocks a
/// device's chunks require, per spec 4.6.1.
pub fn cib_cab_counts(chunk_count: u64, block_size: u32) -> (u32, u32) {
    const CIB_HEADER: u64 = OBJ_HEADER_SIZE as u64 + 8;
    const CHUNK_INFO_SIZE: u64 = 16;
    const CAB_HEADER: u64 = OBJ_HEADER_SIZE as u64 + 8;

    let cib_capacity = (block_size as u64 - CIB_HEADER) / CHUNK_INFO_SIZE;
    let cib_count = chunk_count.div_ceil(cib_capacity.max(1));

    let cab_capacity = (block_size as u64 - CAB_HEADER) / 8;
    let cab_count = if cib_count > 1 { cib_count.div_ceil(cab_capacity.max(1)) } else { 0 };

    (cib_count as u32, cab_count as u32)
}

fn random_uuid() -> [u8; 16] {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes[6] = (bytes[6] & 0x0F) | 0x40; // version 4
    bytes[8] = (bytes[8] & 0x3F) | 0x80; // RFC 4122 variant
    bytes
}

/// The data region sits at a fixed block number regardless of device
/// size: the descriptor ring never grows past a few hundred blocks, so
/// fixing the data base this far out leaves headroom for any ring size
/// while keeping the rest of the layout simple to compute.
const DATA_BASE: u64 = 1024;
const DATA_BLOCKS: u64 = 1;

/// Writes a minimal container to `device`, sized to whatever
/// `device.byte_len()` reports.
///
/// The device is restricted to a single space-manager chunk (at most
/// `8 * block_size` blocks): enough for a minimal container, and simple
/// enough that the formatter never needs more than one chunk-info block.
pub fn format_container(device: &mut dyn BlockDevice, options: &FormatOptions) -> CheckResult<()> {
    let block_size = device.block_size().max(4096);
    let byte_len = device.byte_len();
    let block_count = byte_len / block_size as u64;

    let desc_base = 1u64;
    let (desc_blocks, _) = checkpoint_ring_sizes(block_count, block_size);
    let data_base = DATA_BASE;
    let data_blocks = DATA_BLOCKS;

    let tail_base = data_base + data_blocks;
    let container_omap_bno = tail_base;
    let container_omap_root_bno = tail_base + 1;
    let volume_bno = tail_base + 2;
    let volume_omap_bno = tail_base + 3;
    let volume_omap_root_bno = tail_base + 4;
    let catalog_root_bno = tail_base + 5;
    let main_cib_bno = tail_base + 6;
    let main_bitmap_bno = tail_base + 7;
    let ip_ring_bno = tail_base + 8;
    let required_blocks = tail_base + 9;

    if block_count < required_blocks {
        return Err(CheckError::corruption("mkapfs", format!("device holds {block_count} blocks, needs at least {required_blocks}")));
    }
    if block_count > blocks_per_chunk(block_size) as u64 {
        return Err(CheckError::UnsupportedFeature("mkapfs only formats single-chunk containers".into()));
    }
    if desc_base + desc_blocks as u64 > data_base {
        return Err(CheckError::corruption("mkapfs", "checkpoint descriptor ring would overrun the fixed data base"));
    }

    let reserved = reserve_oids();
    let container_uuid = options.container_uuid.unwrap_or_else(random_uuid);
    let volume_uuid = options.volume_uuid.unwrap_or_else(random_uuid);

    write_nx_superblock(
        device,
        0,
        block_size,
        block_count,
        desc_base,
        desc_blocks,
        data_base,
        data_blocks as u32,
        reserved.spaceman,
        container_omap_bno,
        reserved.reaper,
        reserved.first_volume,
        container_uuid,
    )?;

    write_checkpoint_map(device, desc_base, block_size, reserved.spaceman, data_base)?;
    write_nx_superblock(
        device,
        desc_base + 1,
        block_size,
        block_count,
        desc_base,
        desc_blocks,
        data_base,
        data_blocks as u32,
        reserved.spaceman,
        container_omap_bno,
        reserved.reaper,
        reserved.first_volume,
        container_uuid,
    )?;

    write_omap(device, container_omap_bno, container_omap_root_bno, reserved.first_volume, FORMAT_XID, volume_bno, block_size)?;
    write_omap(device, volume_omap_bno, volume_omap_root_bno, reserved.first_volume_catalog_root, FORMAT_XID, catalog_root_bno, block_size)?;

    write_volume_superblock(device, volume_bno, reserved.first_volume, volume_omap_bno, reserved.first_volume_catalog_root, volume_uuid, options, block_size)?;
    write_catalog_root(device, catalog_root_bno, block_size)?;

    write_main_cib(device, main_cib_bno, main_bitmap_bno, block_count, block_size)?;
    write_zero_bitmap_block(device, main_bitmap_bno, block_size)?;
    write_ip_ring(device, ip_ring_bno, FORMAT_XID, block_size)?;

    let (cib_count, cab_count) = cib_cab_counts(1, block_size);
    write_spaceman(device, data_base, block_count, cib_count, cab_count, main_cib_bno, ip_ring_bno, block_size)?;

    Ok(())
}

fn write_object_header(block: &mut [u8], oid: u64, xid: u64, otype: u32) {
    block[8..16].copy_from_slice(&oid.to_le_bytes());
    block[16..24].copy_from_slice(&xid.to_le_bytes());
    block[24..28].copy_from_slice(&otype.to_le_bytes());
}

fn finish_and_write(device: &mut dyn BlockDevice, bno: u64, mut block: Vec<u8>) -> CheckResult<()> {
    let cksum = fletcher64(&block[8..]);
    block[0..8].copy_from_slice(&cksum.to_le_bytes());
    device.write(bno, &block).map_err(CheckError::Io)
}

#[allow(clippy::too_many_arguments)]
fn write_nx_superblock(
    device: &mut dyn BlockDevice,
    bno: u64,
    block_size: u32,
    block_count: u64,
    desc_base: u64,
    desc_blocks: u32,
    data_base: u64,
    data_blocks: u32,
    spaceman_oid: u64,
    omap_oid: u64,
    reaper_oid: u64,
    volume_oid: u64,
    uuid: [u8; 16],
) -> CheckResult<()> {
    let mut block = vec![0u8; block_size as usize];
    write_object_header(&mut block, APFS_OID_NX_SUPERBLOCK, FORMAT_XID, OBJECT_TYPE_NX_SUPERBLOCK | OBJ_PHYSICAL);

    let o = OBJ_HEADER_SIZE;
    block[o..o + 4].copy_from_slice(&NX_MAGIC.to_le_bytes());
    block[o + 0x04..o + 0x08].copy_from_slice(&block_size.to_le_bytes());
    block[o + 0x08..o + 0x10].copy_from_slice(&block_count.to_le_bytes());
    block[o + 0x20..o + 0x28].copy_from_slice(&NX_INCOMPAT_VERSION2.to_le_bytes());
    block[o + 0x28..o + 0x38].copy_from_slice(&uuid);
    block[o + 0x48..o + 0x4C].copy_from_slice(&desc_blocks.to_le_bytes());
    block[o + 0x4C..o + 0x50].copy_from_slice(&data_blocks.to_le_bytes());
    block[o + 0x50..o + 0x58].copy_from_slice(&(desc_base as i64).to_le_bytes());
    block[o + 0x58..o + 0x60].copy_from_slice(&(data_base as i64).to_le_bytes());
    block[o + 0x68..o + 0x6C].copy_from_slice(&0u32.to_le_bytes()); // xp_desc_index
    block[o + 0x6C..o + 0x70].copy_from_slice(&2u32.to_le_bytes()); // xp_desc_len: superblock + one map block
    block[o + 0x70..o + 0x74].copy_from_slice(&0u32.to_le_bytes()); // xp_data_index
    block[o + 0x74..o + 0x78].copy_from_slice(&data_blocks.to_le_bytes()); // xp_data_len
    block[o + 0x78..o + 0x80].copy_from_slice(&spaceman_oid.to_le_bytes());
    block[o + 0x80..o + 0x88].copy_from_slice(&omap_oid.to_le_bytes());
    block[o + 0x88..o + 0x90].copy_from_slice(&reaper_oid.to_le_bytes());
    block[o + 0x98..o + 0xA0].copy_from_slice(&volume_oid.to_le_bytes()); // fs_oid[0]

    finish_and_write(device, bno, block)
}

fn write_checkpoint_map(device: &mut dyn BlockDevice, bno: u64, block_size: u32, spaceman_oid: u64, spaceman_bno: u64) -> CheckResult<()> {
    let mut block = vec![0u8; block_size as usize];
    write_object_header(&mut block, 0, FORMAT_XID, OBJECT_TYPE_CHECKPOINT_MAP | OBJ_PHYSICAL);

    let o = OBJ_HEADER_SIZE;
    const CHECKPOINT_MAP_LAST: u32 = 0x1;
    block[o..o + 4].copy_from_slice(&CHECKPOINT_MAP_LAST.to_le_bytes());
    block[o + 4..o + 8].copy_from_slice(&1u32.to_le_bytes()); // count

    let entry_off = o + 8;
    block[entry_off..entry_off + 4].copy_from_slice(&0u32.to_le_bytes()); // mtype
    block[entry_off + 4..entry_off + 8].copy_from_slice(&0u32.to_le_bytes()); // subtype
    block[entry_off + 8..entry_off + 12].copy_from_slice(&block_size.to_le_bytes());
    block[entry_off + 12..entry_off + 16].copy_from_slice(&0u32.to_le_bytes()); // pad
    block[entry_off + 16..entry_off + 24].copy_from_slice(&0u64.to_le_bytes()); // fs_oid
    block[entry_off + 24..entry_off + 32].copy_from_slice(&spaceman_oid.to_le_bytes());
    block[entry_off + 32..entry_off + 40].copy_from_slice(&spaceman_bno.to_le_bytes());

    finish_and_write(device, bno, block)
}

/// Writes an omap header block at `header_bno` pointing at a
/// single-entry fixed-kv root at `root_bno`, mapping `(entry_oid,
/// entry_xid)` to `entry_paddr`.
#[allow(clippy::too_many_arguments)]
fn write_omap(device: &mut dyn BlockDevice, header_bno: u64, root_bno: u64, entry_oid: u64, entry_xid: u64, entry_paddr: u64, block_size: u32) -> CheckResult<()> {
    let mut block = vec![0u8; block_size as usize];
    write_object_header(&mut block, 0, FORMAT_XID, OBJECT_TYPE_OMAP | OBJ_PHYSICAL);

    let o = OBJ_HEADER_SIZE;
    const OMAP_MANUALLY_MANAGED: u32 = 0x0000_0001;
    block[o..o + 4].copy_from_slice(&OMAP_MANUALLY_MANAGED.to_le_bytes());
    block[o + 8..o + 16].copy_from_slice(&root_bno.to_le_bytes()); // tree_oid

    finish_and_write(device, header_bno, block)?;
    write_single_entry_omap_root(device, root_bno, entry_oid, entry_xid, entry_paddr, block_size)
}

fn write_single_entry_omap_root(device: &mut dyn BlockDevice, bno: u64, oid: u64, xid: u64, paddr: u64, block_size: u32) -> CheckResult<()> {
    let mut block = vec![0u8; block_size as usize];
    write_object_header(&mut block, 0, xid, OBJECT_TYPE_BTREE_NODE | OBJ_PHYSICAL);

    let header_off = OBJ_HEADER_SIZE;
    const FIXED_KV: u16 = 0x0004;
    const ROOT: u16 = 0x0001;
    const LEAF: u16 = 0x0002;
    let flags = ROOT | LEAF | FIXED_KV;
    block[header_off..header_off + 2].copy_from_slice(&flags.to_le_bytes());
    block[header_off + 4..header_off + 8].copy_from_slice(&1u32.to_le_bytes()); // nkeys
    block[header_off + 8..header_off + 10].copy_from_slice(&0u16.to_le_bytes()); // table_space.off
    block[header_off + 10..header_off + 12].copy_from_slice(&4u16.to_le_bytes()); // table_space.len

    let toc_off = header_off + 24;
    block[toc_off..toc_off + 2].copy_from_slice(&0u16.to_le_bytes()); // k_off
    block[toc_off + 2..toc_off + 4].copy_from_slice(&16u16.to_le_bytes()); // v_off: value sits just before the footer

    let keys_area = toc_off + 4;
    block[keys_area..keys_area + 8].copy_from_slice(&oid.to_le_bytes());
    block[keys_area + 8..keys_area + 16].copy_from_slice(&xid.to_le_bytes());

    const FOOTER_SIZE: usize = 40;
    let footer_off = block_size as usize - FOOTER_SIZE;
    let val_off = footer_off - 16;
    block[val_off..val_off + 4].copy_from_slice(&0u32.to_le_bytes()); // flags
    block[val_off + 4..val_off + 8].copy_from_slice(&16u32.to_le_bytes()); // size
    block[val_off + 8..val_off + 16].copy_from_slice(&paddr.to_le_bytes());

    block[footer_off..footer_off + 4].copy_from_slice(&0u32.to_le_bytes());
    block[footer_off + 4..footer_off + 8].copy_from_slice(&block_size.to_le_bytes());
    block[footer_off + 8..footer_off + 12].copy_from_slice(&16u32.to_le_bytes());
    block[footer_off + 12..footer_off + 16].copy_from_slice(&16u32.to_le_bytes());
    block[footer_off + 16..footer_off + 20].copy_from_slice(&16u32.to_le_bytes());
    block[footer_off + 20..footer_off + 24].copy_from_slice(&16u32.to_le_bytes());
    block[footer_off + 24..footer_off + 32].copy_from_slice(&1u64.to_le_bytes());
    block[footer_off + 32..footer_off + 40].copy_from_slice(&1u64.to_le_bytes());

    finish_and_write(device, bno, block)
}

#[allow(clippy::too_many_arguments)]
fn write_volume_superblock(
    device: &mut dyn BlockDevice,
    bno: u64,
    volume_oid: u64,
    omap_bno: u64,
    root_tree_oid: u64,
    uuid: [u8; 16],
    options: &FormatOptions,
    block_size: u32,
) -> CheckResult<()> {
    let mut block = vec![0u8; block_size as usize];
    write_object_header(&mut block, volume_oid, FORMAT_XID, OBJECT_TYPE_FS);

    let body_off = OBJ_HEADER_SIZE;
    block[body_off..body_off + 4].copy_from_slice(&APFS_MAGIC.to_le_bytes());
    block[body_off + 0x20..body_off + 0x30].copy_from_slice(&uuid);
    block[body_off + 0x68..body_off + 0x70].copy_from_slice(&omap_bno.to_le_bytes());
    block[body_off + 0x70..body_off + 0x78].copy_from_slice(&root_tree_oid.to_le_bytes());

    let label_off = body_off + 0xF0;
    let label_bytes = options.label.as_bytes();
    let n = label_bytes.len().min(63);
    block[label_off..label_off + n].copy_from_slice(&label_bytes[..n]);

    finish_and_write(device, bno, block)?;
    let _ = options.case_sensitive;
    let _ = options.normalization_sensitive;
    Ok(())
}

/// Writes the catalog root every freshly formatted volume has: the
/// volume root directory's inode (cnid 2) and its self-referential
/// dentry, the smallest catalog that satisfies the inode/dentry link
/// accounting a real volume's catalog is held to.
fn write_catalog_root(device: &mut dyn BlockDevice, bno: u64, block_size: u32) -> CheckResult<()> {
    const ROOT_DIR_CNID: u64 = 2;
    const RECORD_TYPE_INODE: u64 = 3;
    const RECORD_TYPE_DIR_RECORD: u64 = 9;
    const RECORD_TYPE_SHIFT: u64 = 60;
    const INODE_IS_DIR: u16 = 0x4000;
    const DT_DIR: u64 = 4;
    const MODE_OFF: usize = 0x50;
    const NCHILDREN_OFF: usize = 0x38;
    const INODE_VALUE_LEN: usize = 92;

    let mut block = vec![0u8; block_size as usize];
    write_object_header(&mut block, 0, FORMAT_XID, OBJECT_TYPE_BTREE_NODE | OBJ_PHYSICAL);

    const ROOT: u16 = 0x0001;
    const LEAF: u16 = 0x0002;
    let header_off = OBJ_HEADER_SIZE;
    block[header_off..header_off + 2].copy_from_slice(&(ROOT | LEAF).to_le_bytes());
    block[header_off + 4..header_off + 8].copy_from_slice(&2u32.to_le_bytes()); // nkeys
    block[header_off + 8..header_off + 10].copy_from_slice(&0u16.to_le_bytes()); // table_space.off
    block[header_off + 10..header_off + 12].copy_from_slice(&16u16.to_le_bytes()); // table_space.len: two 8-byte entries

    let toc_off = header_off + 24;
    let keys_off = toc_off + 16;

    // Entry 0: the root directory's inode. An 8-byte fixed-format key,
    // a 92-byte value (fields beyond `mode`/`nchildren` default to 0).
    block[toc_off..toc_off + 2].copy_from_slice(&0u16.to_le_bytes()); // k_off
    block[toc_off + 2..toc_off + 4].copy_from_slice(&8u16.to_le_bytes()); // k_len
    block[toc_off + 4..toc_off + 6].copy_from_slice(&100u16.to_le_bytes()); // v_off
    block[toc_off + 6..toc_off + 8].copy_from_slice(&(INODE_VALUE_LEN as u16).to_le_bytes()); // v_len

    // Entry 1: the directory's "self" dentry. A 16-byte key (8-byte
    // header plus a 4-byte name and its 4-byte hash), an 8-byte value.
    block[toc_off + 8..toc_off + 10].copy_from_slice(&8u16.to_le_bytes()); // k_off
    block[toc_off + 10..toc_off + 12].copy_from_slice(&16u16.to_le_bytes()); // k_len
    block[toc_off + 12..toc_off + 14].copy_from_slice(&8u16.to_le_bytes()); // v_off
    block[toc_off + 14..toc_off + 16].copy_from_slice(&8u16.to_le_bytes()); // v_len

    let inode_key = (RECORD_TYPE_INODE << RECORD_TYPE_SHIFT) | ROOT_DIR_CNID;
    block[keys_off..keys_off + 8].copy_from_slice(&inode_key.to_le_bytes());

    let dentry_key = (RECORD_TYPE_DIR_RECORD << RECORD_TYPE_SHIFT) | ROOT_DIR_CNID;
    block[keys_off + 8..keys_off + 16].copy_from_slice(&dentry_key.to_le_bytes());
    let name = b"self";
    block[keys_off + 16..keys_off + 20].copy_from_slice(name);
    let hash = dentry_name_hash("self");
    block[keys_off + 20..keys_off + 24].copy_from_slice(&hash.to_le_bytes());

    const FOOTER_SIZE: usize = 40;
    let footer_off = block_size as usize - FOOTER_SIZE;
    let val_base = footer_off;

    let dentry_val_off = val_base - 8;
    let file_id_and_type = ROOT_DIR_CNID | (DT_DIR << RECORD_TYPE_SHIFT);
    block[dentry_val_off..dentry_val_off + 8].copy_from_slice(&file_id_and_type.to_le_bytes());

    let inode_val_off = val_base - INODE_VALUE_LEN;
    block[inode_val_off + MODE_OFF..inode_val_off + MODE_OFF + 2].copy_from_slice(&INODE_IS_DIR.to_le_bytes());
    block[inode_val_off + NCHILDREN_OFF..inode_val_off + NCHILDREN_OFF + 4].copy_from_slice(&1u32.to_le_bytes());

    block[footer_off..footer_off + 4].copy_from_slice(&0u32.to_le_bytes()); // flags
    block[footer_off + 4..footer_off + 8].copy_from_slice(&block_size.to_le_bytes());
    block[footer_off + 8..footer_off + 12].copy_from_slice(&0u32.to_le_bytes()); // key_size: variable
    block[footer_off + 12..footer_off + 16].copy_from_slice(&0u32.to_le_bytes()); // val_size: variable
    block[footer_off + 16..footer_off + 20].copy_from_slice(&16u32.to_le_bytes()); // longest_key
    block[footer_off + 20..footer_off + 24].copy_from_slice(&(INODE_VALUE_LEN as u32).to_le_bytes()); // longest_val
    block[footer_off + 24..footer_off + 32].copy_from_slice(&2u64.to_le_bytes()); // key_count
    block[footer_off + 32..footer_off + 40].copy_from_slice(&1u64.to_le_bytes()); // node_count

    finish_and_write(device, bno, block)
}

fn write_main_cib(device: &mut dyn BlockDevice, cib_bno: u64, bitmap_bno: u64, block_count: u64, block_size: u32) -> CheckResult<()> {
    let mut block = vec![0u8; block_size as usize];
    write_object_header(&mut block, 0, FORMAT_XID, OBJECT_TYPE_SPACEMAN_CIB | OBJ_PHYSICAL);

    block[OBJ_HEADER_SIZE..OBJ_HEADER_SIZE + 4].copy_from_slice(&1u32.to_le_bytes()); // chunk_info_count

    let entry_off = OBJ_HEADER_SIZE + 8;
    block[entry_off..entry_off + 8].copy_from_slice(&bitmap_bno.to_le_bytes());
    block[entry_off + 8..entry_off + 12].copy_from_slice(&(block_count as u32).to_le_bytes());
    block[entry_off + 12..entry_off + 16].copy_from_slice(&(block_count as u32).to_le_bytes()); // free_count: unchecked

    finish_and_write(device, cib_bno, block)
}

fn write_zero_bitmap_block(device: &mut dyn BlockDevice, bitmap_bno: u64, block_size: u32) -> CheckResult<()> {
    let mut block = vec![0u8; block_size as usize];
    write_object_header(&mut block, 0, FORMAT_XID, OBJECT_TYPE_SPACEMAN_BITMAP | OBJ_PHYSICAL);
    finish_and_write(device, bitmap_bno, block)
}

/// Writes the internal-pool bitmap ring's single metadata block: a
/// one-block pool with one used slot (the ring block itself) and an
/// empty free list.
fn write_ip_ring(device: &mut dyn BlockDevice, ring_bno: u64, container_xid: u64, block_size: u32) -> CheckResult<()> {
    let mut block = vec![0u8; block_size as usize];
    write_object_header(&mut block, 0, FORMAT_XID, OBJECT_TYPE_SPACEMAN_BITMAP | OBJ_PHYSICAL);

    let o = OBJ_HEADER_SIZE;
    block[o..o + 4].copy_from_slice(&1u32.to_le_bytes()); // ring_len
    block[o + 4..o + 8].copy_from_slice(&1u32.to_le_bytes()); // bm_size_in_blocks
    block[o + 8..o + 10].copy_from_slice(&0xFFFFu16.to_le_bytes()); // free_head: empty free list
    block[o + 10..o + 12].copy_from_slice(&0u16.to_le_bytes()); // free_next_count
    block[o + 12..o + 14].copy_from_slice(&0u16.to_le_bytes()); // offsets[0]: the one used slot
    block[o + 14..o + 22].copy_from_slice(&container_xid.to_le_bytes()); // xids[0]

    finish_and_write(device, ring_bno, block)
}

#[allow(clippy::too_many_arguments)]
fn write_spaceman(
    device: &mut dyn BlockDevice,
    bno: u64,
    block_count: u64,
    cib_count: u32,
    cab_count: u32,
    main_cib_bno: u64,
    ip_ring_bno: u64,
    block_size: u32,
) -> CheckResult<()> {
    let mut block = vec![0u8; block_size as usize];
    write_object_header(&mut block, bno, FORMAT_XID, OBJECT_TYPE_SPACEMAN | OBJ_EPHEMERAL);

    let body_off = OBJ_HEADER_SIZE;
    block[body_off..body_off + 4].copy_from_slice(&block_size.to_le_bytes());

    let dev_off = body_off + 0x70;
    block[dev_off..dev_off + 8].copy_from_slice(&block_count.to_le_bytes());
    block[dev_off + 8..dev_off + 16].copy_from_slice(&1u64.to_le_bytes()); // chunk_count
    block[dev_off + 16..dev_off + 20].copy_from_slice(&cib_count.to_le_bytes());
    block[dev_off + 20..dev_off + 24].copy_from_slice(&cab_count.to_le_bytes());
    block[dev_off + 24..dev_off + 32].copy_from_slice(&block_count.to_le_bytes()); // free_count: unchecked

    let ip_off = body_off + 0x120;
    block[ip_off..ip_off + 8].copy_from_slice(&ip_ring_bno.to_le_bytes()); // ip_base
    block[ip_off + 8..ip_off + 16].copy_from_slice(&1u64.to_le_bytes()); // ip_block_count

    let reconcile_off = body_off + 0x130;
    block[reconcile_off..reconcile_off + 8].copy_from_slice(&main_cib_bno.to_le_bytes());
    block[reconcile_off + 8..reconcile_off + 16].copy_from_slice(&0u64.to_le_bytes()); // tier2_cib_bno
    block[reconcile_off + 16..reconcile_off + 24].copy_from_slice(&ip_ring_bno.to_le_bytes());
    block[reconcile_off + 24..reconcile_off + 32].copy_from_slice(&0u64.to_le_bytes()); // ip_free_queue_oid
    block[reconcile_off + 32..reconcile_off + 40].copy_from_slice(&0u64.to_le_bytes()); // main_free_queue_oid
    block[reconcile_off + 40..reconcile_off + 48].copy_from_slice(&0u64.to_le_bytes()); // tier2_free_queue_oid

    finish_and_write(device, bno, block)
}

const _: () = {
    // fs_oid array length sanity: the formatter only ever populates the
    // first slot of a fresh container.
    assert!(NX_MAX_FILE_SYSTEMS >= 1);
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::{Checker, Options};
    use block_device::memory::MemoryBlockDevice;

    #[test]
    fn checkpoint_rings_follow_the_documented_steps() {
        assert_eq!(checkpoint_ring_sizes(1024, 4096), (8, 8)); // 4 MiB image
        assert_eq!(checkpoint_ring_sizes(300_000, 4096), (12, 12)); // ~1.1 GiB
    }

    #[test]
    fn max_volumes_caps_at_one_hundred() {
        assert_eq!(max_volumes_for(1024 * 1024 * 1024 * 1024), 100);
        assert_eq!(max_volumes_for(512 * 1024 * 1024), 1);
    }

    #[test]
    fn cib_counts_scale_with_chunk_count() {
        let (cib, _cab) = cib_cab_counts(4, 4096);
        assert_eq!(cib, 1);
        let (cib, cab) = cib_cab_counts(100_000, 4096);
        assert!(cib > 1);
        assert!(cab >= 0);
    }

    #[test]
    fn a_freshly_formatted_container_passes_the_checker() {
        let block_size = 4096u32;
        let block_count = 1040u64;
        let mut device = MemoryBlockDevice::new(block_count * block_size as u64, block_size);

        format_container(&mut device as &mut dyn BlockDevice, &FormatOptions::default()).expect("format_container");

        let mut checker = Checker::open(&mut device as &mut dyn BlockDevice, Options::default()).expect("Checker::open");
        checker.check_all_volumes(&mut device as &mut dyn BlockDevice).expect("check_all_volumes");
    }
}
