//! Per-kind audit-table entries. The reference implementation overlays
//! these into one `htable_entry` union; here each kind gets its own
//! struct and its own table, trading a little repetition for no unsafe
//! casts.

#[derive(Debug, Clone, Default)]
pub struct InodeEntry {
    pub ino: u64,
    pub mode: u16,
    pub declared_nlink_or_nchildren: u32,
    pub size: u64,
    pub alloced_size: u64,
    pub sparse_bytes: u64,
    pub flags: u64,
    pub rdev: u32,
    pub private_id: u64,
    pub name: Option<String>,
    pub first_name: Option<String>,
    pub xattr_bitmap: u64,
    pub child_count: u64,
    pub link_count: u64,
    pub has_dstream: bool,
    pub is_directory: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DstreamEntry {
    pub id: u64,
    /// Owning inode's cnid, filled in by the inode record that first
    /// references this dstream; needed to key fext-tree lookups.
    pub cnid: u64,
    pub declared_refcnt: u64,
    pub references: u64,
    pub size: u64,
    pub alloced_size: u64,
    pub bytes: u64,
    pub sparse_bytes: u64,
    pub seen: bool,
    /// Sorted, deduplicated by physical block number.
    pub extents: Vec<(u64, u64)>,
}

#[derive(Debug, Clone, Default)]
pub struct ExtentEntry {
    pub first_bno: u64,
    pub blocks: u64,
    pub declared_refcnt: u64,
    pub references: u64,
    pub total_refcnt: Option<u64>,
    pub latest_owner: u64,
}

#[derive(Debug, Clone, Default)]
pub struct CryptoStateEntry {
    pub id: u64,
    pub declared_refcnt: u64,
    pub references: u64,
    pub keylen: u32,
}

#[derive(Debug, Clone, Default)]
pub struct SiblingEntry {
    pub id: u64,
    pub parent_ino: u64,
    pub name: String,
    pub checked: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SnapshotEntry {
    pub xid: u64,
    pub meta_seen: bool,
    pub name_seen: bool,
    pub meta_name: Option<String>,
}
