//! Generic B-tree node: parsing the header/table-of-contents/footer and
//! slicing out individual key/value byte ranges. The same node shape is
//! used polymorphically as an object map, a catalog, a free-space queue,
//! and the other auxiliary indexes described in the specification.

use zerocopy::{AsBytes, FromBytes, Unaligned};

use crate::error::{CheckError, CheckResult};
use crate::object::Object;
use crate::types::OBJ_HEADER_SIZE;

pub const BTNODE_ROOT: u16 = 0x0001;
pub const BTNODE_LEAF: u16 = 0x0002;
pub const BTNODE_FIXED_KV_SIZE: u16 = 0x0004;
pub const BTNODE_HASHED: u16 = 0x0008;
pub const BTNODE_NOHEADER: u16 = 0x0010;
pub const BTNODE_CHECK_KOFF_INVAL: u16 = 0x8000;

/// Node header fields following the 32-byte object header.
#[derive(Debug, Clone, Copy, Default, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
struct NodeHeaderRaw {
    flags: u16,
    level: u16,
    nkeys: u32,
    table_space_off: u16,
    table_space_len: u16,
    free_space_off: u16,
    free_space_len: u16,
    key_free_list_off: u16,
    key_free_list_len: u16,
    val_free_list_off: u16,
    val_free_list_len: u16,
}

pub const NODE_HEADER_SIZE: usize = OBJ_HEADER_SIZE + std::mem::size_of::<NodeHeaderRaw>();

/// The footer a root node carries after its last record: running totals
/// the whole tree must add up to, checked once the full subtree has been
/// walked.
#[derive(Debug, Clone, Copy, Default, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct BtreeFooter {
    pub flags: u32,
    pub node_size: u32,
    pub key_size: u32,
    pub val_size: u32,
    pub longest_key: u32,
    pub longest_val: u32,
    pub key_count: u64,
    pub node_count: u64,
}

pub const FOOTER_SIZE: usize = std::mem::size_of::<BtreeFooter>();

/// Maximum sane tree depth; guards against malformed cycles.
pub const MAX_TREE_DEPTH: u32 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordSlice {
    pub key_off: usize,
    pub key_len: usize,
    pub val_off: usize,
    pub val_len: usize,
}

/// A single parsed B-tree node: owns the whole block's bytes and knows how
/// to slice out any record by index.
pub struct Node {
    pub bno: u64,
    pub level: u16,
    pub nkeys: u32,
    pub is_root: bool,
    pub is_leaf: bool,
    pub fixed_kv: bool,
    pub block_size: usize,
    pub data: Vec<u8>,
    toc_start: usize,
    toc_len: usize,
    keys_area_start: usize,
    val_base: usize,
    pub footer: Option<BtreeFooter>,
}

impl Node {
    /// Parses a node out of an already-checksum-verified `Object`.
    pub fn from_object(object: &Object) -> CheckResult<Node> {
        let block_size = object.bytes.len();
        let data = object.bytes.clone();
        Self::parse(data, object.block_nr, block_size)
    }

    pub fn parse(data: Vec<u8>, bno: u64, block_size: usize) -> CheckResult<Node> {
        if data.len() < NODE_HEADER_SIZE {
            return Err(CheckError::corruption("B-tree", format!("node at block {} is too small for a header", bno)));
        }
        let raw = NodeHeaderRaw::read_from(&data[OBJ_HEADER_SIZE..NODE_HEADER_SIZE])
            .ok_or_else(|| CheckError::corruption("B-tree", "malformed node header"))?;

        if raw.nkeys == 0 {
            return Err(CheckError::corruption("B-tree", "empty nodes are forbidden (a multi-match query could loop)"));
        }

        let is_root = raw.flags & BTNODE_ROOT != 0;
        let is_leaf = raw.flags & BTNODE_LEAF != 0;
        let fixed_kv = raw.flags & BTNODE_FIXED_KV_SIZE != 0;

        let toc_start = NODE_HEADER_SIZE + raw.table_space_off as usize;
        let toc_len = raw.table_space_len as usize;
        let keys_area_start = toc_start + toc_len;

        let footer = if is_root {
            if block_size < FOOTER_SIZE {
                return Err(CheckError::corruption("B-tree", "block too small to hold a root footer"));
            }
            let footer_start = block_size - FOOTER_SIZE;
            Some(
                BtreeFooter::read_from(&data[footer_start..])
                    .ok_or_else(|| CheckError::corruption("B-tree", "malformed root footer"))?,
            )
        } else {
            None
        };
        let val_base = if is_root { block_size - FOOTER_SIZE } else { block_size };

        let entry_size = if fixed_kv { 4 } else { 8 };
        if toc_start + toc_len > keys_area_start || keys_area_start > val_base {
            return Err(CheckError::corruption("B-tree", "table of contents overlaps the keys or values area"));
        }
        let index_capacity = keys_area_start.saturating_sub(NODE_HEADER_SIZE);
        if raw.nkeys as usize * entry_size > index_capacity {
            return Err(CheckError::corruption("B-tree", "record count does not fit in the table of contents"));
        }

        Ok(Node {
            bno,
            level: raw.level,
            nkeys: raw.nkeys,
            is_root,
            is_leaf,
            fixed_kv,
            block_size,
            data,
            toc_start,
            toc_len,
            keys_area_start,
            val_base,
            footer,
        })
    }

    /// Slices out record `index`, validating that its key/value ranges lie
    /// wholly inside the block and are nonzero-length.
    pub fn record(&self, index: u32, fixed_key_size: u32, fixed_val_size: u32) -> CheckResult<RecordSlice> {
        if index >= self.nkeys {
            return Err(CheckError::corruption("B-tree", "record index out of range"));
        }
        let slice = if self.fixed_kv {
            let entry_off = self.toc_start + index as usize * 4;
            let entry = &self.data[entry_off..entry_off + 4];
            let k_off = u16::from_le_bytes([entry[0], entry[1]]) as usize;
            let v_off = u16::from_le_bytes([entry[2], entry[3]]) as usize;
            RecordSlice {
                key_off: self.keys_area_start + k_off,
                key_len: fixed_key_size as usize,
                val_off: self.val_base.wrapping_sub(v_off),
                val_len: fixed_val_size as usize,
            }
        } else {
            let entry_off = self.toc_start + index as usize * 8;
            let entry = &self.data[entry_off..entry_off + 8];
            let k_off = u16::from_le_bytes([entry[0], entry[1]]) as usize;
            let k_len = u16::from_le_bytes([entry[2], entry[3]]) as usize;
            let v_off = u16::from_le_bytes([entry[4], entry[5]]) as usize;
            let v_len = u16::from_le_bytes([entry[6], entry[7]]) as usize;
            RecordSlice {
                key_off: self.keys_area_start + k_off,
                key_len: k_len,
                val_off: self.val_base.wrapping_sub(v_off),
                val_len: v_len,
            }
        };
        self.validate_slice(&slice)?;
        Ok(slice)
    }

    fn validate_slice(&self, slice: &RecordSlice) -> CheckResult<()> {
        if slice.key_len == 0 || slice.val_len == 0 {
            return Err(CheckError::corruption("B-tree", "a record has zero length"));
        }
        let key_end = slice.key_off.checked_add(slice.key_len);
        let val_end = slice.val_off.checked_add(slice.val_len);
        match (key_end, val_end) {
            (Some(ke), Some(ve)) if ke <= self.block_size && ve <= self.block_size => Ok(()),
            _ => Err(CheckError::corruption("B-tree", "record lies outside the block")),
        }
    }

    pub fn key_bytes(&self, slice: &RecordSlice) -> &[u8] {
        &self.data[slice.key_off..slice.key_off + slice.key_len]
    }

    pub fn val_bytes(&self, slice: &RecordSlice) -> &[u8] {
        &self.data[slice.val_off..slice.val_off + slice.val_len]
    }

    /// Child oid stored in a non-leaf record's value (always 8 bytes,
    /// regardless of whether the tree is fixed-kv).
    pub fn child_oid(&self, slice: &RecordSlice) -> CheckResult<u64> {
        if slice.val_len != 8 {
            return Err(CheckError::corruption("B-tree", "non-leaf value is not a single oid"));
        }
        let bytes = self.val_bytes(slice);
        Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;

    /// A node with no records, carrying only a footer, for exercising
    /// footer-comparison logic without a full on-disk layout.
    pub(crate) fn leaf_root_with_footer(footer: BtreeFooter) -> Node {
        Node {
            bno: 0,
            level: 0,
            nkeys: 0,
            is_root: true,
            is_leaf: true,
            fixed_kv: true,
            block_size: 4096,
            data: vec![0u8; 4096],
            toc_start: NODE_HEADER_SIZE,
            toc_len: 0,
            keys_area_start: NODE_HEADER_SIZE,
            val_base: 4096 - FOOTER_SIZE,
            footer: Some(footer),
        }
    }
}
