//! Object map: a `FIXED_KV_SIZE` B-tree of `(oid, xid) -> (paddr, flags,
//! size)`. Resolving a virtual object always goes through one of these.

use std::cmp::Ordering;

use zerocopy::{AsBytes, FromBytes, Unaligned};

use block_device::BlockDevice;

use crate::btree::{read_child_node, single_lookup, walk_in_order, Node};
use crate::error::{CheckError, CheckResult};
use crate::object::{read_object_nocheck, Object};
use crate::types::{self, OBJECT_TYPE_OMAP};

pub const OMAP_KEY_SIZE: u32 = 16;
pub const OMAP_VAL_SIZE: u32 = 16;

pub const OMAP_VAL_DELETED: u32 = 0x0000_0001;
pub const OMAP_VAL_SAVED: u32 = 0x0000_0002;
pub const OMAP_VAL_ENCRYPTED: u32 = 0x0000_0004;
pub const OMAP_VAL_NOHEADER: u32 = 0x0000_0008;
pub const OMAP_VAL_CRYPTO_GENERATION: u32 = 0x0000_0010;

pub const OMAP_MANUALLY_MANAGED: u32 = 0x0000_0001;
pub const OMAP_TYPE_PHYSICAL_BTREE: u32 = 0x0000_0001;

#[derive(Debug, Clone, Copy, Default, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
struct OmapKeyRaw {
    oid: u64,
    xid: u64,
}

#[derive(Debug, Clone, Copy, Default, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
struct OmapValRaw {
    flags: u32,
    size: u32,
    paddr: u64,
}

/// A resolved object-map entry.
#[derive(Debug, Clone, Copy)]
pub struct OmapRecord {
    pub xid: u64,
    pub paddr: u64,
    pub flags: u32,
    pub size: u32,
}

/// One object map tree, opened at its root node.
pub struct Omap {
    pub root: Node,
    pub tree_type: u32,
    pub container_xid: u64,
}

fn omap_keycmp(a: &[u8], b: &[u8]) -> Ordering {
    let ka = OmapKeyRaw::read_from(a).expect("omap key is 16 bytes");
    let kb = OmapKeyRaw::read_from(b).expect("omap key is 16 bytes");
    (ka.oid, ka.xid).cmp(&(kb.oid, kb.xid))
}

impl Omap {
    /// Opens the object map whose own object lives at physical block
    /// `bno`. The omap object itself is always physical, not virtual --
    /// it is the thing other objects are resolved through, so it cannot
    /// recursively depend on itself.
    pub fn open(device: &mut dyn BlockDevice, bno: u64, container_xid: u64) -> CheckResult<Omap> {
        let object = read_object_nocheck(device, bno)?;
        if object.header.type_code() != OBJECT_TYPE_OMAP {
            return Err(CheckError::corruption("object map", "object at the omap's block is not an omap"));
        }
        if object.header.xid == 0 || object.header.xid > container_xid {
            return Err(CheckError::corruption("object map", "omap xid is zero or newer than the container"));
        }
        Self::from_object(device, &object, container_xid)
    }

    fn from_object(device: &mut dyn BlockDevice, object: &Object, container_xid: u64) -> CheckResult<Omap> {
        let body = object.body();
        if body.len() < 16 {
            return Err(CheckError::corruption("object map", "omap phys struct is truncated"));
        }
        let tree_type = u32::from_le_bytes(body[0..4].try_into().unwrap());
        let tree_oid = u64::from_le_bytes(body[8..16].try_into().unwrap());
        let root_object = read_object_nocheck(device, tree_oid)?;
        if !types::verify_object_checksum(&root_object.bytes) {
            return Err(CheckError::corruption("object map", format!("bad checksum in block {:#x}", tree_oid)));
        }
        let root = Node::from_object(&root_object)?;
        Ok(Omap { root, tree_type, container_xid })
    }

    /// Finds the record for `oid` with the greatest `xid <= at_xid`.
    pub fn lookup(&mut self, device: &mut dyn BlockDevice, oid: u64, at_xid: u64) -> CheckResult<Option<OmapRecord>> {
        let seek_key = OmapKeyRaw { oid, xid: at_xid };
        let found = single_lookup(
            device,
            self.container_xid,
            &self.root,
            seek_key.as_bytes(),
            false,
            OMAP_KEY_SIZE,
            OMAP_VAL_SIZE,
            &omap_keycmp,
        )?;
        let Some((key_bytes, val_bytes)) = found else { return Ok(None) };
        let key = OmapKeyRaw::read_from(key_bytes.as_slice()).ok_or_else(|| CheckError::corruption("object map", "malformed key"))?;
        if key.oid != oid {
            // Floor landed on a smaller oid: no mapping for this one.
            return Ok(None);
        }
        let val = OmapValRaw::read_from(val_bytes.as_slice()).ok_or_else(|| CheckError::corruption("object map", "malformed value"))?;
        if val.flags & OMAP_VAL_DELETED != 0 {
            return Ok(None);
        }
        Ok(Some(OmapRecord { xid: key.xid, paddr: val.paddr, flags: val.flags, size: val.size }))
    }

    /// Walks every record in the map, marking each as visited in
    /// `mark_visited` (used by the `omap_record` audit table to prove
    /// every mapping is visited exactly once) and checking the footer.
    pub fn walk_all<F>(&self, device: &mut dyn BlockDevice, mut mark_visited: F) -> CheckResult<()>
    where
        F: FnMut(u64, u64) -> CheckResult<()>,
    {
        let mut visit = |node: &Node, slice: &crate::btree::RecordSlice| -> CheckResult<()> {
            let key = OmapKeyRaw::read_from(node.key_bytes(slice)).ok_or_else(|| CheckError::corruption("object map", "malformed key"))?;
            mark_visited(key.oid, key.xid)
        };
        let tally = walk_in_order(device, self.container_xid, &self.root, OMAP_KEY_SIZE, OMAP_VAL_SIZE, &omap_keycmp, &mut visit)?;
        crate::btree::validate_footer(&self.root, &tally, Some(OMAP_KEY_SIZE), Some(OMAP_VAL_SIZE))?;
        Ok(())
    }
}

/// Reads the child node of a non-leaf omap record (always a direct
/// physical block, never re-resolved through another omap).
pub fn omap_child(device: &mut dyn BlockDevice, container_xid: u64, bno: u64) -> CheckResult<Node> {
    read_child_node(device, container_xid, bno)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn omap_keys_order_by_oid_then_xid() {
        let a = OmapKeyRaw { oid: 5, xid: 10 };
        let b = OmapKeyRaw { oid: 5, xid: 20 };
        let c = OmapKeyRaw { oid: 6, xid: 1 };
        assert_eq!(omap_keycmp(a.as_bytes(), b.as_bytes()), Ordering::Less);
        assert_eq!(omap_keycmp(b.as_bytes(), c.as_bytes()), Ordering::Less);
        assert_eq!(omap_keycmp(a.as_bytes(), a.as_bytes()), Ordering::Equal);
    }
}
