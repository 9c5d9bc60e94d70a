//! The query protocol that walks a B-tree: a full in-order traversal
//! (used by every tree the checker validates end-to-end) and a targeted
//! bisection query supporting exact and multi-match lookups (used by
//! `apfs-label`'s omap lookup and by the sealed-volume/extent-reference
//! spot checks that consult a tree without walking all of it).
//!
//! Per the specification, descending into a non-leaf record's child
//! always reads that child as a physical block (`oid == bno`); only the
//! root of a virtual tree is resolved once, up front, through an object
//! map. This matches the reference checker, whose node reader takes a
//! raw block number at every level of descent.

use std::cmp::Ordering;

use block_device::BlockDevice;

use crate::btree::node::{Node, RecordSlice, MAX_TREE_DEPTH};
use crate::error::{CheckError, CheckResult};
use crate::object::{read_object, Resolution};

pub type KeyCmp<'a> = &'a dyn Fn(&[u8], &[u8]) -> Ordering;

/// Reads the node at physical block `bno`, verifying it really is a
/// physical object (`oid == bno`) as every non-root B-tree node must be.
pub fn read_child_node(device: &mut dyn BlockDevice, container_xid: u64, bno: u64) -> CheckResult<Node> {
    let object = read_object(device, bno, container_xid, Resolution::Physical)?;
    Node::from_object(&object)
}

/// Running totals accumulated while walking a subtree, checked against
/// the root's footer once the walk completes.
#[derive(Debug, Clone, Copy, Default)]
pub struct WalkTally {
    pub node_count: u64,
    pub key_count: u64,
    pub longest_key: u32,
    pub longest_val: u32,
}

impl WalkTally {
    fn absorb_node(&mut self, node: &Node) {
        self.node_count += 1;
        self.key_count += node.nkeys as u64;
    }

    fn absorb_record(&mut self, slice: &RecordSlice) {
        self.longest_key = self.longest_key.max(slice.key_len as u32);
        self.longest_val = self.longest_val.max(slice.val_len as u32);
    }
}

/// Recursively walks every record of `root` in key order, calling
/// `visit` for each leaf record. Checks that sibling keys strictly
/// ascend, that leaf keys are unique, and that recursion stays within
/// the documented depth bound.
pub fn walk_in_order<F>(
    device: &mut dyn BlockDevice,
    container_xid: u64,
    root: &Node,
    fixed_key_size: u32,
    fixed_val_size: u32,
    keycmp: KeyCmp,
    visit: &mut F,
) -> CheckResult<WalkTally>
where
    F: FnMut(&Node, &RecordSlice) -> CheckResult<()>,
{
    let mut tally = WalkTally::default();
    let mut last_key: Option<Vec<u8>> = None;
    walk_node(device, container_xid, root, fixed_key_size, fixed_val_size, keycmp, visit, &mut tally, &mut last_key, 0)?;
    Ok(tally)
}

#[allow(clippy::too_many_arguments)]
fn walk_node<F>(
    device: &mut dyn BlockDevice,
    container_xid: u64,
    node: &Node,
    fixed_key_size: u32,
    fixed_val_size: u32,
    keycmp: KeyCmp,
    visit: &mut F,
    tally: &mut WalkTally,
    last_key: &mut Option<Vec<u8>>,
    depth: u32,
) -> CheckResult<()>
where
    F: FnMut(&Node, &RecordSlice) -> CheckResult<()>,
{
    if depth > MAX_TREE_DEPTH {
        return Err(CheckError::corruption("B-tree", "tree depth exceeds the documented bound of 12"));
    }
    tally.absorb_node(node);

    for i in 0..node.nkeys {
        let slice = node.record(i, fixed_key_size, fixed_val_size)?;
        tally.absorb_record(&slice);
        let key = node.key_bytes(&slice).to_vec();

        if let Some(prev) = last_key.as_ref() {
            match keycmp(prev, &key) {
                Ordering::Greater => return Err(CheckError::corruption("B-tree", "sibling keys are out of order")),
                Ordering::Equal if node.is_leaf => {
                    return Err(CheckError::corruption("B-tree", "leaf keys are repeated"))
                }
                _ => {}
            }
        }
        *last_key = Some(key);

        if node.is_leaf {
            visit(node, &slice)?;
        } else {
            let child_bno = node.child_oid(&slice)?;
            let child = read_child_node(device, container_xid, child_bno)?;
            walk_node(device, container_xid, &child, fixed_key_size, fixed_val_size, keycmp, visit, tally, last_key, depth + 1)?;
        }
    }
    Ok(())
}

/// Bisects `node` for the floor of `key` (the greatest record key that is
/// `<= key`), and separately reports whether an exact match was found.
fn bisect(node: &Node, key: &[u8], keycmp: KeyCmp, fixed_key_size: u32, fixed_val_size: u32) -> CheckResult<(Option<u32>, Option<u32>)> {
    if node.nkeys == 0 {
        return Ok((None, None));
    }
    let mut lo: i64 = 0;
    let mut hi: i64 = node.nkeys as i64 - 1;
    let mut floor_idx: Option<u32> = None;
    let mut exact_idx: Option<u32> = None;

    while lo <= hi {
        let mid = lo + (hi - lo) / 2;
        let slice = node.record(mid as u32, fixed_key_size, fixed_val_size)?;
        let candidate = node.key_bytes(&slice);
        match keycmp(candidate, key) {
            Ordering::Equal => {
                floor_idx = Some(mid as u32);
                exact_idx = Some(mid as u32);
                break;
            }
            Ordering::Less => {
                floor_idx = Some(mid as u32);
                lo = mid + 1;
            }
            Ordering::Greater => {
                hi = mid - 1;
            }
        }
    }
    Ok((floor_idx, exact_idx))
}

/// Single-match query (default mode): finds the exact key, or (when
/// `exact` is false) the floor of `key` -- the greatest record `<= key`.
/// This is what the object map uses to find the record for an oid with
/// the greatest xid not exceeding the one requested.
#[allow(clippy::too_many_arguments)]
pub fn single_lookup(
    device: &mut dyn BlockDevice,
    container_xid: u64,
    root: &Node,
    key: &[u8],
    exact: bool,
    fixed_key_size: u32,
    fixed_val_size: u32,
    keycmp: KeyCmp,
) -> CheckResult<Option<(Vec<u8>, Vec<u8>)>> {
    descend(device, container_xid, root, key, exact, fixed_key_size, fixed_val_size, keycmp, 0)
}

#[allow(clippy::too_many_arguments)]
fn descend(
    device: &mut dyn BlockDevice,
    container_xid: u64,
    node: &Node,
    key: &[u8],
    exact: bool,
    fixed_key_size: u32,
    fixed_val_size: u32,
    keycmp: KeyCmp,
    depth: u32,
) -> CheckResult<Option<(Vec<u8>, Vec<u8>)>> {
    if depth > MAX_TREE_DEPTH {
        return Err(CheckError::corruption("B-tree", "tree depth exceeds the documented bound of 12"));
    }
    let (floor_idx, exact_idx) = bisect(node, key, keycmp, fixed_key_size, fixed_val_size)?;

    if node.is_leaf {
        let idx = if exact { exact_idx } else { floor_idx };
        return match idx {
            Some(i) => {
                let slice = node.record(i, fixed_key_size, fixed_val_size)?;
                Ok(Some((node.key_bytes(&slice).to_vec(), node.val_bytes(&slice).to_vec())))
            }
            None => Ok(None),
        };
    }

    match floor_idx {
        None => Ok(None),
        Some(i) => {
            let slice = node.record(i, fixed_key_size, fixed_val_size)?;
            let child_bno = node.child_oid(&slice)?;
            let child = read_child_node(device, container_xid, child_bno)?;
            descend(device, container_xid, &child, key, exact, fixed_key_size, fixed_val_size, keycmp, depth + 1)
        }
    }
}

/// Multi-match query: returns every record whose key the caller's
/// `prefix` predicate accepts. Used for the handful of lookups that
/// consult a tree without a full in-order walk (the fext tree during
/// sealed-volume verification, the extent-reference tree when cross
/// checking a physical extent's total refcount).
#[allow(clippy::too_many_arguments)]
pub fn multi_lookup(
    device: &mut dyn BlockDevice,
    container_xid: u64,
    root: &Node,
    seek_key: &[u8],
    prefix: &dyn Fn(&[u8]) -> bool,
    fixed_key_size: u32,
    fixed_val_size: u32,
    keycmp: KeyCmp,
) -> CheckResult<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut out = Vec::new();
    collect_multi(device, container_xid, root, seek_key, prefix, fixed_key_size, fixed_val_size, keycmp, &mut out, 0)?;
    Ok(out)
}

#[allow(clippy::too_many_arguments)]
fn collect_multi(
    device: &mut dyn BlockDevice,
    container_xid: u64,
    node: &Node,
    seek_key: &[u8],
    prefix: &dyn Fn(&[u8]) -> bool,
    fixed_key_size: u32,
    fixed_val_size: u32,
    keycmp: KeyCmp,
    out: &mut Vec<(Vec<u8>, Vec<u8>)>,
    depth: u32,
) -> CheckResult<()> {
    if depth > MAX_TREE_DEPTH {
        return Err(CheckError::corruption("B-tree", "tree depth exceeds the documented bound of 12"));
    }
    let (floor_idx, _) = bisect(node, seek_key, keycmp, fixed_key_size, fixed_val_size)?;

    if node.is_leaf {
        // From the floor, walk backwards to the first matching record,
        // then forwards while the prefix still matches (QUERY_NEXT until
        // -EAGAIN, in the reference implementation's terms).
        let mut start = match floor_idx {
            Some(i) => i,
            None => return Ok(()),
        };
        loop {
            let slice = node.record(start, fixed_key_size, fixed_val_size)?;
            if !prefix(node.key_bytes(&slice)) {
                break;
            }
            if start == 0 {
                break;
            }
            start -= 1;
        }
        // `start` now under- or exactly-shoots the first match; re-check
        // it before walking forward.
        for i in start..node.nkeys {
            let slice = node.record(i, fixed_key_size, fixed_val_size)?;
            if !prefix(node.key_bytes(&slice)) {
                if i > start {
                    break;
                }
                continue;
            }
            out.push((node.key_bytes(&slice).to_vec(), node.val_bytes(&slice).to_vec()));
        }
        return Ok(());
    }

    // Non-leaf: the matching range may span more than one child, so
    // follow the floor child and keep going right while children could
    // still contain matches.
    let start_idx = floor_idx.unwrap_or(0);
    for i in start_idx..node.nkeys {
        let slice = node.record(i, fixed_key_size, fixed_val_size)?;
        if i > start_idx && !prefix(node.key_bytes(&slice)) {
            break;
        }
        let child_bno = node.child_oid(&slice)?;
        let child = read_child_node(device, container_xid, child_bno)?;
        let before = out.len();
        collect_multi(device, container_xid, &child, seek_key, prefix, fixed_key_size, fixed_val_size, keycmp, out, depth + 1)?;
        if out.len() == before && i > start_idx {
            break;
        }
    }
    Ok(())
}
