//! The generic B-tree: node parsing plus the query protocol that walks
//! it. Used polymorphically as the object map, the catalog, the free
//! queues, the extent-reference tree, the snapshot-metadata tree and the
//! fext tree -- every tree on disk is one of these nodes.

pub mod node;
pub mod query;

pub use node::{BtreeFooter, Node, RecordSlice, FOOTER_SIZE, MAX_TREE_DEPTH, NODE_HEADER_SIZE};
pub use query::{multi_lookup, read_child_node, single_lookup, walk_in_order, KeyCmp, WalkTally};

use crate::error::{CheckError, CheckResult};

/// Checks the tallies gathered by [`walk_in_order`] against the root's
/// footer. Only roots carry a footer; fixed-KV trees additionally check
/// that the declared per-entry sizes match what the caller expected.
pub fn validate_footer(root: &Node, tally: &WalkTally, fixed_key_size: Option<u32>, fixed_val_size: Option<u32>) -> CheckResult<()> {
    let footer = root.footer.ok_or_else(|| CheckError::corruption("B-tree", "root node has no footer"))?;

    if footer.node_count != tally.node_count {
        return Err(CheckError::corruption(
            "B-tree",
            format!("footer node_count {} does not match the {} nodes actually walked", footer.node_count, tally.node_count),
        ));
    }
    if footer.key_count != tally.key_count {
        return Err(CheckError::corruption(
            "B-tree",
            format!("footer key_count {} does not match the {} keys actually walked", footer.key_count, tally.key_count),
        ));
    }
    if footer.longest_key < tally.longest_key {
        return Err(CheckError::corruption("B-tree", "footer longest_key is smaller than an observed key"));
    }
    if footer.longest_val < tally.longest_val {
        return Err(CheckError::corruption("B-tree", "footer longest_val is smaller than an observed value"));
    }

    if root.fixed_kv {
        if let Some(expected) = fixed_key_size {
            if footer.key_size != expected {
                return Err(CheckError::corruption("B-tree", "fixed key_size does not match the expected constant"));
            }
        }
        if let Some(expected) = fixed_val_size {
            if footer.val_size != expected {
                return Err(CheckError::corruption("B-tree", "fixed val_size does not match the expected constant"));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn footer_mismatch_is_corruption() {
        let footer = BtreeFooter { flags: 0, node_size: 4096, key_size: 8, val_size: 16, longest_key: 8, longest_val: 16, key_count: 4, node_count: 2 };
        let root = node::tests_support::leaf_root_with_footer(footer);
        let tally = WalkTally { node_count: 2, key_count: 5, longest_key: 8, longest_val: 16 };
        let err = validate_footer(&root, &tally, None, None).unwrap_err();
        assert!(format!("{err}").contains("key_count"));
    }
}
