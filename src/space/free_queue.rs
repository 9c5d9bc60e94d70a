//! The three free queues (`IP`, `MAIN`, `TIER2`): B-trees of `(xid,
//! paddr) -> length?` deferring block reuse until older checkpoints
//! expire. A zero-length value is a "ghost" record for a single block.

use std::cmp::Ordering;

use zerocopy::{AsBytes, FromBytes, Unaligned};

use block_device::BlockDevice;

use crate::btree::{walk_in_order, Node};
use crate::error::{CheckError, CheckResult};
use crate::space::{ip_fq_node_limit, main_fq_node_limit, SpaceManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeQueueKind {
    Ip,
    Main,
    Tier2,
}

#[derive(Debug, Clone, Copy, Default, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
struct FreeQueueKeyRaw {
    xid: u64,
    paddr: u64,
}

fn fq_keycmp(a: &[u8], b: &[u8]) -> Ordering {
    let ka = FreeQueueKeyRaw::read_from(a).expect("free-queue key is 16 bytes");
    let kb = FreeQueueKeyRaw::read_from(b).expect("free-queue key is 16 bytes");
    (ka.xid, ka.paddr).cmp(&(kb.xid, kb.paddr))
}

pub struct FreeQueue {
    pub kind: FreeQueueKind,
    pub root: Node,
    pub node_count_limit: u64,
    pub container_xid: u64,
}

impl FreeQueue {
    pub fn new(kind: FreeQueueKind, root: Node, container_xid: u64, ip_block_count: u64, total_block_count: u64) -> Self {
        let node_count_limit = match kind {
            FreeQueueKind::Ip => ip_fq_node_limit(ip_block_count),
            FreeQueueKind::Main | FreeQueueKind::Tier2 => main_fq_node_limit(total_block_count),
        };
        FreeQueue { kind, root, node_count_limit, container_xid }
    }

    /// Walks every entry, marking the covered range used in `spaceman`'s
    /// bitmaps (deferred frees still count as used), and checking each
    /// entry's range against the kind-specific containment rule.
    pub fn walk_and_mark(&self, device: &mut dyn BlockDevice, spaceman: &mut SpaceManager) -> CheckResult<()> {
        let mut error: Option<CheckError> = None;
        {
            let mut visit = |node: &Node, slice: &crate::btree::RecordSlice| -> CheckResult<()> {
                let key = FreeQueueKeyRaw::read_from(node.key_bytes(slice)).ok_or_else(|| CheckError::corruption("free queue", "malformed key"))?;
                let val = node.val_bytes(slice);
                let length = if val.len() >= 8 { u64::from_le_bytes(val[0..8].try_into().unwrap()) } else { 1 };
                let length = length.max(1);

                let in_ip = spaceman.block_in_ip(key.paddr);
                match self.kind {
                    FreeQueueKind::Ip if !in_ip => {
                        error = Some(CheckError::corruption("free queue", "IP queue entry lies outside the internal pool"));
                        return Ok(());
                    }
                    FreeQueueKind::Main | FreeQueueKind::Tier2 if in_ip => {
                        error = Some(CheckError::corruption("free queue", "non-IP queue entry lies inside the internal pool"));
                        return Ok(());
                    }
                    _ => {}
                }

                let mark_result = if self.kind == FreeQueueKind::Ip {
                    spaceman.mark_ip_used(key.paddr, length)
                } else {
                    spaceman.mark_main_used(key.paddr, length, self.kind == FreeQueueKind::Tier2)
                };
                if let Err(e) = mark_result {
                    error = Some(e);
                }
                Ok(())
            };
            let tally = walk_in_order(device, self.container_xid, &self.root, 0, 0, &fq_keycmp, &mut visit)?;
            if tally.node_count > self.node_count_limit {
                return Err(CheckError::corruption(
                    "free queue",
                    format!("node count {} exceeds the documented limit of {}", tally.node_count, self.node_count_limit),
                ));
            }
        }
        if let Some(e) = error {
            return Err(e);
        }
        Ok(())
    }
}
