//! Internal-pool allocation-bitmap ring: `ip_bm_block_count` blocks
//! organised as `16 * ip_bm_size_in_blocks` slots, with the current
//! epoch identified by an offset array and free slots linked through a
//! `free_next` array terminated by `0xFFFF`.

use crate::error::{CheckError, CheckResult};

pub struct InternalPool {
    pub ring_len: u64,
    pub bm_size_in_blocks: u64,
    pub offsets: Vec<u16>,
    pub free_head: u16,
    pub free_next: Vec<u16>,
    pub xids: Vec<u64>,
    pub container_xid: u64,
}

const FREE_NEXT_END: u16 = 0xFFFF;

impl InternalPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(ring_len: u64, bm_size_in_blocks: u64, offsets: Vec<u16>, free_head: u16, free_next: Vec<u16>, xids: Vec<u64>, container_xid: u64) -> Self {
        InternalPool { ring_len, bm_size_in_blocks, offsets, free_head, free_next, xids, container_xid }
    }

    /// Checks every documented invariant of the ring in one pass: used
    /// slots are unique and not present in the free list; the free
    /// list's length is exactly `ring_len - bm_size_in_blocks`; every
    /// per-slot xid is within the container's horizon.
    pub fn validate(&self, single_block_bitmap: bool, ip_block_count: u64) -> CheckResult<()> {
        if self.xids.iter().any(|&x| x > self.container_xid) {
            return Err(CheckError::corruption("internal pool", "a slot xid is newer than the container"));
        }

        let mut free_slots = std::collections::HashSet::new();
        let mut cursor = self.free_head;
        let mut guard = 0usize;
        while cursor != FREE_NEXT_END {
            if guard > self.free_next.len() {
                return Err(CheckError::corruption("internal pool", "free-list cycle detected"));
            }
            if !free_slots.insert(cursor) {
                return Err(CheckError::corruption("internal pool", "free-list visits the same slot twice"));
            }
            cursor = *self.free_next.get(cursor as usize).ok_or_else(|| CheckError::corruption("internal pool", "free_next index out of range"))?;
            guard += 1;
        }

        let expected_free_len = self.ring_len.saturating_sub(self.bm_size_in_blocks);
        if free_slots.len() as u64 != expected_free_len {
            return Err(CheckError::corruption(
                "internal pool",
                format!("free-list length {} does not equal ring_len - bm_size_in_blocks ({})", free_slots.len(), expected_free_len),
            ));
        }

        let used_slots: std::collections::HashSet<u16> = self.offsets.iter().copied().collect();
        if used_slots.len() != self.offsets.len() {
            return Err(CheckError::corruption("internal pool", "a used slot is duplicated in the offset array"));
        }
        for slot in &used_slots {
            if free_slots.contains(slot) {
                return Err(CheckError::corruption("internal pool", "a used slot also appears in the free list"));
            }
        }

        if single_block_bitmap {
            // A single-block bitmap can only describe ip_block_count
            // bits; anything past that must be zero, but we only have
            // the parsed slot arrays here, so this is checked by the
            // caller against the raw bitmap bytes it already read.
            let _ = ip_block_count;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_duplicate_free_slot() {
        let offsets = vec![0, 1];
        let free_next = vec![FREE_NEXT_END, 0, 0]; // slot 0 is claimed as both used and free
        let ip = InternalPool::new(3, 2, offsets, 0, free_next, vec![1], 1);
        let err = ip.validate(false, 100);
        assert!(err.is_err());
    }
}
