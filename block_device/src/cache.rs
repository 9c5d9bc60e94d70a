use std::num::NonZeroUsize;

use anyhow::Result;
use lru::LruCache;

use crate::BlockDevice;

/// Wraps any `BlockDevice` with an LRU cache of single-block reads. The
/// B-tree engine re-reads the same nodes constantly during a query
/// (root -> child -> child), so this pays for itself on any nontrivial
/// image. Writes invalidate the cached copy of the blocks they touch.
pub struct CachingBlockDevice<T: BlockDevice> {
    inner: T,
    cache: LruCache<u64, Vec<u8>>,
}

impl<T: BlockDevice> CachingBlockDevice<T> {
    pub fn new(inner: T, capacity: usize) -> Self {
        Self {
            inner,
            cache: LruCache::new(NonZeroUsize::new(capacity.max(1)).unwrap()),
        }
    }
}

impl<T: BlockDevice> BlockDevice for CachingBlockDevice<T> {
    fn block_size(&self) -> u32 {
        self.inner.block_size()
    }

    fn byte_len(&self) -> u64 {
        self.inner.byte_len()
    }

    fn read(&mut self, bno: u64, nblocks: u32) -> Result<Vec<u8>> {
        if nblocks != 1 {
            // Multi-block reads bypass the cache; the object layer only
            // ever reads one block at a time anyway.
            return self.inner.read(bno, nblocks);
        }
        if let Some(cached) = self.cache.get(&bno) {
            return Ok(cached.clone());
        }
        let data = self.inner.read(bno, 1)?;
        self.cache.put(bno, data.clone());
        Ok(data)
    }

    fn pread(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.inner.pread(offset, len)
    }

    fn write(&mut self, bno: u64, buf: &[u8]) -> Result<()> {
        self.cache.pop(&bno);
        self.inner.write(bno, buf)
    }
}
