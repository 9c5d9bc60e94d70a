use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use anyhow::{Context, Result};

use crate::BlockDevice;

/// A `BlockDevice` backed by a real file or block special device, opened
/// read-only unless `writable` is requested (the formatter needs to write).
pub struct FileBlockDevice {
    file: File,
    block_size: u32,
    byte_len: u64,
}

impl FileBlockDevice {
    pub fn open<P: AsRef<Path>>(path: P, block_size: u32) -> Result<Self> {
        let file = File::open(path.as_ref())
            .with_context(|| format!("opening {}", path.as_ref().display()))?;
        let byte_len = file.metadata()?.len();
        Ok(Self { file, block_size, byte_len })
    }

    pub fn create<P: AsRef<Path>>(path: P, block_size: u32, byte_len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())
            .with_context(|| format!("creating {}", path.as_ref().display()))?;
        file.set_len(byte_len)?;
        Ok(Self { file, block_size, byte_len })
    }

    /// Re-open with a block size learned after reading block 0 (the
    /// checkpoint layer re-maps if the default 4096 turns out wrong).
    pub fn remap_block_size(&mut self, block_size: u32) {
        self.block_size = block_size;
    }
}

impl BlockDevice for FileBlockDevice {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn byte_len(&self) -> u64 {
        self.byte_len
    }

    fn read(&mut self, bno: u64, nblocks: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.block_size as usize * nblocks as usize];
        self.file
            .read_exact_at(&mut buf, bno * self.block_size as u64)
            .with_context(|| format!("short read at block {}", bno))?;
        Ok(buf)
    }

    fn pread(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.file
            .read_exact_at(&mut buf, offset)
            .with_context(|| format!("short read at offset {}", offset))?;
        Ok(buf)
    }

    fn write(&mut self, bno: u64, buf: &[u8]) -> Result<()> {
        self.file
            .write_all_at(buf, bno * self.block_size as u64)
            .with_context(|| format!("short write at block {}", bno))?;
        Ok(())
    }
}
