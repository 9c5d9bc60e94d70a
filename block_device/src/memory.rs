use anyhow::{anyhow, Result};

use crate::BlockDevice;

/// An entirely in-memory device. Used by the formatter's round-trip tests
/// and by anything that wants to build a container without touching disk.
pub struct MemoryBlockDevice {
    mem: Vec<u8>,
    block_size: u32,
}

impl MemoryBlockDevice {
    pub fn new(byte_len: u64, block_size: u32) -> Self {
        Self { mem: vec![0u8; byte_len as usize], block_size }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.mem
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.mem
    }
}

impl BlockDevice for MemoryBlockDevice {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn byte_len(&self) -> u64 {
        self.mem.len() as u64
    }

    fn read(&mut self, bno: u64, nblocks: u32) -> Result<Vec<u8>> {
        let start = bno as usize * self.block_size as usize;
        let end = start + nblocks as usize * self.block_size as usize;
        self.mem
            .get(start..end)
            .map(|s| s.to_vec())
            .ok_or_else(|| anyhow!("read past end of memory device at block {}", bno))
    }

    fn pread(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let start = offset as usize;
        self.mem
            .get(start..start + len)
            .map(|s| s.to_vec())
            .ok_or_else(|| anyhow!("read past end of memory device at offset {}", offset))
    }

    fn write(&mut self, bno: u64, buf: &[u8]) -> Result<()> {
        let start = bno as usize * self.block_size as usize;
        let end = start + buf.len();
        if end > self.mem.len() {
            return Err(anyhow!("write past end of memory device at block {}", bno));
        }
        self.mem[start..end].copy_from_slice(buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_block() {
        let mut dev = MemoryBlockDevice::new(4096 * 4, 4096);
        dev.write(1, &[7u8; 4096]).unwrap();
        let back = dev.read(1, 1).unwrap();
        assert_eq!(back, vec![7u8; 4096]);
    }
}
