//! Block-level storage abstraction shared by the checker and the formatter.
//!
//! A container may span up to two backing devices (the "main" device and,
//! for Fusion drives, a "tier-2" device). Addresses with the high bit set
//! (`>= FUSION_TIER2_BYTE_ADDR`) refer to the tier-2 device; callers never
//! see that convention past this module's boundary.

use anyhow::{anyhow, Result};

pub mod file;
pub mod memory;
pub mod cache;

/// Byte offset at which tier-2 addressing begins (bit 63 set).
pub const FUSION_TIER2_BYTE_ADDR: u64 = 1 << 63;

/// Default and only fully supported block size.
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// `BlockDevice` is the capability the object and checkpoint layers are
/// written against. Implementations need not know anything about objects,
/// checksums, or the APFS format: they serve raw bytes.
pub trait BlockDevice {
    /// Size of one block in bytes, as discovered from the device (or fixed
    /// at creation time for the formatter).
    fn block_size(&self) -> u32;

    /// Total size of the device in bytes.
    fn byte_len(&self) -> u64;

    /// Read `nblocks` whole blocks starting at block `bno`.
    fn read(&mut self, bno: u64, nblocks: u32) -> Result<Vec<u8>>;

    /// Read `len` bytes starting at byte `offset` (not necessarily
    /// block-aligned).
    fn pread(&mut self, offset: u64, len: usize) -> Result<Vec<u8>>;

    /// Write `buf` (a whole number of blocks) starting at block `bno`.
    /// Only used by the formatter; the checker never calls this.
    fn write(&mut self, bno: u64, buf: &[u8]) -> Result<()>;
}

/// Which physical device an address resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Main,
    Tier2,
}

/// A physical address already split into device + in-device block number,
/// so that the `>= 2^63` convention never leaks past this module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysAddr {
    pub device: Device,
    pub bno: u64,
}

impl PhysAddr {
    pub fn resolve(raw: u64, block_size: u32) -> Self {
        let tier2_block = FUSION_TIER2_BYTE_ADDR / block_size as u64;
        if raw >= tier2_block {
            PhysAddr { device: Device::Tier2, bno: raw - tier2_block }
        } else {
            PhysAddr { device: Device::Main, bno: raw }
        }
    }
}

/// A container backed by one or two physical devices. Routes every request
/// by address, refusing tier-2 addresses when no tier-2 device is attached.
pub struct Fusion<M: BlockDevice, T: BlockDevice> {
    pub main: M,
    pub tier2: Option<T>,
}

impl<M: BlockDevice, T: BlockDevice> Fusion<M, T> {
    pub fn new(main: M, tier2: Option<T>) -> Self {
        Self { main, tier2 }
    }

    pub fn is_fusion(&self) -> bool {
        self.tier2.is_some()
    }

    fn route(&self, bno: u64) -> PhysAddr {
        PhysAddr::resolve(bno, self.main.block_size())
    }

    pub fn read(&mut self, bno: u64, nblocks: u32) -> Result<Vec<u8>> {
        match self.route(bno) {
            PhysAddr { device: Device::Main, bno } => self.main.read(bno, nblocks),
            PhysAddr { device: Device::Tier2, bno } => match &mut self.tier2 {
                Some(t2) => t2.read(bno, nblocks),
                None => Err(anyhow!("MissingTier2: address {} requires a tier-2 device", bno)),
            },
        }
    }

    pub fn write(&mut self, bno: u64, buf: &[u8]) -> Result<()> {
        match self.route(bno) {
            PhysAddr { device: Device::Main, bno } => self.main.write(bno, buf),
            PhysAddr { device: Device::Tier2, bno } => match &mut self.tier2 {
                Some(t2) => t2.write(bno, buf),
                None => Err(anyhow!("MissingTier2: address {} requires a tier-2 device", bno)),
            },
        }
    }

    pub fn block_size(&self) -> u32 {
        self.main.block_size()
    }
}

impl<M: BlockDevice, T: BlockDevice> BlockDevice for Fusion<M, T> {
    fn block_size(&self) -> u32 {
        Fusion::block_size(self)
    }

    fn byte_len(&self) -> u64 {
        self.main.byte_len()
    }

    fn read(&mut self, bno: u64, nblocks: u32) -> Result<Vec<u8>> {
        Fusion::read(self, bno, nblocks)
    }

    fn pread(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        // pread addresses route the same way as block addresses, just
        // measured in bytes; convert to a block-scale address for routing.
        let block_size = self.main.block_size() as u64;
        let addr = PhysAddr::resolve(offset / block_size.max(1), block_size as u32);
        match addr.device {
            Device::Main => self.main.pread(offset, len),
            Device::Tier2 => match &mut self.tier2 {
                Some(t2) => t2.pread(offset - FUSION_TIER2_BYTE_ADDR, len),
                None => Err(anyhow!("MissingTier2: offset {} requires a tier-2 device", offset)),
            },
        }
    }

    fn write(&mut self, bno: u64, buf: &[u8]) -> Result<()> {
        Fusion::write(self, bno, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_main_vs_tier2() {
        let addr = PhysAddr::resolve(5, 4096);
        assert_eq!(addr, PhysAddr { device: Device::Main, bno: 5 });

        let tier2_block = FUSION_TIER2_BYTE_ADDR / 4096;
        let addr = PhysAddr::resolve(tier2_block + 9, 4096);
        assert_eq!(addr, PhysAddr { device: Device::Tier2, bno: 9 });
    }
}
