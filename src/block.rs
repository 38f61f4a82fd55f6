//! Block devices.
//!
//! The boot loader, disk controller driver, and DMA plumbing are explicitly
//! out of scope (§1); this module only states the contract the core expects
//! from one, mirroring how the teacher kernel isolates `virtio_disk`/`bio`
//! behind a narrow read/write-by-sector interface.

use crate::error::{KernelError, KResult};
use crate::param::SECTOR_SIZE;

/// One disk sector's worth of bytes.
pub type SectorBuf = [u8; SECTOR_SIZE];

/// A byte-granular block device addressed by 512-byte sector number.
///
/// Implementations are expected to be internally synchronized; the kernel
/// core calls `read`/`write` from behind its own locks (the FAT lock, the
/// frame-table lock) but does not assume exclusive access to the device
/// itself.
pub trait BlockDevice: Send + Sync {
    /// Total number of addressable sectors.
    fn sector_count(&self) -> u32;

    /// Read sector `sector` into `buf`.
    fn read(&self, sector: u32, buf: &mut SectorBuf) -> KResult<()>;

    /// Write `buf` to sector `sector`.
    fn write(&self, sector: u32, buf: &SectorBuf) -> KResult<()>;
}

/// An in-memory block device, used by the in-crate test suite in place of a
/// real disk or swap partition.
pub struct MemBlockDevice {
    sectors: spin::Mutex<Vec<SectorBuf>>,
}

impl MemBlockDevice {
    pub fn new(sector_count: u32) -> Self {
        Self {
            sectors: spin::Mutex::new(vec![[0u8; SECTOR_SIZE]; sector_count as usize]),
        }
    }
}

impl BlockDevice for MemBlockDevice {
    fn sector_count(&self) -> u32 {
        self.sectors.lock().len() as u32
    }

    fn read(&self, sector: u32, buf: &mut SectorBuf) -> KResult<()> {
        let sectors = self.sectors.lock();
        let src = sectors.get(sector as usize).ok_or(KernelError::IoError)?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write(&self, sector: u32, buf: &SectorBuf) -> KResult<()> {
        let mut sectors = self.sectors.lock();
        let dst = sectors.get_mut(sector as usize).ok_or(KernelError::IoError)?;
        dst.copy_from_slice(buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_back_what_was_written() {
        let dev = MemBlockDevice::new(4);
        let mut buf = [0u8; SECTOR_SIZE];
        buf[0] = 0xAB;
        dev.write(2, &buf).unwrap();
        let mut out = [0u8; SECTOR_SIZE];
        dev.read(2, &mut out).unwrap();
        assert_eq!(out[0], 0xAB);
    }

    #[test]
    fn out_of_range_sector_errors() {
        let dev = MemBlockDevice::new(1);
        let mut out = [0u8; SECTOR_SIZE];
        assert_eq!(dev.read(5, &mut out), Err(KernelError::IoError));
    }
}
