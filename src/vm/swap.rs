//! The swap subsystem: a bitmap of page-sized slots on a second block
//! device. Grounded in `original_source/vm/anon.c`'s `vm_anon_init`
//! (`swap_table` sized `disk_size(swap_disk) / SECTORS_PER_PAGE`) and
//! `anon_swap_in`/`anon_swap_out`'s per-sector read/write loops.

use std::sync::Arc;

use crate::block::{BlockDevice, SectorBuf};
use crate::error::{KernelError, KResult};
use crate::lock::Spinlock;
use crate::param::{PAGE_SIZE, SECTORS_PER_PAGE, SECTOR_SIZE};

/// Bitmap-indexed allocator over a swap device's page-sized slots.
pub struct Swap {
    device: Arc<dyn BlockDevice>,
    occupied: Spinlock<Vec<bool>>,
}

impl Swap {
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        let slot_count = (device.sector_count() as usize) / SECTORS_PER_PAGE;
        Swap { device, occupied: Spinlock::new(vec![false; slot_count]) }
    }

    /// Claim a free slot and write `page` (exactly `PAGE_SIZE` bytes)
    /// into it, `SECTORS_PER_PAGE` sectors at a time.
    pub fn write_out(&self, page: &[u8; PAGE_SIZE]) -> KResult<u32> {
        let slot = {
            let mut occupied = self.occupied.lock();
            let slot = occupied.iter().position(|b| !b).ok_or_else(|| {
                log::warn!("swap device exhausted: {} slots all occupied", occupied.len());
                KernelError::NoSwapSlot
            })?;
            occupied[slot] = true;
            slot as u32
        };
        for i in 0..SECTORS_PER_PAGE {
            let sector = slot * SECTORS_PER_PAGE as u32 + i as u32;
            let mut buf: SectorBuf = [0u8; SECTOR_SIZE];
            buf.copy_from_slice(&page[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]);
            self.device.write(sector, &buf)?;
        }
        Ok(slot)
    }

    /// Read slot `slot` back into `page` and free it.
    pub fn read_in(&self, slot: u32, page: &mut [u8; PAGE_SIZE]) -> KResult<()> {
        for i in 0..SECTORS_PER_PAGE {
            let sector = slot * SECTORS_PER_PAGE as u32 + i as u32;
            let mut buf: SectorBuf = [0u8; SECTOR_SIZE];
            self.device.read(sector, &mut buf)?;
            page[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE].copy_from_slice(&buf);
        }
        self.occupied.lock()[slot as usize] = false;
        Ok(())
    }
}
