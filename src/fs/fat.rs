//! The File Allocation Table.
//!
//! Mirrors the teacher kernel's habit of keeping an in-memory mirror of an
//! on-disk structure behind one lock and flushing it back lazily (compare
//! `fs::inode::Itable`, which does the same for inode headers). Unlike a real
//! FAT32 driver we cap the table at one sector's worth of entries — cluster 1
//! is, per design, the FAT's entire on-disk image, so a disk this crate can
//! format holds at most `SECTOR_SIZE / 4` clusters of data.

use std::sync::Arc;

use crate::block::{BlockDevice, SectorBuf};
use crate::error::{KernelError, KResult};
use crate::lock::Spinlock;
use crate::param::{CLUSTER_RESERVED, FAT_CLUSTER, ROOT_CLUSTER, SECTOR_SIZE};

/// A cluster holding no further links; the tail of a chain.
pub const END_OF_CHAIN: u32 = u32::MAX;
/// A free cluster.
pub const EMPTY: u32 = 0;

const ENTRY_BYTES: usize = 4;
const ENTRIES_PER_SECTOR: usize = SECTOR_SIZE / ENTRY_BYTES;

struct FatTable {
    /// `entries[c]` is the cluster `c` chains to, `EMPTY`, or
    /// `END_OF_CHAIN`. Index 0 is unused filler so cluster ids can index
    /// directly.
    entries: Vec<u32>,
    /// Where the next `alloc` scan resumes, so repeated allocation under
    /// churn doesn't keep re-scanning clusters we already know are taken.
    scan_hand: u32,
}

/// The allocator and chain-walker for the on-disk FAT.
pub struct Fat {
    device: Arc<dyn BlockDevice>,
    table: Spinlock<FatTable>,
}

impl Fat {
    /// Number of data clusters this FAT can ever address, including the
    /// reserved and root clusters.
    fn capacity(device: &dyn BlockDevice) -> usize {
        (device.sector_count() as usize).min(ENTRIES_PER_SECTOR)
    }

    /// Load a FAT previously written by [`Fat::format`] from `device`.
    pub fn open(device: Arc<dyn BlockDevice>) -> KResult<Self> {
        let capacity = Self::capacity(device.as_ref());
        if capacity <= ROOT_CLUSTER as usize {
            return Err(KernelError::IoError);
        }
        let mut sector = [0u8; SECTOR_SIZE];
        device.read(FAT_CLUSTER, &mut sector)?;
        let mut entries = vec![EMPTY; capacity];
        for (i, entry) in entries.iter_mut().enumerate() {
            let off = i * ENTRY_BYTES;
            *entry = u32::from_le_bytes(sector[off..off + ENTRY_BYTES].try_into().unwrap());
        }
        Ok(Self {
            device,
            table: Spinlock::new(FatTable {
                entries,
                scan_hand: ROOT_CLUSTER + 1,
            }),
        })
    }

    /// Initialize a fresh FAT on `device`: cluster 0 reserved, cluster 1
    /// (the FAT's own storage) and the root cluster marked as permanently
    /// in use, everything else free.
    pub fn format(device: Arc<dyn BlockDevice>) -> KResult<Self> {
        let capacity = Self::capacity(device.as_ref());
        if capacity <= ROOT_CLUSTER as usize {
            return Err(KernelError::IoError);
        }
        let mut entries = vec![EMPTY; capacity];
        entries[CLUSTER_RESERVED as usize] = END_OF_CHAIN;
        entries[FAT_CLUSTER as usize] = END_OF_CHAIN;
        entries[ROOT_CLUSTER as usize] = END_OF_CHAIN;
        let fat = Self {
            device,
            table: Spinlock::new(FatTable {
                entries,
                scan_hand: ROOT_CLUSTER + 1,
            }),
        };
        fat.flush()?;
        Ok(fat)
    }

    /// Persist the in-memory table back to cluster 1.
    pub fn flush(&self) -> KResult<()> {
        let table = self.table.lock();
        let mut sector = [0u8; SECTOR_SIZE];
        for (i, entry) in table.entries.iter().enumerate() {
            let off = i * ENTRY_BYTES;
            sector[off..off + ENTRY_BYTES].copy_from_slice(&entry.to_le_bytes());
        }
        self.device.write(FAT_CLUSTER, &sector)
    }

    /// The cluster the next-free scan starts at; wraps past the end of the
    /// table back to the first cluster following the reserved range.
    fn next_candidate(table: &FatTable) -> u32 {
        if (table.scan_hand as usize) < table.entries.len() {
            table.scan_hand
        } else {
            ROOT_CLUSTER + 1
        }
    }

    /// Allocate a free cluster and link it after `prev` (or start a new
    /// chain if `prev` is [`CLUSTER_RESERVED`]). First-fit, linear, wraps
    /// around the table once.
    pub fn create_chain(&self, prev: u32) -> KResult<u32> {
        let mut table = self.table.lock();
        let len = table.entries.len();
        let start = Self::next_candidate(&table);
        let mut cursor = start;
        let found = loop {
            if table.entries[cursor as usize] == EMPTY {
                break Some(cursor);
            }
            cursor = if (cursor as usize) + 1 < len { cursor + 1 } else { ROOT_CLUSTER + 1 };
            if cursor == start {
                break None;
            }
        };
        let cluster = found.ok_or_else(|| {
            log::warn!("FAT exhausted: {len} clusters all in use");
            KernelError::NoSpace
        })?;
        table.entries[cluster as usize] = END_OF_CHAIN;
        if prev != CLUSTER_RESERVED {
            table.entries[prev as usize] = cluster;
        }
        table.scan_hand = if (cluster as usize) + 1 < len { cluster + 1 } else { ROOT_CLUSTER + 1 };
        drop(table);
        self.flush()?;
        Ok(cluster)
    }

    /// Free every cluster in the chain starting at `start`. If `pprev` is
    /// nonzero, that cluster's link is cut first so the chain can't be
    /// walked into from its old predecessor concurrently.
    ///
    /// A well-formed chain visits at most `entries.len()` clusters before
    /// reaching [`END_OF_CHAIN`] (§3 invariant (a)); a walk that runs past
    /// that bound without terminating means two chains have been linked
    /// into a cycle, which is the on-disk corruption §7 category 5 calls
    /// kernel-fatal rather than recoverable.
    pub fn remove_chain(&self, start: u32, pprev: u32) -> KResult<()> {
        let mut table = self.table.lock();
        if pprev != CLUSTER_RESERVED {
            table.entries[pprev as usize] = END_OF_CHAIN;
        }
        let bound = table.entries.len();
        let mut cur = start;
        let mut steps = 0;
        loop {
            if cur == CLUSTER_RESERVED || cur == END_OF_CHAIN {
                break;
            }
            steps += 1;
            if steps > bound {
                log::error!("FAT chain starting at {start} did not terminate within {bound} clusters");
                return Err(KernelError::FatCorrupt);
            }
            let next = table.entries[cur as usize];
            table.entries[cur as usize] = EMPTY;
            if next == END_OF_CHAIN {
                break;
            }
            cur = next;
        }
        drop(table);
        self.flush()
    }

    /// The cluster `c` links to, or `EMPTY`/`END_OF_CHAIN`.
    pub fn get_next(&self, c: u32) -> u32 {
        self.table.lock().entries.get(c as usize).copied().unwrap_or(EMPTY)
    }

    /// Total clusters this FAT addresses, reserved range included.
    pub fn capacity_clusters(&self) -> u32 {
        self.table.lock().entries.len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemBlockDevice;

    fn fresh() -> Fat {
        let dev: Arc<dyn BlockDevice> = Arc::new(MemBlockDevice::new(16));
        Fat::format(dev).unwrap()
    }

    #[test]
    fn root_and_reserved_clusters_start_taken() {
        let fat = fresh();
        assert_eq!(fat.get_next(ROOT_CLUSTER), END_OF_CHAIN);
        assert_eq!(fat.get_next(FAT_CLUSTER), END_OF_CHAIN);
    }

    #[test]
    fn create_chain_links_and_extends() {
        let fat = fresh();
        let a = fat.create_chain(CLUSTER_RESERVED).unwrap();
        let b = fat.create_chain(a).unwrap();
        assert_eq!(fat.get_next(a), b);
        assert_eq!(fat.get_next(b), END_OF_CHAIN);
        assert_ne!(a, ROOT_CLUSTER);
        assert_ne!(a, FAT_CLUSTER);
    }

    #[test]
    fn remove_chain_frees_every_link() {
        let fat = fresh();
        let a = fat.create_chain(CLUSTER_RESERVED).unwrap();
        let b = fat.create_chain(a).unwrap();
        fat.remove_chain(a, CLUSTER_RESERVED).unwrap();
        assert_eq!(fat.get_next(a), EMPTY);
        assert_eq!(fat.get_next(b), EMPTY);
    }

    #[test]
    fn runs_out_of_space() {
        let dev: Arc<dyn BlockDevice> = Arc::new(MemBlockDevice::new(5));
        let fat = Fat::format(dev).unwrap();
        // capacity 5: clusters 0..4, with 0/1/2 reserved, leaving 3 and 4 free.
        let a = fat.create_chain(CLUSTER_RESERVED).unwrap();
        let _b = fat.create_chain(a).unwrap();
        assert_eq!(fat.create_chain(CLUSTER_RESERVED), Err(KernelError::NoSpace));
    }

    #[test]
    fn cyclic_chain_is_reported_as_corrupt_instead_of_looping_forever() {
        let fat = fresh();
        let a = fat.create_chain(CLUSTER_RESERVED).unwrap();
        let b = fat.create_chain(a).unwrap();
        // Corrupt the table directly: link b back to a, forming a cycle
        // `remove_chain`'s normal chain walk would never terminate on.
        fat.table.lock().entries[b as usize] = a;
        assert_eq!(fat.remove_chain(a, CLUSTER_RESERVED), Err(KernelError::FatCorrupt));
    }

    #[test]
    fn survives_reopen() {
        let dev: Arc<dyn BlockDevice> = Arc::new(MemBlockDevice::new(16));
        let a = {
            let fat = Fat::format(Arc::clone(&dev)).unwrap();
            fat.create_chain(CLUSTER_RESERVED).unwrap()
        };
        let fat = Fat::open(dev).unwrap();
        assert_eq!(fat.get_next(a), END_OF_CHAIN);
    }
}
