//! Inodes: the persistent metadata record at the head of a cluster chain.
//!
//! Grounded in the teacher's `fs::inode::{Inode, InodeGuard, Itable}` split
//! (a thin handle type plus a lock-guarded inner value, deduplicated through
//! a cache keyed by identity) but with the teacher's no-heap `Arena`/`Rc`
//! machinery replaced by plain `Arc` — this crate runs with an allocator, so
//! there's no need to pre-size a fixed inode cache or hand-roll refcounting.
//! Dedup still matters: two opens of the same file must see one lock, or a
//! concurrent writer and reader could disagree about `length`.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use zerocopy::{AsBytes, FromBytes};

use crate::block::{BlockDevice, SectorBuf};
use crate::error::{KernelError, KResult};
use crate::fs::fat::{Fat, CLUSTER_RESERVED, END_OF_CHAIN};
use crate::lock::Sleeplock;
use crate::param::SECTOR_SIZE;

const INODE_MAGIC: u32 = 0x494E_4F44;

#[repr(C)]
#[derive(AsBytes, FromBytes, Clone, Copy)]
struct DiskInode {
    length: u32,
    magic: u32,
    start_cluster: u32,
    is_dir: u8,
    _pad: [u8; 3],
}

impl DiskInode {
    fn clusters(&self) -> usize {
        (self.length as usize + SECTOR_SIZE - 1) / SECTOR_SIZE
    }
}

struct InodeInner {
    disk: DiskInode,
    dirty: bool,
    /// Set once the directory entry naming this inode has been removed.
    /// The chain is only actually freed once the last open handle goes
    /// away (§3: "destroyed when link count reaches zero AND open-count
    /// reaches zero" — this filesystem has no hard links, so "link count
    /// zero" collapses to "removed").
    removed: bool,
}

/// A reference-counted handle to an open inode. Cloning bumps the
/// reference count exactly the way `open` is specified to.
#[derive(Clone)]
pub struct RcInode {
    pub inumber: u32,
    inner: Arc<Sleeplock<InodeInner>>,
    fat: Arc<Fat>,
}

impl RcInode {
    pub fn is_dir(&self) -> bool {
        self.inner.lock().disk.is_dir != 0
    }

    pub fn len(&self) -> u64 {
        self.inner.lock().disk.length as u64
    }

    pub fn mark_removed(&self) {
        self.inner.lock().removed = true;
    }

    pub fn is_removed(&self) -> bool {
        self.inner.lock().removed
    }

    /// Read up to `buf.len()` bytes starting at `offset`. Reads past
    /// `length` return 0 rather than erroring.
    pub fn read_at(&self, device: &dyn BlockDevice, buf: &mut [u8], offset: u64) -> KResult<usize> {
        let inner = self.inner.lock();
        let length = inner.disk.length as u64;
        if offset >= length {
            return Ok(0);
        }
        let want = buf.len().min((length - offset) as usize);
        let mut done = 0;
        let mut cluster = inner.disk.start_cluster;
        let mut skip_clusters = offset / SECTOR_SIZE as u64;
        while skip_clusters > 0 {
            if cluster == CLUSTER_RESERVED || cluster == END_OF_CHAIN {
                return Ok(0);
            }
            cluster = self.fat_next(cluster);
            skip_clusters -= 1;
        }
        let mut in_cluster_off = (offset % SECTOR_SIZE as u64) as usize;
        while done < want {
            if cluster == CLUSTER_RESERVED || cluster == END_OF_CHAIN {
                break;
            }
            let mut raw: SectorBuf = [0u8; SECTOR_SIZE];
            device.read(cluster, &mut raw)?;
            let n = (want - done).min(SECTOR_SIZE - in_cluster_off);
            buf[done..done + n].copy_from_slice(&raw[in_cluster_off..in_cluster_off + n]);
            done += n;
            in_cluster_off = 0;
            cluster = self.fat_next(cluster);
        }
        Ok(done)
    }

    fn fat_next(&self, cluster: u32) -> u32 {
        // Real chain walking is done through `Itable`'s shared `Fat`
        // handle; `RcInode` keeps its own copy so read/write can be
        // called without threading the table through every call site.
        self.fat.get_next(cluster)
    }

    /// Write `buf` at `offset`, growing the chain and updating `length` as
    /// needed. Returns the number of bytes actually written, short of
    /// `buf.len()` only if the FAT runs out of space mid-write.
    pub fn write_at(&self, device: &dyn BlockDevice, buf: &[u8], offset: u64) -> KResult<usize> {
        let mut inner = self.inner.lock();
        let needed_len = offset + buf.len() as u64;
        let needed_clusters = ((needed_len + SECTOR_SIZE as u64 - 1) / SECTOR_SIZE as u64) as usize;
        let mut have_clusters = inner.disk.clusters();

        if have_clusters == 0 && needed_clusters > 0 {
            let first = self.fat.create_chain(CLUSTER_RESERVED)?;
            inner.disk.start_cluster = first;
            have_clusters = 1;
        }
        let mut tail = inner.disk.start_cluster;
        while self.fat_next(tail) != END_OF_CHAIN {
            tail = self.fat_next(tail);
        }
        let mut written_clusters = have_clusters;
        while written_clusters < needed_clusters {
            let next = self.fat.create_chain(tail)?;
            tail = next;
            written_clusters += 1;
        }

        let mut done = 0;
        let mut cluster = inner.disk.start_cluster;
        let mut skip_clusters = offset / SECTOR_SIZE as u64;
        while skip_clusters > 0 {
            cluster = self.fat_next(cluster);
            skip_clusters -= 1;
        }
        let mut in_cluster_off = (offset % SECTOR_SIZE as u64) as usize;
        while done < buf.len() {
            if cluster == CLUSTER_RESERVED || cluster == END_OF_CHAIN {
                break;
            }
            let mut raw: SectorBuf = [0u8; SECTOR_SIZE];
            device.read(cluster, &mut raw)?;
            let n = (buf.len() - done).min(SECTOR_SIZE - in_cluster_off);
            raw[in_cluster_off..in_cluster_off + n].copy_from_slice(&buf[done..done + n]);
            device.write(cluster, &raw)?;
            done += n;
            in_cluster_off = 0;
            cluster = self.fat_next(cluster);
        }

        if offset + done as u64 > inner.disk.length as u64 {
            inner.disk.length = (offset + done as u64) as u32;
        }
        inner.dirty = true;
        let header = inner.disk;
        let inumber = self.inumber;
        drop(inner);
        write_header(device, inumber, &header)?;
        self.inner.lock().dirty = false;
        Ok(done)
    }
}

fn write_header(device: &dyn BlockDevice, inumber: u32, header: &DiskInode) -> KResult<()> {
    let mut raw: SectorBuf = [0u8; SECTOR_SIZE];
    raw[..std::mem::size_of::<DiskInode>()].copy_from_slice(header.as_bytes());
    device.write(inumber, &raw)
}

fn read_header(device: &dyn BlockDevice, inumber: u32) -> KResult<DiskInode> {
    let mut raw: SectorBuf = [0u8; SECTOR_SIZE];
    device.read(inumber, &mut raw)?;
    let header = DiskInode::read_from_prefix(&raw[..]).ok_or(KernelError::IoError)?;
    if header.magic != INODE_MAGIC {
        log::error!("inode {inumber}: bad magic {:#x}, expected {:#x}", header.magic, INODE_MAGIC);
        return Err(KernelError::BadInodeMagic);
    }
    Ok(header)
}

// `RcInode` needs a `Fat` handle of its own to walk chains without
// re-locking the table on every call; store it alongside the inner Arc.
impl RcInode {
    fn with_fat(inumber: u32, inner: Arc<Sleeplock<InodeInner>>, fat: Arc<Fat>) -> Self {
        RcInode { inumber, inner, fat }
    }
}

/// The open-inode cache and allocator.
pub struct Itable {
    device: Arc<dyn BlockDevice>,
    fat: Arc<Fat>,
    cache: crate::lock::Spinlock<HashMap<u32, Weak<Sleeplock<InodeInner>>>>,
}

impl Itable {
    pub fn new(device: Arc<dyn BlockDevice>, fat: Arc<Fat>) -> Self {
        Itable { device, fat, cache: crate::lock::Spinlock::new(HashMap::new()) }
    }

    /// Open (or return the already-open handle for) the inode at
    /// `inumber`, validating its magic number.
    pub fn get(&self, inumber: u32) -> KResult<RcInode> {
        let mut cache = self.cache.lock();
        if let Some(weak) = cache.get(&inumber) {
            if let Some(inner) = weak.upgrade() {
                return Ok(RcInode::with_fat(inumber, inner, Arc::clone(&self.fat)));
            }
        }
        let disk = read_header(self.device.as_ref(), inumber)?;
        let inner = Arc::new(Sleeplock::new(InodeInner { disk, dirty: false, removed: false }));
        cache.insert(inumber, Arc::downgrade(&inner));
        Ok(RcInode::with_fat(inumber, inner, Arc::clone(&self.fat)))
    }

    /// Allocate a fresh inode of `size` bytes (pre-zeroed), per
    /// `inode_create`: the header gets its own single-cluster chain
    /// distinct from the (possibly multi-cluster) data chain.
    pub fn alloc(&self, size: u32, is_dir: bool) -> KResult<RcInode> {
        let inumber = self.fat.create_chain(CLUSTER_RESERVED)?;
        self.build_at(inumber, size, is_dir)
    }

    /// Build an inode at an already-reserved `inumber` cluster, used only
    /// to root the filesystem's single fixed-identity inode (the root
    /// directory) at `ROOT_CLUSTER` rather than wherever `create_chain`
    /// would otherwise have picked.
    pub fn build_at(&self, inumber: u32, size: u32, is_dir: bool) -> KResult<RcInode> {
        let clusters_needed = ((size as usize) + SECTOR_SIZE - 1) / SECTOR_SIZE;

        let mut start_cluster = CLUSTER_RESERVED;
        let mut tail = CLUSTER_RESERVED;
        for _ in 0..clusters_needed {
            let c = match self.fat.create_chain(tail) {
                Ok(c) => c,
                Err(e) => {
                    if start_cluster != CLUSTER_RESERVED {
                        let _ = self.fat.remove_chain(start_cluster, CLUSTER_RESERVED);
                    }
                    let _ = self.fat.remove_chain(inumber, CLUSTER_RESERVED);
                    return Err(e);
                }
            };
            if start_cluster == CLUSTER_RESERVED {
                start_cluster = c;
            }
            tail = c;
            let zero: SectorBuf = [0u8; SECTOR_SIZE];
            if let Err(e) = self.device.write(c, &zero) {
                let _ = self.fat.remove_chain(start_cluster, CLUSTER_RESERVED);
                let _ = self.fat.remove_chain(inumber, CLUSTER_RESERVED);
                return Err(e);
            }
        }

        let disk = DiskInode { length: size, magic: INODE_MAGIC, start_cluster, is_dir: is_dir as u8, _pad: [0; 3] };
        if let Err(e) = write_header(self.device.as_ref(), inumber, &disk) {
            if start_cluster != CLUSTER_RESERVED {
                let _ = self.fat.remove_chain(start_cluster, CLUSTER_RESERVED);
            }
            let _ = self.fat.remove_chain(inumber, CLUSTER_RESERVED);
            return Err(e);
        }

        let inner = Arc::new(Sleeplock::new(InodeInner { disk, dirty: false, removed: false }));
        self.cache.lock().insert(inumber, Arc::downgrade(&inner));
        Ok(RcInode::with_fat(inumber, inner, Arc::clone(&self.fat)))
    }

    /// Drop a reference to `inode`. If this was the last handle and the
    /// inode had already been unlinked from its directory, free its data
    /// chain and its header cluster.
    pub fn put(&self, inode: RcInode) -> KResult<()> {
        let mut cache = self.cache.lock();
        let last_handle = Arc::strong_count(&inode.inner) == 1;
        if last_handle && inode.is_removed() {
            let start = inode.inner.lock().disk.start_cluster;
            if start != CLUSTER_RESERVED {
                self.fat.remove_chain(start, CLUSTER_RESERVED)?;
            }
            self.fat.remove_chain(inode.inumber, CLUSTER_RESERVED)?;
            cache.remove(&inode.inumber);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemBlockDevice;

    fn setup() -> (Arc<dyn BlockDevice>, Itable) {
        let dev: Arc<dyn BlockDevice> = Arc::new(MemBlockDevice::new(64));
        let fat = Arc::new(Fat::format(Arc::clone(&dev)).unwrap());
        (Arc::clone(&dev), Itable::new(dev, fat))
    }

    #[test]
    fn create_reserves_exact_size_up_front() {
        let (_dev, table) = setup();
        let inode = table.alloc(100, false).unwrap();
        assert_eq!(inode.len(), 100);
        assert!(!inode.is_dir());
    }

    #[test]
    fn write_then_read_round_trips() {
        let (dev, table) = setup();
        let inode = table.alloc(100, false).unwrap();
        let n = inode.write_at(dev.as_ref(), b"xyz", 0).unwrap();
        assert_eq!(n, 3);
        let mut buf = [0u8; 3];
        let n = inode.read_at(dev.as_ref(), &mut buf, 0).unwrap();
        assert_eq!(n, 3);
        assert_eq!(&buf, b"xyz");
        assert_eq!(inode.len(), 100);
    }

    #[test]
    fn write_past_length_grows_file() {
        let (dev, table) = setup();
        let inode = table.alloc(0, false).unwrap();
        let n = inode.write_at(dev.as_ref(), b"hello world", 0).unwrap();
        assert_eq!(n, 11);
        assert_eq!(inode.len(), 11);
    }

    #[test]
    fn read_past_length_returns_zero() {
        let (dev, table) = setup();
        let inode = table.alloc(10, false).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(inode.read_at(dev.as_ref(), &mut buf, 20).unwrap(), 0);
    }

    #[test]
    fn get_dedupes_concurrent_opens() {
        let (_dev, table) = setup();
        let a = table.alloc(0, false).unwrap();
        let inumber = a.inumber;
        let b = table.get(inumber).unwrap();
        assert_eq!(Arc::strong_count(&a.inner), Arc::strong_count(&b.inner));
    }

    #[test]
    fn removed_inode_frees_chain_on_last_close() {
        let (dev, table) = setup();
        let inode = table.alloc(50, false).unwrap();
        let inumber = inode.inumber;
        let start = inode.inner.lock().disk.start_cluster;
        inode.mark_removed();
        table.put(inode).unwrap();
        assert_eq!(table.fat.get_next(inumber), crate::fs::fat::EMPTY);
        assert_eq!(table.fat.get_next(start), crate::fs::fat::EMPTY);
        let _ = dev;
    }
}
