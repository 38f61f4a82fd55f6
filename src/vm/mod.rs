//! The virtual memory subsystem: per-task supplemental page tables over a
//! global frame table and swap device.
//!
//! Module split mirrors §2's component table: [`frame`] is the frame table
//! and clock-hand eviction, [`page`] is the tagged-variant page descriptor,
//! [`swap`] is the bitmap-indexed swap device, [`pagetable`] is the
//! in-memory stand-in for the hardware mapping primitive §1 assumes is
//! supplied externally. This module ties them together into the SPT
//! itself (§4.4) plus the `mmap`/`munmap` group machinery (§4.6) and fork
//! duplication (§4.8), all of which need more than one of those pieces at
//! once.

pub mod frame;
pub mod page;
pub mod pagetable;
pub mod swap;

use std::collections::HashMap;
use std::sync::Arc;

use crate::addr::{PhysAddr, VirtAddr};
use crate::block::BlockDevice;
use crate::error::{KernelError, KResult};
use crate::lock::{Sleeplock, Spinlock};
use crate::param::PAGE_SIZE;
use crate::vm::frame::{FrameTable, PageTable};
use crate::vm::page::{Aux, Page, PageState};
use crate::vm::swap::Swap;

/// A per-task map from page-aligned virtual address to its descriptor.
/// Grounded in the teacher's own habit of keeping per-process state behind
/// one lock (`ProcData`) — a `HashMap` satisfies §4.4's "any structure
/// with `O(log n)` membership" requirement without reaching for an
/// intrusive hash table the way the original `vm/vm.c` does.
pub struct Spt {
    pages: Spinlock<HashMap<u64, Arc<Sleeplock<Page>>>>,
}

impl Spt {
    pub fn new() -> Self {
        Spt { pages: Spinlock::new(HashMap::new()) }
    }

    /// Look up the descriptor covering `va`'s page, if any.
    pub fn find(&self, va: VirtAddr) -> Option<Arc<Sleeplock<Page>>> {
        self.pages.lock().get(&va.page_floor().0).cloned()
    }

    /// Insert a freshly built descriptor, failing if its page is already
    /// mapped.
    pub fn insert(&self, page: Page) -> KResult<()> {
        let va = page.va.page_floor();
        let mut pages = self.pages.lock();
        if pages.contains_key(&va.0) {
            return Err(KernelError::AlreadyMapped);
        }
        pages.insert(va.0, Arc::new(Sleeplock::new(page)));
        Ok(())
    }

    /// Remove and return the descriptor at `va`'s page, destroying the
    /// SPT's reference to it.
    pub fn remove(&self, va: VirtAddr) -> Option<Arc<Sleeplock<Page>>> {
        self.pages.lock().remove(&va.page_floor().0)
    }

    /// Lazily register a page: no frame is allocated until the first
    /// fault claims it.
    pub fn alloc_with_initializer(&self, va: VirtAddr, writable: bool, aux: Aux) -> KResult<()> {
        self.insert(Page::new_uninit(va, writable, aux))
    }

    /// Every page-aligned VA currently tracked, for fork and teardown.
    pub fn all_vas(&self) -> Vec<VirtAddr> {
        self.pages.lock().keys().map(|&k| VirtAddr(k)).collect()
    }

    /// Every VA belonging to the `mmap` group identified by `group`
    /// (its first page's VA), for `munmap`.
    fn group_vas(&self, group: VirtAddr) -> Vec<VirtAddr> {
        let group = group.page_floor();
        self.pages
            .lock()
            .iter()
            .filter_map(|(&k, p)| {
                let va = VirtAddr(k);
                if p.lock().group_va() == Some(group) {
                    Some(va)
                } else {
                    None
                }
            })
            .collect()
    }

    /// Materialize `va`'s descriptor into a resident frame: allocate (or
    /// evict for) a frame, link it to the descriptor, install the
    /// hardware mapping, then run the descriptor's `swap_in`. A no-op
    /// returning the existing frame if the descriptor is already
    /// resident, so callers (fault handling, fork) can call it
    /// unconditionally.
    pub fn claim(
        &self,
        va: VirtAddr,
        device: &dyn BlockDevice,
        frames: &FrameTable,
        swap: &Swap,
        page_table: Arc<dyn PageTable>,
    ) -> KResult<PhysAddr> {
        let page_arc = self.find(va).ok_or(KernelError::BadPointer)?;
        let writable = {
            let page = page_arc.lock();
            if page.resident {
                return Ok(page.frame.expect("resident descriptor always has a frame"));
            }
            page.writable
        };
        let frame = frames.get_frame(device, swap)?;
        frames.assign(frame, &page_arc, page_table.clone(), va);
        page_table.map(va, frame, writable)?;
        let init_result = frames.bytes_mut(frame).with(|buf| page_arc.lock().swap_in(device, swap, buf));
        if let Err(e) = init_result {
            page_table.unmap(va);
            frames.release(frame)?;
            return Err(e);
        }
        page_arc.lock().frame = Some(frame);
        Ok(frame)
    }

    /// Register one `UNINIT` page per `PAGE_SIZE` chunk of `[offset,
    /// offset+length)` in `file`, per §4.6. Rejects an unaligned `addr`/
    /// `offset`, a null `addr`, a non-positive `length`, or any overlap
    /// with an existing mapping; none of the `fd < 2` checks belong here,
    /// since the SPT doesn't know about file descriptors — the syscall
    /// layer resolves the fd to an `RcInode` before calling this.
    pub fn mmap(&self, addr: VirtAddr, length: usize, writable: bool, file: crate::fs::inode::RcInode, offset: u64) -> KResult<()> {
        if addr.0 == 0 || !addr.is_page_aligned() {
            return Err(KernelError::InvalidArgument);
        }
        if offset % PAGE_SIZE as u64 != 0 {
            return Err(KernelError::InvalidArgument);
        }
        if length == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let page_count = (length + PAGE_SIZE - 1) / PAGE_SIZE;
        for i in 0..page_count {
            if self.find(addr + (i * PAGE_SIZE) as u64).is_some() {
                return Err(KernelError::AlreadyMapped);
            }
        }
        let mut remaining = length as u64;
        for i in 0..page_count {
            let va = addr + (i * PAGE_SIZE) as u64;
            let read_bytes = remaining.min(PAGE_SIZE as u64) as u32;
            let zero_bytes = PAGE_SIZE as u32 - read_bytes;
            remaining -= read_bytes as u64;
            let aux = Aux::File {
                inode: file.clone(),
                offset: offset + (i * PAGE_SIZE) as u64,
                read_bytes,
                zero_bytes,
                group_va: addr,
            };
            // `insert` can only fail with `AlreadyMapped`, already ruled
            // out by the scan above; any failure here would leave a
            // partial mapping, so unwind what we've placed so far.
            if let Err(e) = self.alloc_with_initializer(va, writable, aux) {
                for j in 0..i {
                    self.remove(addr + (j * PAGE_SIZE) as u64);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Tear down the `mmap` group starting at `addr`: for each page,
    /// write back its contents if dirty, clear its hardware mapping, and
    /// return its frame to the pool.
    pub fn munmap(&self, addr: VirtAddr, device: &dyn BlockDevice, frames: &FrameTable, page_table: &dyn PageTable) -> KResult<()> {
        let vas = self.group_vas(addr);
        if vas.is_empty() {
            return Err(KernelError::InvalidArgument);
        }
        for va in vas {
            if let Some(page_arc) = self.remove(va) {
                let mut page = page_arc.lock();
                if let Some(frame) = page.frame.take() {
                    frames.bytes_mut(frame).with(|buf| page.flush_if_dirty(device, buf))?;
                    page_table.unmap(va);
                    frames.release(frame)?;
                }
                page.resident = false;
            }
        }
        Ok(())
    }

    /// Destroy every descriptor, flushing dirty file-backed pages and
    /// releasing their frames first. Called once, at task exit (§5:
    /// "`exit` ... invoking `spt_kill`, which flushes dirty file-backed
    /// pages").
    pub fn kill(&self, device: &dyn BlockDevice, frames: &FrameTable, page_table: &dyn PageTable) -> KResult<()> {
        for va in self.all_vas() {
            if let Some(page_arc) = self.remove(va) {
                let mut page = page_arc.lock();
                if let Some(frame) = page.frame.take() {
                    frames.bytes_mut(frame).with(|buf| page.flush_if_dirty(device, buf))?;
                    page_table.unmap(va);
                    frames.release(frame)?;
                }
            }
        }
        Ok(())
    }

    /// Duplicate every descriptor of `self` into `child` (§4.8): `UNINIT`
    /// pages are duplicated lazily with the same initializer, everything
    /// else (ANON, FILE, and the stack pages among them — this crate has
    /// no separate `setup_stack` primitive since ELF/exec is out of
    /// scope, so stack pages are eagerly copied exactly like other ANON
    /// pages; see DESIGN.md) is claimed in both address spaces and its
    /// bytes copied frame-to-frame.
    pub fn fork_into(
        &self,
        child: &Spt,
        device: &dyn BlockDevice,
        frames: &FrameTable,
        swap: &Swap,
        parent_page_table: Arc<dyn PageTable>,
        child_page_table: Arc<dyn PageTable>,
    ) -> KResult<()> {
        for va in self.all_vas() {
            let page_arc = self.find(va).expect("va just listed by all_vas");
            let (writable, is_stack, is_uninit) = {
                let page = page_arc.lock();
                (page.writable, page.is_stack, page.is_uninit())
            };
            if is_uninit {
                let aux = page_arc.lock().fork_aux();
                child.insert(Page::new_uninit(va, writable, aux))?;
                continue;
            }
            let parent_frame = self.claim(va, device, frames, swap, parent_page_table.clone())?;
            let aux = page_arc.lock().fork_aux();
            let child_page = if is_stack { Page::new_stack(va) } else { Page::new_uninit(va, writable, aux) };
            child.insert(child_page)?;
            let child_frame = child.claim(va, device, frames, swap, child_page_table.clone())?;
            frames.copy_frame(parent_frame, child_frame);
        }
        Ok(())
    }

    /// Resolve `va` to its backing frame without claiming it, for tests —
    /// grounded in `original_source/vm/inspect.c`'s `inspect()` debug
    /// handler.
    pub fn inspect(&self, va: VirtAddr, page_table: &dyn PageTable) -> Option<PhysAddr> {
        page_table.translate(va.page_floor())
    }
}

impl Default for Spt {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemBlockDevice;
    use crate::fs::fat::Fat;
    use crate::fs::inode::Itable;
    use crate::param::SECTORS_PER_PAGE;
    use crate::vm::pagetable::TestPageTable;
    use std::sync::Arc;

    fn harness() -> (Arc<dyn BlockDevice>, FrameTable, Swap, Arc<dyn PageTable>) {
        let _ = env_logger::try_init();
        let dev: Arc<dyn BlockDevice> = Arc::new(MemBlockDevice::new(64));
        let swap_dev: Arc<dyn BlockDevice> = Arc::new(MemBlockDevice::new((SECTORS_PER_PAGE * 8) as u32));
        (dev, FrameTable::new(8), Swap::new(swap_dev), Arc::new(TestPageTable::new()))
    }

    #[test]
    fn claim_materializes_anon_page_zeroed() {
        let (dev, frames, swap, pt) = harness();
        let spt = Spt::new();
        let va = VirtAddr(0x1000);
        spt.alloc_with_initializer(va, true, Aux::Anon).unwrap();
        spt.claim(va, dev.as_ref(), &frames, &swap, pt.clone()).unwrap();
        assert!(pt.is_present(va));
        let page = spt.find(va).unwrap();
        assert!(page.lock().resident);
    }

    #[test]
    fn claim_twice_is_idempotent() {
        let (dev, frames, swap, pt) = harness();
        let spt = Spt::new();
        let va = VirtAddr(0x2000);
        spt.alloc_with_initializer(va, true, Aux::Anon).unwrap();
        let a = spt.claim(va, dev.as_ref(), &frames, &swap, pt.clone()).unwrap();
        let b = spt.claim(va, dev.as_ref(), &frames, &swap, pt.clone()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn mmap_rejects_bad_arguments() {
        let dev_itable: Arc<dyn BlockDevice> = Arc::new(MemBlockDevice::new(64));
        let fat = Arc::new(Fat::format(Arc::clone(&dev_itable)).unwrap());
        let itable = Itable::new(Arc::clone(&dev_itable), fat);
        let file = itable.alloc(PAGE_SIZE as u32 * 4, false).unwrap();
        let spt = Spt::new();
        assert_eq!(
            spt.mmap(VirtAddr(0), PAGE_SIZE, true, file.clone(), 0),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            spt.mmap(VirtAddr(0x1001), PAGE_SIZE, true, file.clone(), 0),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(spt.mmap(VirtAddr(0x1000), 0, true, file, 0), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn mmap_then_munmap_writes_back_dirty_pages() {
        let (dev, frames, swap, pt) = harness();
        let fat = Arc::new(Fat::format(Arc::clone(&dev)).unwrap());
        let itable = Itable::new(Arc::clone(&dev), fat);
        let file = itable.alloc(PAGE_SIZE as u32, false).unwrap();
        let spt = Spt::new();
        let va = VirtAddr(0x4000_0000);
        spt.mmap(va, PAGE_SIZE, true, file.clone(), 0).unwrap();
        let frame = spt.claim(va, dev.as_ref(), &frames, &swap, pt.clone()).unwrap();
        frames.bytes_mut(frame).with(|buf| buf[0] = 0xAA);
        spt.find(va).unwrap().lock().mark_dirty();
        spt.munmap(va, dev.as_ref(), &frames, pt.as_ref()).unwrap();
        assert!(!pt.is_present(va));
        let mut back = [0u8; 1];
        file.read_at(dev.as_ref(), &mut back, 0).unwrap();
        assert_eq!(back[0], 0xAA);
    }

    #[test]
    fn munmap_of_unknown_group_errors() {
        let spt = Spt::new();
        assert_eq!(
            spt.munmap(VirtAddr(0x9000), &MemBlockDevice::new(1), &FrameTable::new(1), &TestPageTable::new()),
            Err(KernelError::InvalidArgument)
        );
    }

    #[test]
    fn fork_copies_anon_page_contents_independently() {
        let (dev, frames, swap, parent_pt) = harness();
        let child_pt: Arc<dyn PageTable> = Arc::new(TestPageTable::new());
        let parent = Spt::new();
        let child = Spt::new();
        let va = VirtAddr(0x5000);
        parent.alloc_with_initializer(va, true, Aux::Anon).unwrap();
        let frame = parent.claim(va, dev.as_ref(), &frames, &swap, parent_pt.clone()).unwrap();
        frames.bytes_mut(frame).with(|buf| buf[0] = 0x42);

        parent.fork_into(&child, dev.as_ref(), &frames, &swap, parent_pt.clone(), child_pt.clone()).unwrap();

        let child_frame = child.find(va).unwrap().lock().frame.unwrap();
        frames.bytes_mut(child_frame).with(|buf| assert_eq!(buf[0], 0x42));

        // writes after fork are independent.
        frames.bytes_mut(frame).with(|buf| buf[0] = 0x99);
        frames.bytes_mut(child_frame).with(|buf| assert_eq!(buf[0], 0x42));
    }

    #[test]
    fn fork_preserves_lazy_uninit_pages() {
        let (dev, frames, swap, parent_pt) = harness();
        let child_pt: Arc<dyn PageTable> = Arc::new(TestPageTable::new());
        let parent = Spt::new();
        let child = Spt::new();
        let va = VirtAddr(0x6000);
        parent.alloc_with_initializer(va, true, Aux::Anon).unwrap();
        parent.fork_into(&child, dev.as_ref(), &frames, &swap, parent_pt, child_pt).unwrap();
        assert!(!parent.find(va).unwrap().lock().resident);
        assert!(!child.find(va).unwrap().lock().resident);
    }

    #[test]
    fn kill_flushes_dirty_file_pages_and_frees_frames() {
        let (dev, frames, swap, pt) = harness();
        let fat = Arc::new(Fat::format(Arc::clone(&dev)).unwrap());
        let itable = Itable::new(Arc::clone(&dev), fat);
        let file = itable.alloc(PAGE_SIZE as u32, false).unwrap();
        let spt = Spt::new();
        let va = VirtAddr(0x7000);
        spt.mmap(va, PAGE_SIZE, true, file.clone(), 0).unwrap();
        spt.claim(va, dev.as_ref(), &frames, &swap, pt.clone()).unwrap();
        spt.find(va).unwrap().lock().mark_dirty();
        frames
            .bytes_mut(spt.find(va).unwrap().lock().frame.unwrap())
            .with(|buf| buf[0] = 0x55);
        spt.kill(dev.as_ref(), &frames, pt.as_ref()).unwrap();
        assert!(!pt.is_present(va));
        let mut back = [0u8; 1];
        file.read_at(dev.as_ref(), &mut back, 0).unwrap();
        assert_eq!(back[0], 0x55);
    }
}
