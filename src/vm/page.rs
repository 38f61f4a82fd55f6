//! Page descriptors.
//!
//! §9's redesign note replaces the source's function-pointer
//! `page_operations` table with a tagged variant: `swap_in`/`swap_out`
//! dispatch on `PageState` directly instead of indirecting through a
//! per-kind vtable. With only two destined types (anonymous, file-backed)
//! a `match` says everything the vtable did.

use crate::addr::{PhysAddr, VirtAddr};
use crate::block::BlockDevice;
use crate::error::KResult;
use crate::fs::inode::RcInode;
use crate::param::PAGE_SIZE;
use crate::vm::swap::Swap;

/// What an `Uninit` page will become once claimed, and the data its
/// initializer needs.
#[derive(Clone)]
pub enum Aux {
    Anon,
    File { inode: RcInode, offset: u64, read_bytes: u32, zero_bytes: u32, group_va: VirtAddr },
}

/// A page descriptor's type-specific state.
pub enum PageState {
    Uninit { aux: Aux },
    Anon { swap_slot: Option<u32> },
    File { inode: RcInode, offset: u64, read_bytes: u32, zero_bytes: u32, group_va: VirtAddr, dirty: bool },
}

/// One page-aligned virtual address's worth of SPT bookkeeping.
pub struct Page {
    pub va: VirtAddr,
    pub writable: bool,
    pub resident: bool,
    /// Which frame currently backs this page, when resident. Mirrors §3's
    /// descriptor shape directly (`frame?`) rather than making callers
    /// reverse-look-up the frame table to find it.
    pub frame: Option<PhysAddr>,
    pub state: PageState,
    /// Distinguishes stack pages from ordinary anonymous pages (§4.4's
    /// `VM_MARKER_0`) — fork's `setup_stack` path checks this instead of
    /// `memcpy`-ing stack contents like it does for other ANON pages.
    pub is_stack: bool,
}

impl Page {
    pub fn new_uninit(va: VirtAddr, writable: bool, aux: Aux) -> Self {
        Page { va, writable, resident: false, state: PageState::Uninit { aux }, is_stack: false }
    }

    pub fn new_stack(va: VirtAddr) -> Self {
        Page {
            va,
            writable: true,
            resident: false,
            state: PageState::Anon { swap_slot: None },
            is_stack: true,
        }
    }

    /// Transform an `Uninit` page into its destined `Anon`/`File` state
    /// and fill `frame` with its initial contents. Called once, the first
    /// time the page is claimed.
    pub fn initialize(&mut self, device: &dyn BlockDevice, frame: &mut [u8; PAGE_SIZE]) -> KResult<()> {
        if !matches!(self.state, PageState::Uninit { .. }) {
            return Ok(());
        }
        let previous = std::mem::replace(&mut self.state, PageState::Anon { swap_slot: None });
        let aux = match previous {
            PageState::Uninit { aux } => aux,
            _ => unreachable!(),
        };
        match aux {
            Aux::Anon => {
                *frame = [0u8; PAGE_SIZE];
                self.state = PageState::Anon { swap_slot: None };
            }
            Aux::File { inode, offset, read_bytes, zero_bytes, group_va } => {
                *frame = [0u8; PAGE_SIZE];
                let read_bytes = read_bytes as usize;
                inode.read_at(device, &mut frame[..read_bytes], offset)?;
                let _ = zero_bytes;
                self.state = PageState::File {
                    inode,
                    offset,
                    read_bytes: read_bytes as u32,
                    zero_bytes: (PAGE_SIZE - read_bytes) as u32,
                    group_va,
                    dirty: false,
                };
            }
        }
        self.resident = true;
        Ok(())
    }

    /// Populate `frame` with this (already-initialized) page's contents,
    /// for a page being re-claimed after eviction.
    pub fn swap_in(&mut self, device: &dyn BlockDevice, swap: &Swap, frame: &mut [u8; PAGE_SIZE]) -> KResult<()> {
        match &mut self.state {
            PageState::Uninit { .. } => self.initialize(device, frame),
            PageState::Anon { swap_slot } => {
                if let Some(slot) = swap_slot.take() {
                    swap.read_in(slot, frame)?;
                } else {
                    *frame = [0u8; PAGE_SIZE];
                }
                self.resident = true;
                Ok(())
            }
            PageState::File { inode, offset, read_bytes, .. } => {
                *frame = [0u8; PAGE_SIZE];
                inode.read_at(device, &mut frame[..*read_bytes as usize], *offset)?;
                self.resident = true;
                Ok(())
            }
        }
    }

    /// Evict this page's resident frame: for `Anon`, write to swap; for
    /// `File`, write back to the backing file if dirty. Returns `Ok(())`
    /// on success; `Err(NoSwapSlot)` only for `Anon` pages when swap is
    /// full, which the frame table treats as a fatal eviction failure
    /// (§4.5: "dirty file-mapped pages write back instead").
    pub fn swap_out(&mut self, device: &dyn BlockDevice, swap: &Swap, frame: &[u8; PAGE_SIZE]) -> KResult<()> {
        match &mut self.state {
            PageState::Anon { swap_slot } => {
                let slot = swap.write_out(frame)?;
                *swap_slot = Some(slot);
                self.resident = false;
                Ok(())
            }
            PageState::File { inode, offset, read_bytes, dirty, .. } => {
                if *dirty {
                    inode.write_at(device, &frame[..*read_bytes as usize], *offset)?;
                    *dirty = false;
                }
                self.resident = false;
                Ok(())
            }
            PageState::Uninit { .. } => unreachable!("uninit pages are never resident"),
        }
    }

    /// Mark a file-backed page dirty after a write through its mapping.
    /// Anonymous pages have no dirty tracking distinct from "resident";
    /// they always write back on eviction.
    pub fn mark_dirty(&mut self) {
        if let PageState::File { dirty, .. } = &mut self.state {
            *dirty = true;
        }
    }

    /// `true` for `File` pages sharing `group_va` — used by `munmap` to
    /// find every page in one mapping group.
    pub fn group_va(&self) -> Option<VirtAddr> {
        match &self.state {
            PageState::File { group_va, .. } => Some(*group_va),
            PageState::Uninit { aux: Aux::File { group_va, .. } } => Some(*group_va),
            _ => None,
        }
    }

    pub fn is_uninit(&self) -> bool {
        matches!(self.state, PageState::Uninit { .. })
    }

    /// Recover the `Aux` that would reproduce this descriptor's destined
    /// type from scratch, whether it is still `Uninit` or has already been
    /// materialized. Used by `fork`, which builds the child's descriptor
    /// the same way regardless of whether the parent ever actually faulted
    /// it in.
    pub fn fork_aux(&self) -> Aux {
        match &self.state {
            PageState::Uninit { aux } => aux.clone(),
            PageState::Anon { .. } => Aux::Anon,
            PageState::File { inode, offset, read_bytes, zero_bytes, group_va, .. } => Aux::File {
                inode: inode.clone(),
                offset: *offset,
                read_bytes: *read_bytes,
                zero_bytes: *zero_bytes,
                group_va: *group_va,
            },
        }
    }

    /// Final writeback for a resident `File` page at teardown
    /// (`spt_kill`), independent of the frame table's eviction path.
    pub fn flush_if_dirty(&mut self, device: &dyn BlockDevice, frame: &[u8; PAGE_SIZE]) -> KResult<()> {
        if let PageState::File { inode, offset, read_bytes, dirty, .. } = &mut self.state {
            if *dirty {
                inode.write_at(device, &frame[..*read_bytes as usize], *offset)?;
                *dirty = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemBlockDevice;
    use std::sync::Arc;

    #[test]
    fn uninit_anon_initializes_to_zero() {
        let dev: Arc<dyn BlockDevice> = Arc::new(MemBlockDevice::new(4));
        let mut page = Page::new_uninit(VirtAddr(0x1000), true, Aux::Anon);
        let mut frame = [0xFFu8; PAGE_SIZE];
        page.initialize(dev.as_ref(), &mut frame).unwrap();
        assert_eq!(frame, [0u8; PAGE_SIZE]);
        assert!(page.resident);
    }

    #[test]
    fn anon_swap_out_then_in_preserves_contents() {
        let dev: Arc<dyn BlockDevice> = Arc::new(MemBlockDevice::new(4));
        let swap_dev: Arc<dyn BlockDevice> =
            Arc::new(MemBlockDevice::new((crate::param::SECTORS_PER_PAGE * 2) as u32));
        let swap = Swap::new(swap_dev);
        let mut page = Page::new_stack(VirtAddr(0x4000_0000));
        let mut frame = [0u8; PAGE_SIZE];
        frame[0] = 0x77;
        page.swap_out(dev.as_ref(), &swap, &frame).unwrap();
        assert!(!page.resident);
        let mut back = [0u8; PAGE_SIZE];
        page.swap_in(dev.as_ref(), &swap, &mut back).unwrap();
        assert_eq!(back[0], 0x77);
        assert!(page.resident);
    }
}
