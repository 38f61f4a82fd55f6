//! Per-task state: the supplemental page table, file descriptor table,
//! current working directory, and the fault/fork/teardown operations that
//! tie them to the kernel-wide frame table and file system.
//!
//! §1 treats "current task" as an external primitive the embedding kernel
//! supplies; this crate does not implement a scheduler (compare the
//! teacher's `proc::Proc`, which additionally owns a `Context` for
//! `swtch()` and a `Procstate` this crate has no use for). What it does
//! own is everything the VM/FS core actually touches per task, grounded
//! in the teacher's `ProcData` (`open_files`, `cwd`, `memory`).

use std::sync::Arc;

use crate::addr::VirtAddr;
use crate::error::{KernelError, KResult};
use crate::fs::file::FdTable;
use crate::fs::inode::RcInode;
use crate::kernel::Kernel;
use crate::param::{KERNEL_VADDR_BASE, MAX_FD, PAGE_SIZE, STACK_GROWTH_LIMIT, USER_STACK_TOP};
use crate::vm::frame::PageTable;
use crate::vm::page::Page;
use crate::vm::Spt;

/// A task's identity and the mutable state the VM/FS core needs to act on
/// its behalf: its address space (SPT + hardware page table), its open
/// files, and its current directory.
pub struct Task {
    pub tid: i32,
    pub spt: Spt,
    pub fd_table: FdTable,
    pub cwd: RcInode,
    pub page_table: Arc<dyn PageTable>,
    /// Lowest stack page allocated so far, shrinking toward
    /// `USER_STACK_TOP - STACK_GROWTH_LIMIT` as the stack grows (§4.4).
    pub stack_bottom: VirtAddr,
    /// The user `rsp` saved on syscall entry, so a page fault on a user
    /// buffer mid-syscall can still grow the stack (§4.4: `rsp_probe` is
    /// "the task's saved user `rsp`" when the fault came from kernel
    /// mode).
    pub saved_user_rsp: u64,
    pub exit_status: Option<i32>,
}

impl Task {
    pub fn new(tid: i32, cwd: RcInode, page_table: Arc<dyn PageTable>) -> Self {
        Task {
            tid,
            spt: Spt::new(),
            fd_table: FdTable::new(),
            cwd,
            page_table,
            stack_bottom: VirtAddr(USER_STACK_TOP),
            saved_user_rsp: USER_STACK_TOP,
            exit_status: None,
        }
    }

    /// Register the initial stack page at `USER_STACK_TOP - PAGE_SIZE`
    /// and claim it immediately, the one piece of ELF/exec's "feed the VM
    /// with initial page mappings" (§1) this crate performs directly
    /// since nothing else in scope does it.
    pub fn setup_initial_stack(&mut self, kernel: &Kernel) -> KResult<()> {
        let va = VirtAddr(USER_STACK_TOP - PAGE_SIZE as u64).page_floor();
        self.spt.insert(Page::new_stack(va))?;
        self.spt.claim(va, kernel.device().as_ref(), &kernel.frames, &kernel.swap, self.page_table.clone())?;
        self.stack_bottom = va;
        Ok(())
    }

    /// §4.4's fault classification, run in the order the spec lists:
    /// kernel address, protection violation, present-in-SPT, stack
    /// growth, otherwise fault.
    pub fn handle_fault(&mut self, kernel: &Kernel, addr: VirtAddr, rsp_probe: u64, _is_write: bool) -> KResult<()> {
        if addr.0 >= KERNEL_VADDR_BASE {
            return Err(KernelError::KernelAddress);
        }
        if self.page_table.is_protection_violation(addr) {
            return Err(KernelError::NotWritable);
        }
        let page_va = addr.page_floor();
        if self.spt.find(page_va).is_some() {
            self.spt.claim(page_va, kernel.device().as_ref(), &kernel.frames, &kernel.swap, self.page_table.clone())?;
            return Ok(());
        }
        let stack_floor = USER_STACK_TOP.saturating_sub(STACK_GROWTH_LIMIT);
        let looks_like_stack_growth =
            addr.0 + 8 >= rsp_probe && addr.0 <= USER_STACK_TOP && addr.0 >= stack_floor;
        if looks_like_stack_growth {
            let page_va = addr.page_floor();
            self.spt.insert(Page::new_stack(page_va))?;
            self.spt.claim(page_va, kernel.device().as_ref(), &kernel.frames, &kernel.swap, self.page_table.clone())?;
            if page_va.0 < self.stack_bottom.0 {
                self.stack_bottom = page_va;
            }
            return Ok(());
        }
        log::warn!("task {}: unhandled page fault at {:#x}", self.tid, addr.0);
        Err(KernelError::BadPointer)
    }

    /// Validate and, page by page, ensure residency for `[va, va+len)`
    /// (§4.7): every touched page must already be in the SPT or be a
    /// legal stack-growth fault; a write-required buffer must land on a
    /// writable page.
    fn validate_user_buffer(&mut self, kernel: &Kernel, va: VirtAddr, len: usize, need_write: bool) -> KResult<()> {
        if len == 0 {
            return Ok(());
        }
        if va.0 >= KERNEL_VADDR_BASE || va.0 + len as u64 > KERNEL_VADDR_BASE {
            return Err(KernelError::KernelAddress);
        }
        let start = va.page_floor();
        let end = (va + (len as u64 - 1)).page_floor();
        let mut cur = start;
        loop {
            match self.spt.find(cur) {
                Some(page_arc) => {
                    if need_write && !page_arc.lock().writable {
                        return Err(KernelError::NotWritable);
                    }
                    self.spt.claim(cur, kernel.device().as_ref(), &kernel.frames, &kernel.swap, self.page_table.clone())?;
                }
                None => {
                    self.handle_fault(kernel, cur, self.saved_user_rsp, need_write)?;
                }
            }
            if cur == end {
                break;
            }
            cur = cur + PAGE_SIZE as u64;
        }
        Ok(())
    }

    /// Copy `dst.len()` bytes starting at user address `srcva` into
    /// `dst`, validating and materializing pages as needed. Named after
    /// the teacher's `UserMemory::copy_in_bytes`.
    pub fn copy_in_bytes(&mut self, kernel: &Kernel, dst: &mut [u8], srcva: VirtAddr) -> KResult<()> {
        self.validate_user_buffer(kernel, srcva, dst.len(), false)?;
        let mut done = 0;
        while done < dst.len() {
            let va = srcva + done as u64;
            let page_va = va.page_floor();
            let frame = self.page_table.translate(page_va).ok_or(KernelError::BadPointer)?;
            let in_page = (va.0 - page_va.0) as usize;
            let n = (dst.len() - done).min(PAGE_SIZE - in_page);
            kernel.frames.bytes_mut(frame).with(|buf| dst[done..done + n].copy_from_slice(&buf[in_page..in_page + n]));
            done += n;
        }
        Ok(())
    }

    /// Copy `src` into user memory starting at `dstva`, marking any
    /// touched file-backed mapping dirty. Named after the teacher's
    /// `UserMemory::copy_out_bytes`.
    pub fn copy_out_bytes(&mut self, kernel: &Kernel, dstva: VirtAddr, src: &[u8]) -> KResult<()> {
        self.validate_user_buffer(kernel, dstva, src.len(), true)?;
        let mut done = 0;
        while done < src.len() {
            let va = dstva + done as u64;
            let page_va = va.page_floor();
            let frame = self.page_table.translate(page_va).ok_or(KernelError::BadPointer)?;
            let in_page = (va.0 - page_va.0) as usize;
            let n = (src.len() - done).min(PAGE_SIZE - in_page);
            kernel.frames.bytes_mut(frame).with(|buf| buf[in_page..in_page + n].copy_from_slice(&src[done..done + n]));
            if let Some(page_arc) = self.spt.find(page_va) {
                page_arc.lock().mark_dirty();
            }
            done += n;
        }
        Ok(())
    }

    /// Copy a NUL-terminated string out of user memory at `srcva`,
    /// reading one byte at a time so a too-long string fails cleanly
    /// instead of scanning past `buf`'s end. Named after the teacher's
    /// `UserMemory::copy_in_str`, which likewise returns a borrowed
    /// `CStr` into the caller's buffer rather than an owned `String`.
    pub fn copy_in_str<'a>(&mut self, kernel: &Kernel, buf: &'a mut [u8], srcva: VirtAddr) -> KResult<&'a cstr_core::CStr> {
        let mut i = 0;
        loop {
            if i >= buf.len() {
                return Err(KernelError::InvalidArgument);
            }
            self.copy_in_bytes(kernel, &mut buf[i..i + 1], srcva + i as u64)?;
            if buf[i] == 0 {
                // SAFETY: buf[..=i] was just written by copy_in_bytes and
                // contains exactly one NUL, at the last position.
                return Ok(unsafe { cstr_core::CStr::from_ptr(buf.as_ptr()) });
            }
            i += 1;
        }
    }

    /// Produce a child task sharing this task's current directory,
    /// an independently-positioned duplicate of its open files (§4.8:
    /// "FDs are duplicated by reopening each underlying file"), and an
    /// eagerly-copied address space.
    pub fn fork(&self, kernel: &Kernel, child_tid: i32, child_page_table: Arc<dyn PageTable>) -> KResult<Task> {
        let mut child = Task::new(child_tid, self.cwd.clone(), child_page_table.clone());
        self.spt.fork_into(&child.spt, kernel.device().as_ref(), &kernel.frames, &kernel.swap, self.page_table.clone(), child_page_table)?;
        child.fd_table = self.fd_table.fork_duplicate();
        child.stack_bottom = self.stack_bottom;
        Ok(child)
    }

    /// Tear down the task at `exit`: flush dirty file-backed pages and
    /// release every frame (`spt_kill`), then close every live file
    /// descriptor, releasing its inode reference through `Itable::put`
    /// (§9: the source's `close` leaks this; we always release it).
    pub fn exit(&mut self, status: i32, kernel: &Kernel) -> KResult<()> {
        self.exit_status = Some(status);
        self.spt.kill(kernel.device().as_ref(), &kernel.frames, self.page_table.as_ref())?;
        for fd in 2..MAX_FD {
            if let Ok(file) = self.fd_table.take(fd) {
                kernel.fs.itable().put(file.into_inode())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemBlockDevice;
    use crate::kernel::Kernel;
    use crate::vm::pagetable::TestPageTable;
    use std::sync::Arc;

    fn fresh_kernel() -> Kernel {
        let _ = env_logger::try_init();
        let dev: Arc<dyn BlockDevice> = Arc::new(MemBlockDevice::new(64));
        let swap_dev: Arc<dyn BlockDevice> =
            Arc::new(MemBlockDevice::new((crate::param::SECTORS_PER_PAGE * 8) as u32));
        Kernel::format(dev, swap_dev, 8).unwrap()
    }

    use crate::block::BlockDevice;

    #[test]
    fn stack_growth_allocates_one_page_below_rsp() {
        let kernel = fresh_kernel();
        let root = kernel.fs.root().unwrap();
        let pt: Arc<dyn PageTable> = Arc::new(TestPageTable::new());
        let mut task = Task::new(1, root, pt);
        task.setup_initial_stack(&kernel).unwrap();
        let before = task.stack_bottom;
        let fault_va = VirtAddr(before.0 - 4);
        task.handle_fault(&kernel, fault_va, fault_va.0, false).unwrap();
        assert!(task.stack_bottom.0 < before.0);
    }

    #[test]
    fn far_below_stack_limit_faults() {
        let kernel = fresh_kernel();
        let root = kernel.fs.root().unwrap();
        let pt: Arc<dyn PageTable> = Arc::new(TestPageTable::new());
        let mut task = Task::new(1, root, pt);
        task.setup_initial_stack(&kernel).unwrap();
        let addr = VirtAddr(USER_STACK_TOP - STACK_GROWTH_LIMIT - 0x1000);
        assert_eq!(task.handle_fault(&kernel, addr, addr.0, false), Err(KernelError::BadPointer));
    }

    #[test]
    fn kernel_address_is_rejected() {
        let kernel = fresh_kernel();
        let root = kernel.fs.root().unwrap();
        let pt: Arc<dyn PageTable> = Arc::new(TestPageTable::new());
        let mut task = Task::new(1, root, pt);
        assert_eq!(
            task.handle_fault(&kernel, VirtAddr(KERNEL_VADDR_BASE + 1), 0, false),
            Err(KernelError::KernelAddress)
        );
    }

    #[test]
    fn copy_out_then_in_round_trips_through_user_buffer() {
        let kernel = fresh_kernel();
        let root = kernel.fs.root().unwrap();
        let pt: Arc<dyn PageTable> = Arc::new(TestPageTable::new());
        let mut task = Task::new(1, root, pt);
        task.setup_initial_stack(&kernel).unwrap();
        let va = VirtAddr(0x1_0000_0000);
        task.spt.alloc_with_initializer(va, true, crate::vm::page::Aux::Anon).unwrap();
        task.copy_out_bytes(&kernel, va, b"hello").unwrap();
        let mut back = [0u8; 5];
        task.copy_in_bytes(&kernel, &mut back, va).unwrap();
        assert_eq!(&back, b"hello");
    }

    #[test]
    fn copy_in_str_stops_at_nul() {
        let kernel = fresh_kernel();
        let root = kernel.fs.root().unwrap();
        let pt: Arc<dyn PageTable> = Arc::new(TestPageTable::new());
        let mut task = Task::new(1, root, pt);
        task.setup_initial_stack(&kernel).unwrap();
        let va = VirtAddr(0x1_0000_0000);
        task.spt.alloc_with_initializer(va, true, crate::vm::page::Aux::Anon).unwrap();
        task.copy_out_bytes(&kernel, va, b"/a\0garbage").unwrap();
        let mut buf = [0u8; 16];
        let s = task.copy_in_str(&kernel, &mut buf, va).unwrap();
        assert_eq!(s.to_str().unwrap(), "/a");
    }

    #[test]
    fn fork_duplicates_cwd_and_address_space() {
        let kernel = fresh_kernel();
        let root = kernel.fs.root().unwrap();
        let parent_pt: Arc<dyn PageTable> = Arc::new(TestPageTable::new());
        let mut parent = Task::new(1, root, parent_pt);
        parent.setup_initial_stack(&kernel).unwrap();
        let va = VirtAddr(0x2_0000_0000);
        parent.spt.alloc_with_initializer(va, true, crate::vm::page::Aux::Anon).unwrap();
        parent.copy_out_bytes(&kernel, va, &[7]).unwrap();

        let child_pt: Arc<dyn PageTable> = Arc::new(TestPageTable::new());
        let mut child = parent.fork(&kernel, 2, child_pt).unwrap();
        let mut buf = [0u8; 1];
        child.copy_in_bytes(&kernel, &mut buf, va).unwrap();
        assert_eq!(buf[0], 7);

        // writes diverge after fork.
        parent.copy_out_bytes(&kernel, va, &[9]).unwrap();
        child.copy_in_bytes(&kernel, &mut buf, va).unwrap();
        assert_eq!(buf[0], 7);
    }

    #[test]
    fn exit_releases_open_file_descriptors() {
        let kernel = fresh_kernel();
        let root = kernel.fs.root().unwrap();
        kernel.fs.create("/a", 0, &root).unwrap();
        let pt: Arc<dyn PageTable> = Arc::new(TestPageTable::new());
        let mut task = Task::new(1, root.clone(), pt);
        let opened = kernel.fs.open("/a", &root).unwrap();
        task.fd_table.install(crate::fs::file::OpenFile::File { inode: opened, pos: 0, deny_write: false }).unwrap();
        task.exit(0, &kernel).unwrap();
        assert_eq!(task.exit_status, Some(0));
    }
}
