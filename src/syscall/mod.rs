//! The system-call dispatcher (§4.7, §6): marshals a syscall number and up
//! to six register-sized arguments into one of the kernel-core operations,
//! after validating every user pointer the call touches.
//!
//! Grounded in the teacher's `KernelCtx::syscall` match-based dispatch and
//! its `CurrentProc::{argint, argaddr, argstr, fetchaddr, fetchstr}` helper
//! family; `Console`/`Scheduler` mirror the teacher's externalized
//! `arch::interface::{PowerOff, TrapManager}` pattern for the pieces §1
//! calls out as provided by the embedding kernel rather than this crate
//! (the scheduler proper, ELF loading, console wiring).

mod file;
mod proc;

use crate::error::{KernelError, KResult};
use crate::kernel::Kernel;
use crate::param::MAX_PATH;
use crate::task::Task;

/// A line-buffered console, the one piece of "console I/O primitives"
/// (§1 non-goal) the dispatcher still needs a handle to, for FDs 0/1.
pub trait Console: Send + Sync {
    /// Consume and return the next input byte, or `None` if none is
    /// currently available.
    fn read_byte(&self) -> Option<u8>;
    fn write(&self, buf: &[u8]);
}

/// The process-management primitives FORK/EXEC/WAIT/HALT need, which live
/// entirely in the scheduler/ELF-loader §1 places out of scope. Grounded
/// in the teacher's `arch::interface::{PowerOff, ProcManager}` split: the
/// core depends on the *shape* of these operations without implementing
/// them.
pub trait Scheduler: Send + Sync {
    /// Register `child` as a new schedulable task and return its tid.
    fn spawn(&self, child: Task) -> i32;
    /// Block the caller until task `tid` exits, returning its exit status.
    /// `None` if `tid` names no task that is a child of the caller.
    fn wait(&self, tid: i32) -> Option<i32>;
    /// Replace `task`'s address space with the program found at `path`.
    /// Does not return on success (the caller's stack frame is gone).
    fn exec(&self, task: &mut Task, path: &str) -> KResult<()>;
    /// Power off the machine. Never returns.
    fn power_off(&self) -> !;
    /// `true` if `inumber` is any live task's current directory, the
    /// check `remove_dir` needs before unlinking a directory (§4.2).
    fn is_cwd_of_any_task(&self, inumber: u32) -> bool;
    /// Allocate a fresh, empty hardware page table for a child address
    /// space. `fork` must never hand the child the parent's own
    /// [`crate::vm::frame::PageTable`] — the teacher's own `memory.clone()`
    /// (`UserMemory::clone`) allocates a brand new page directory for
    /// exactly this reason, since the parent and child need independent
    /// mappings despite the eagerly-copied frame contents.
    fn new_address_space(&self) -> std::sync::Arc<dyn crate::vm::frame::PageTable>;
}

pub const SYS_HALT: i32 = 0;
pub const SYS_EXIT: i32 = 1;
pub const SYS_FORK: i32 = 2;
pub const SYS_EXEC: i32 = 3;
pub const SYS_WAIT: i32 = 4;
pub const SYS_CREATE: i32 = 5;
pub const SYS_REMOVE: i32 = 6;
pub const SYS_OPEN: i32 = 7;
pub const SYS_FILESIZE: i32 = 8;
pub const SYS_READ: i32 = 9;
pub const SYS_WRITE: i32 = 10;
pub const SYS_SEEK: i32 = 11;
pub const SYS_TELL: i32 = 12;
pub const SYS_CLOSE: i32 = 13;
pub const SYS_MMAP: i32 = 14;
pub const SYS_MUNMAP: i32 = 15;
pub const SYS_CHDIR: i32 = 16;
pub const SYS_MKDIR: i32 = 17;
pub const SYS_READDIR: i32 = 18;
pub const SYS_ISDIR: i32 = 19;
pub const SYS_INUMBER: i32 = 20;

/// Six register-sized argument slots, the way the teacher's `argraw`
/// indexes into the trap frame's parameter registers.
pub struct SyscallArgs(pub [u64; 6]);

impl SyscallArgs {
    pub fn int(&self, n: usize) -> i32 {
        self.0[n] as i32
    }

    pub fn addr(&self, n: usize) -> crate::addr::VirtAddr {
        crate::addr::VirtAddr(self.0[n])
    }
}

/// Entry point for every syscall trap: look up the syscall number, dispatch
/// to the matching `sys_*` handler, and convert any user-fault error into
/// `exit(-1)` the way §7 requires ("exceptions propagating out of the
/// dispatcher are converted to `exit(-1)`"). A kernel-fatal error (§7
/// category 5: FAT corruption, inode magic mismatch, a double-freed frame)
/// is not a per-task condition at all — it halts with a diagnostic instead
/// of returning to the faulting task.
pub fn syscall(
    kernel: &Kernel,
    scheduler: &dyn Scheduler,
    console: &dyn Console,
    task: &mut Task,
    num: i32,
    args: &SyscallArgs,
) -> i64 {
    let result = dispatch(kernel, scheduler, console, task, num, args);
    match result {
        Ok(v) => v,
        Err(e) if e.is_kernel_fatal() => {
            log::error!("task {}: kernel-fatal error: {e}", task.tid);
            panic!("kernel-fatal: {e}");
        }
        Err(e) if e.is_user_fault() => {
            log::warn!("task {}: {e}, terminating", task.tid);
            let _ = task.exit(-1, kernel);
            -1
        }
        Err(e) => {
            log::warn!("task {}: syscall {num} failed: {e}", task.tid);
            -1
        }
    }
}

fn dispatch(
    kernel: &Kernel,
    scheduler: &dyn Scheduler,
    console: &dyn Console,
    task: &mut Task,
    num: i32,
    args: &SyscallArgs,
) -> KResult<i64> {
    match num {
        SYS_HALT => proc::sys_halt(scheduler),
        SYS_EXIT => proc::sys_exit(kernel, task, args),
        SYS_FORK => proc::sys_fork(kernel, scheduler, task, args),
        SYS_EXEC => proc::sys_exec(kernel, scheduler, task, args),
        SYS_WAIT => proc::sys_wait(scheduler, args),
        SYS_CREATE => file::sys_create(kernel, task, args),
        SYS_REMOVE => file::sys_remove(kernel, scheduler, task, args),
        SYS_OPEN => file::sys_open(kernel, task, args),
        SYS_FILESIZE => file::sys_filesize(task, args),
        SYS_READ => file::sys_read(kernel, console, task, args),
        SYS_WRITE => file::sys_write(kernel, console, task, args),
        SYS_SEEK => file::sys_seek(task, args),
        SYS_TELL => file::sys_tell(task, args),
        SYS_CLOSE => file::sys_close(kernel, task, args),
        SYS_MMAP => file::sys_mmap(kernel, task, args),
        SYS_MUNMAP => file::sys_munmap(kernel, task, args),
        SYS_CHDIR => file::sys_chdir(kernel, task, args),
        SYS_MKDIR => file::sys_mkdir(kernel, task, args),
        SYS_READDIR => file::sys_readdir(kernel, task, args),
        SYS_ISDIR => file::sys_isdir(task, args),
        SYS_INUMBER => file::sys_inumber(task, args),
        _ => {
            log::warn!("task {}: unknown syscall {num}", task.tid);
            Err(KernelError::InvalidArgument)
        }
    }
}

/// Fetch the nul-terminated string argument `n` into a fixed [`MAX_PATH`]
/// stack buffer, mirroring the teacher's `argstr` (which copies into a
/// caller-stack `[u8; MAXPATH]` rather than allocating).
fn argstr<'a>(kernel: &Kernel, task: &mut Task, args: &SyscallArgs, n: usize, buf: &'a mut [u8; MAX_PATH]) -> KResult<&'a str> {
    let cstr = task.copy_in_str(kernel, buf, args.addr(n))?;
    cstr.to_str().map_err(|_| KernelError::InvalidArgument)
}
