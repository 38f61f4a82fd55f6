//! HALT/EXIT/FORK/EXEC/WAIT: the four syscalls whose real work happens in
//! the externally-supplied [`super::Scheduler`] (§1: the thread scheduler
//! and ELF loading are out of scope). This crate's job is argument
//! fetching and wiring the result back into the POSIX-like return
//! convention §6 specifies.

use crate::error::{KernelError, KResult};
use crate::kernel::Kernel;
use crate::param::MAX_PATH;
use crate::syscall::{Scheduler, SyscallArgs};
use crate::task::Task;

pub fn sys_halt(scheduler: &dyn Scheduler) -> KResult<i64> {
    scheduler.power_off();
}

pub fn sys_exit(kernel: &Kernel, task: &mut Task, args: &SyscallArgs) -> KResult<i64> {
    let status = args.int(0);
    task.exit(status, kernel)?;
    Ok(0)
}

pub fn sys_fork(kernel: &Kernel, scheduler: &dyn Scheduler, task: &mut Task, _args: &SyscallArgs) -> KResult<i64> {
    let child_page_table = scheduler.new_address_space();
    let child_tid_placeholder = 0;
    let child = task.fork(kernel, child_tid_placeholder, child_page_table)?;
    Ok(scheduler.spawn(child) as i64)
}

pub fn sys_exec(kernel: &Kernel, scheduler: &dyn Scheduler, task: &mut Task, args: &SyscallArgs) -> KResult<i64> {
    let mut buf = [0u8; MAX_PATH];
    let path = super::argstr(kernel, task, args, 0, &mut buf)?.to_string();
    scheduler.exec(task, &path)?;
    Ok(0)
}

pub fn sys_wait(scheduler: &dyn Scheduler, args: &SyscallArgs) -> KResult<i64> {
    let tid = args.int(0);
    scheduler.wait(tid).map(|status| status as i64).ok_or(KernelError::InvalidArgument)
}
