//! File-system and file-descriptor system calls: CREATE, REMOVE, OPEN,
//! FILESIZE, READ, WRITE, SEEK, TELL, CLOSE, MMAP, MUNMAP, CHDIR, MKDIR,
//! READDIR, ISDIR, INUMBER. Mostly argument fetching and FD-table lookups,
//! the way the teacher's own `syscall/file.rs` is mostly argument checking
//! before calling into `fs.rs`.

use arrayvec::ArrayVec;

use crate::error::{KernelError, KResult};
use crate::fs::file::OpenFile;
use crate::kernel::Kernel;
use crate::param::{MAX_PATH, NAME_MAX};
use crate::syscall::{Console, Scheduler, SyscallArgs};
use crate::task::Task;

/// Open file descriptor `fd` and build the matching `OpenFile` record,
/// a `Dir` handle if the target is a directory and a `File` handle
/// otherwise — distinct capabilities per §9's redesign note.
fn open_any(kernel: &Kernel, path: &str, cwd: &crate::fs::inode::RcInode) -> KResult<OpenFile> {
    let inode = kernel.fs.open(path, cwd)?;
    Ok(if inode.is_dir() {
        OpenFile::Dir { inode, read_pos: 0 }
    } else {
        OpenFile::File { inode, pos: 0, deny_write: false }
    })
}

pub fn sys_create(kernel: &Kernel, task: &mut Task, args: &SyscallArgs) -> KResult<i64> {
    let mut buf = [0u8; MAX_PATH];
    let name = super::argstr(kernel, task, args, 0, &mut buf)?.to_string();
    let size = args.int(1).max(0) as u32;
    let _guard = kernel.filesys_lock.lock();
    match kernel.fs.create(&name, size, &task.cwd) {
        Ok(()) => Ok(1),
        Err(e) if !e.is_user_fault() => Ok(0),
        Err(e) => Err(e),
    }
}

pub fn sys_remove(kernel: &Kernel, scheduler: &dyn Scheduler, task: &mut Task, args: &SyscallArgs) -> KResult<i64> {
    let mut buf = [0u8; MAX_PATH];
    let name = super::argstr(kernel, task, args, 0, &mut buf)?.to_string();
    let _guard = kernel.filesys_lock.lock();
    let result = match kernel.fs.remove(&name, &task.cwd) {
        Err(KernelError::NotADirectory) => {
            kernel.fs.remove_dir(&name, &task.cwd, |inumber| scheduler.is_cwd_of_any_task(inumber))
        }
        other => other,
    };
    match result {
        Ok(()) => Ok(1),
        Err(e) if !e.is_user_fault() => Ok(0),
        Err(e) => Err(e),
    }
}

pub fn sys_open(kernel: &Kernel, task: &mut Task, args: &SyscallArgs) -> KResult<i64> {
    let mut buf = [0u8; MAX_PATH];
    let name = super::argstr(kernel, task, args, 0, &mut buf)?.to_string();
    let _guard = kernel.filesys_lock.lock();
    match open_any(kernel, &name, &task.cwd) {
        Ok(file) => {
            let fd = task.fd_table.install(file)?;
            Ok(fd as i64)
        }
        Err(e) if !e.is_user_fault() => Ok(-1),
        Err(e) => Err(e),
    }
}

pub fn sys_filesize(task: &mut Task, args: &SyscallArgs) -> KResult<i64> {
    let fd = args.int(0) as usize;
    Ok(task.fd_table.get(fd)?.filesize() as i64)
}

pub fn sys_read(kernel: &Kernel, console: &dyn Console, task: &mut Task, args: &SyscallArgs) -> KResult<i64> {
    let fd = args.int(0) as usize;
    let va = args.addr(1);
    let n = args.int(2).max(0) as usize;

    if fd == 0 {
        let mut got = Vec::with_capacity(n);
        while got.len() < n {
            match console.read_byte() {
                Some(b) => got.push(b),
                None => break,
            }
        }
        task.copy_out_bytes(kernel, va, &got)?;
        return Ok(got.len() as i64);
    }
    if fd == 1 {
        return Err(KernelError::InvalidFd);
    }

    let _guard = kernel.filesys_lock.lock();
    let mut buf = vec![0u8; n];
    let read = task.fd_table.get_mut(fd)?.read(kernel.device().as_ref(), &mut buf)?;
    task.copy_out_bytes(kernel, va, &buf[..read])?;
    Ok(read as i64)
}

pub fn sys_write(kernel: &Kernel, console: &dyn Console, task: &mut Task, args: &SyscallArgs) -> KResult<i64> {
    let fd = args.int(0) as usize;
    let va = args.addr(1);
    let n = args.int(2).max(0) as usize;

    let mut buf = vec![0u8; n];
    task.copy_in_bytes(kernel, &mut buf, va)?;

    if fd == 1 {
        console.write(&buf);
        return Ok(buf.len() as i64);
    }
    if fd == 0 {
        return Err(KernelError::InvalidFd);
    }

    let _guard = kernel.filesys_lock.lock();
    let written = task.fd_table.get_mut(fd)?.write(kernel.device().as_ref(), &buf)?;
    Ok(written as i64)
}

pub fn sys_seek(task: &mut Task, args: &SyscallArgs) -> KResult<i64> {
    let fd = args.int(0) as usize;
    let pos = args.int(1).max(0) as u64;
    task.fd_table.get_mut(fd)?.seek(pos)?;
    Ok(0)
}

pub fn sys_tell(task: &mut Task, args: &SyscallArgs) -> KResult<i64> {
    let fd = args.int(0) as usize;
    // §9: the source falls off the end for fd < 2 instead of returning
    // an error; here `get` already reports `InvalidFd` for those.
    Ok(task.fd_table.get(fd)?.tell()? as i64)
}

pub fn sys_close(kernel: &Kernel, task: &mut Task, args: &SyscallArgs) -> KResult<i64> {
    let fd = args.int(0) as usize;
    let file = task.fd_table.take(fd)?;
    kernel.fs.itable().put(file.into_inode())?;
    Ok(0)
}

pub fn sys_mmap(_kernel: &Kernel, task: &mut Task, args: &SyscallArgs) -> KResult<i64> {
    let addr = args.addr(0);
    let length = args.int(1).max(0) as usize;
    let writable = args.int(2) != 0;
    let fd = args.int(3) as usize;
    let offset = args.int(4).max(0) as u64;

    if fd < 2 {
        return Err(KernelError::InvalidArgument);
    }
    let inode = task.fd_table.get(fd)?.inode().clone();
    task.spt.mmap(addr, length, writable, inode, offset)?;
    Ok(addr.0 as i64)
}

pub fn sys_munmap(kernel: &Kernel, task: &mut Task, args: &SyscallArgs) -> KResult<i64> {
    let addr = args.addr(0);
    task.spt.munmap(addr, kernel.device().as_ref(), &kernel.frames, task.page_table.as_ref())?;
    Ok(0)
}

pub fn sys_chdir(kernel: &Kernel, task: &mut Task, args: &SyscallArgs) -> KResult<i64> {
    let mut buf = [0u8; MAX_PATH];
    let name = super::argstr(kernel, task, args, 0, &mut buf)?.to_string();
    let _guard = kernel.filesys_lock.lock();
    match kernel.fs.chdir(&name, &task.cwd) {
        Ok(new_cwd) => {
            task.cwd = new_cwd;
            Ok(1)
        }
        Err(e) if !e.is_user_fault() => Ok(0),
        Err(e) => Err(e),
    }
}

pub fn sys_mkdir(kernel: &Kernel, task: &mut Task, args: &SyscallArgs) -> KResult<i64> {
    let mut buf = [0u8; MAX_PATH];
    let name = super::argstr(kernel, task, args, 0, &mut buf)?.to_string();
    let _guard = kernel.filesys_lock.lock();
    match kernel.fs.create_dir(&name, &task.cwd) {
        Ok(()) => Ok(1),
        Err(e) if !e.is_user_fault() => Ok(0),
        Err(e) => Err(e),
    }
}

pub fn sys_readdir(kernel: &Kernel, task: &mut Task, args: &SyscallArgs) -> KResult<i64> {
    let fd = args.int(0) as usize;
    let nameout = args.addr(1);
    let name = task.fd_table.get_mut(fd)?.readdir(kernel.device().as_ref())?;
    match name {
        Some(name) => {
            let mut out: ArrayVec<u8, { NAME_MAX + 1 }> = ArrayVec::new();
            out.try_extend_from_slice(name.as_bytes()).map_err(|_| KernelError::NameTooLong)?;
            out.push(0);
            task.copy_out_bytes(kernel, nameout, &out)?;
            Ok(1)
        }
        None => Ok(0),
    }
}

pub fn sys_isdir(task: &mut Task, args: &SyscallArgs) -> KResult<i64> {
    let fd = args.int(0) as usize;
    Ok(task.fd_table.get(fd)?.is_dir() as i64)
}

pub fn sys_inumber(task: &mut Task, args: &SyscallArgs) -> KResult<i64> {
    let fd = args.int(0) as usize;
    Ok(task.fd_table.get(fd)?.inumber() as i64)
}
