//! Open files, open directories, and the per-task descriptor table.
//!
//! §9 flags the teacher's (and the source's) habit of routing `readdir`
//! through a file struct that's ambiguously "maybe a directory" — we give
//! directory handles and file handles distinct variants instead, so a
//! file-fd simply has no `readdir` method to call.

use crate::block::BlockDevice;
use crate::error::{KernelError, KResult};
use crate::fs::dir;
use crate::fs::inode::RcInode;
use crate::param::MAX_FD;

/// An open file or directory, owned by one file descriptor slot.
pub enum OpenFile {
    File { inode: RcInode, pos: u64, deny_write: bool },
    Dir { inode: RcInode, read_pos: usize },
}

impl OpenFile {
    pub fn inode(&self) -> &RcInode {
        match self {
            OpenFile::File { inode, .. } => inode,
            OpenFile::Dir { inode, .. } => inode,
        }
    }

    /// Consume this handle and hand back its inode reference, for closing
    /// a descriptor through `Itable::put`.
    pub fn into_inode(self) -> RcInode {
        match self {
            OpenFile::File { inode, .. } => inode,
            OpenFile::Dir { inode, .. } => inode,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, OpenFile::Dir { .. })
    }

    pub fn inumber(&self) -> u32 {
        self.inode().inumber
    }

    pub fn filesize(&self) -> u64 {
        self.inode().len()
    }

    pub fn read(&mut self, device: &dyn BlockDevice, buf: &mut [u8]) -> KResult<usize> {
        match self {
            OpenFile::File { inode, pos, .. } => {
                let n = inode.read_at(device, buf, *pos)?;
                *pos += n as u64;
                Ok(n)
            }
            OpenFile::Dir { .. } => Err(KernelError::InvalidFd),
        }
    }

    pub fn write(&mut self, device: &dyn BlockDevice, buf: &[u8]) -> KResult<usize> {
        match self {
            OpenFile::File { inode, pos, deny_write } => {
                if *deny_write {
                    return Err(KernelError::InvalidArgument);
                }
                let n = inode.write_at(device, buf, *pos)?;
                *pos += n as u64;
                Ok(n)
            }
            OpenFile::Dir { .. } => Err(KernelError::InvalidFd),
        }
    }

    pub fn seek(&mut self, to: u64) -> KResult<()> {
        match self {
            OpenFile::File { pos, .. } => {
                *pos = to;
                Ok(())
            }
            OpenFile::Dir { .. } => Err(KernelError::InvalidFd),
        }
    }

    pub fn tell(&self) -> KResult<u64> {
        match self {
            OpenFile::File { pos, .. } => Ok(*pos),
            OpenFile::Dir { .. } => Err(KernelError::InvalidFd),
        }
    }

    /// Advance past one directory entry and return its name, or `None` at
    /// end-of-directory.
    pub fn readdir(&mut self, device: &dyn BlockDevice) -> KResult<Option<String>> {
        match self {
            OpenFile::Dir { inode, read_pos } => {
                let names = dir::list(device, inode)?;
                if *read_pos >= names.len() {
                    return Ok(None);
                }
                let name = names[*read_pos].clone();
                *read_pos += 1;
                Ok(Some(name))
            }
            OpenFile::File { .. } => Err(KernelError::InvalidFd),
        }
    }
}

/// Per-task fixed-size file descriptor table. Indices 0 and 1 never hold a
/// real entry: the syscall layer special-cases them as console stdin/stdout.
pub struct FdTable {
    slots: Vec<Option<OpenFile>>,
}

impl FdTable {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(MAX_FD);
        slots.resize_with(MAX_FD, || None);
        FdTable { slots }
    }

    /// Install `file` in the first free slot at index ≥ 2.
    pub fn install(&mut self, file: OpenFile) -> KResult<usize> {
        for (i, slot) in self.slots.iter_mut().enumerate().skip(2) {
            if slot.is_none() {
                *slot = Some(file);
                return Ok(i);
            }
        }
        Err(KernelError::FdTableFull)
    }

    pub fn get(&self, fd: usize) -> KResult<&OpenFile> {
        if fd < 2 {
            return Err(KernelError::InvalidFd);
        }
        self.slots.get(fd).and_then(|s| s.as_ref()).ok_or(KernelError::InvalidFd)
    }

    pub fn get_mut(&mut self, fd: usize) -> KResult<&mut OpenFile> {
        if fd < 2 {
            return Err(KernelError::InvalidFd);
        }
        self.slots.get_mut(fd).and_then(|s| s.as_mut()).ok_or(KernelError::InvalidFd)
    }

    /// Remove and return the entry at `fd`, so the caller can release its
    /// inode reference through `Itable::put`. §9: the source's `close`
    /// drops the slot without doing this, leaking the inode ref; we always
    /// hand the entry back.
    pub fn take(&mut self, fd: usize) -> KResult<OpenFile> {
        if fd < 2 {
            return Err(KernelError::InvalidFd);
        }
        self.slots.get_mut(fd).and_then(|s| s.take()).ok_or(KernelError::InvalidFd)
    }

    /// Duplicate every live entry into a fresh table with independent
    /// position counters, for `fork` (§4.8: "FDs are duplicated by
    /// reopening each underlying file").
    pub fn fork_duplicate(&self) -> Self {
        let mut slots = Vec::with_capacity(MAX_FD);
        for slot in &self.slots {
            slots.push(slot.as_ref().map(|f| match f {
                OpenFile::File { inode, pos, deny_write } => {
                    OpenFile::File { inode: inode.clone(), pos: *pos, deny_write: *deny_write }
                }
                OpenFile::Dir { inode, read_pos } => OpenFile::Dir { inode: inode.clone(), read_pos: *read_pos },
            }));
        }
        FdTable { slots }
    }
}

impl Default for FdTable {
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
    use std::sync::Arc;

    fn one_file() -> (Arc<dyn BlockDevice>, Itable, RcInode) {
        let dev: Arc<dyn BlockDevice> = Arc::new(MemBlockDevice::new(64));
        let fat = Arc::new(Fat::format(Arc::clone(&dev)).unwrap());
        let table = Itable::new(Arc::clone(&dev), fat);
        let inode = table.alloc(10, false).unwrap();
        (dev, table, inode)
    }

    #[test]
    fn install_skips_reserved_fds() {
        let (_dev, _table, inode) = one_file();
        let mut fds = FdTable::new();
        let fd = fds.install(OpenFile::File { inode, pos: 0, deny_write: false }).unwrap();
        assert!(fd >= 2);
    }

    #[test]
    fn read_write_through_fd_updates_position() {
        let (dev, _table, inode) = one_file();
        let mut fds = FdTable::new();
        let fd = fds.install(OpenFile::File { inode, pos: 0, deny_write: false }).unwrap();
        fds.get_mut(fd).unwrap().write(dev.as_ref(), b"xyz").unwrap();
        fds.get_mut(fd).unwrap().seek(0).unwrap();
        let mut buf = [0u8; 3];
        let n = fds.get_mut(fd).unwrap().read(dev.as_ref(), &mut buf).unwrap();
        assert_eq!(n, 3);
        assert_eq!(&buf, b"xyz");
    }

    #[test]
    fn fd_0_and_1_always_invalid() {
        let fds = FdTable::new();
        assert!(matches!(fds.get(0), Err(KernelError::InvalidFd)));
        assert!(matches!(fds.get(1), Err(KernelError::InvalidFd)));
    }

    #[test]
    fn table_full_reports_error() {
        let (dev, table, _inode) = one_file();
        let mut fds = FdTable::new();
        for _ in 2..MAX_FD {
            let inode = table.alloc(0, false).unwrap();
            fds.install(OpenFile::File { inode, pos: 0, deny_write: false }).unwrap();
        }
        let extra = table.alloc(0, false).unwrap();
        assert_eq!(fds.install(OpenFile::File { inode: extra, pos: 0, deny_write: false }), Err(KernelError::FdTableFull));
        let _ = dev;
    }
}
