//! The file-system facade: `create`/`open`/`remove`/`mkdir`/`chdir` over
//! absolute and relative paths, built on the FAT, inode, and directory
//! layers below.

pub mod dir;
pub mod fat;
pub mod file;
pub mod inode;
pub mod path;

use std::sync::Arc;

use crate::block::BlockDevice;
use crate::error::{KernelError, KResult};
use crate::fs::fat::Fat;
use crate::fs::inode::{Itable, RcInode};
use crate::param::{DIRENT_DOT_COUNT, DIRENT_SIZE, ROOT_CLUSTER};

/// Owns the FAT and inode table for one mounted disk, and implements path
/// resolution and the `create`/`open`/`remove`/`chdir` surface over them.
pub struct FileSystem {
    device: Arc<dyn BlockDevice>,
    fat: Arc<Fat>,
    itable: Itable,
}

impl FileSystem {
    /// Mount an already-formatted disk.
    pub fn open(device: Arc<dyn BlockDevice>) -> KResult<Self> {
        let fat = Arc::new(Fat::open(Arc::clone(&device))?);
        let itable = Itable::new(Arc::clone(&device), Arc::clone(&fat));
        Ok(FileSystem { device, fat, itable })
    }

    /// Format a fresh disk: initialize the FAT, then build the root
    /// directory at the fixed `ROOT_CLUSTER` identity with `.` and `..`
    /// both pointing at itself.
    pub fn format(device: Arc<dyn BlockDevice>) -> KResult<Self> {
        let fat = Arc::new(Fat::format(Arc::clone(&device))?);
        let itable = Itable::new(Arc::clone(&device), Arc::clone(&fat));
        let root = itable.build_at(ROOT_CLUSTER, (DIRENT_DOT_COUNT * DIRENT_SIZE) as u32, true)?;
        dir::add(device.as_ref(), &root, ".", ROOT_CLUSTER)?;
        dir::add(device.as_ref(), &root, "..", ROOT_CLUSTER)?;
        Ok(FileSystem { device, fat, itable })
    }

    pub fn root(&self) -> KResult<RcInode> {
        self.itable.get(ROOT_CLUSTER)
    }

    pub fn itable(&self) -> &Itable {
        &self.itable
    }

    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    /// Walk `path` one component at a time, starting from root if `path`
    /// is absolute or from `cwd` otherwise. Every component but the last
    /// must resolve to a directory. Returns the surviving parent directory
    /// and the final component's name (`"."` if `path` had no components
    /// at all, i.e. was `"/"` or empty).
    pub fn parse_path(&self, path: &str, cwd: &RcInode) -> KResult<(RcInode, String)> {
        let mut cur = if path::is_absolute(path) { self.root()? } else { cwd.clone() };
        let mut remaining = path;
        loop {
            match path::skip_elem(remaining) {
                None => return Ok((cur, ".".to_string())),
                Some((name, rest)) => {
                    path::check_name(name)?;
                    let more_follow = path::skip_elem(rest).is_some();
                    if !more_follow {
                        return Ok((cur, name.to_string()));
                    }
                    if !cur.is_dir() {
                        return Err(KernelError::NotADirectory);
                    }
                    let child_num = dir::lookup(self.device.as_ref(), &cur, name)?
                        .ok_or(KernelError::NotFound)?;
                    cur = self.itable.get(child_num)?;
                    remaining = rest;
                }
            }
        }
    }

    /// Resolve every component of `path`, including the last, failing if
    /// any non-final component isn't a directory. Used by `chdir`, which
    /// (unlike `parse_path`) has no "leave the last component unresolved
    /// for the caller to create" behavior.
    fn resolve_full(&self, path: &str, cwd: &RcInode) -> KResult<RcInode> {
        let (parent, name) = self.parse_path(path, cwd)?;
        if name == "." {
            return Ok(parent);
        }
        if !parent.is_dir() {
            return Err(KernelError::NotADirectory);
        }
        let inumber = dir::lookup(self.device.as_ref(), &parent, &name)?.ok_or(KernelError::NotFound)?;
        self.itable.get(inumber)
    }

    /// Create a plain file of `initial_size` bytes at `path`.
    pub fn create(&self, path: &str, initial_size: u32, cwd: &RcInode) -> KResult<()> {
        let (parent, name) = self.parse_path(path, cwd)?;
        if !parent.is_dir() {
            return Err(KernelError::NotADirectory);
        }
        let inode = self.itable.alloc(initial_size, false)?;
        if let Err(e) = dir::add(self.device.as_ref(), &parent, &name, inode.inumber) {
            inode.mark_removed();
            let _ = self.itable.put(inode);
            return Err(e);
        }
        Ok(())
    }

    /// Create a directory at `path`, with `.` and `..` already populated.
    pub fn create_dir(&self, path: &str, cwd: &RcInode) -> KResult<()> {
        let (parent, name) = self.parse_path(path, cwd)?;
        if !parent.is_dir() {
            return Err(KernelError::NotADirectory);
        }
        let inode = self.itable.alloc((DIRENT_DOT_COUNT * DIRENT_SIZE) as u32, true)?;
        let unwind = |inode: &RcInode| {
            inode.mark_removed();
            let _ = self.itable.put(inode.clone());
        };
        if let Err(e) = dir::add(self.device.as_ref(), &parent, &name, inode.inumber) {
            unwind(&inode);
            return Err(e);
        }
        if let Err(e) = dir::add(self.device.as_ref(), &inode, ".", inode.inumber) {
            let _ = dir::remove(self.device.as_ref(), &parent, &name);
            unwind(&inode);
            return Err(e);
        }
        if let Err(e) = dir::add(self.device.as_ref(), &inode, "..", parent.inumber) {
            let _ = dir::remove(self.device.as_ref(), &parent, &name);
            unwind(&inode);
            return Err(e);
        }
        Ok(())
    }

    /// Resolve `path` to its leaf inode, bumping its reference count.
    pub fn open(&self, path: &str, cwd: &RcInode) -> KResult<RcInode> {
        self.resolve_full(path, cwd)
    }

    /// Unlink a plain file. Directories are refused here — they have
    /// their own emptiness/current-directory checks and must go through
    /// `remove_dir`. §9: the source leaks the opened parent directory
    /// when it rejects a directory target; we always release `parent`
    /// through the normal `Drop`/`put` path before returning, whichever
    /// branch we take.
    pub fn remove(&self, path: &str, cwd: &RcInode) -> KResult<()> {
        let (parent, name) = self.parse_path(path, cwd)?;
        let inumber = dir::lookup(self.device.as_ref(), &parent, &name)?.ok_or(KernelError::NotFound)?;
        let target = self.itable.get(inumber)?;
        if target.is_dir() {
            let _ = self.itable.put(target);
            return Err(KernelError::NotADirectory);
        }
        dir::remove(self.device.as_ref(), &parent, &name)?;
        target.mark_removed();
        self.itable.put(target)
    }

    /// Unlink an empty, not-current directory.
    pub fn remove_dir(&self, path: &str, cwd: &RcInode, is_anyones_cwd: impl Fn(u32) -> bool) -> KResult<()> {
        let (parent, name) = self.parse_path(path, cwd)?;
        let inumber = dir::lookup(self.device.as_ref(), &parent, &name)?.ok_or(KernelError::NotFound)?;
        let target = self.itable.get(inumber)?;
        if !target.is_dir() {
            let _ = self.itable.put(target);
            return Err(KernelError::NotADirectory);
        }
        if !dir::is_empty(self.device.as_ref(), &target)? {
            let _ = self.itable.put(target);
            return Err(KernelError::DirectoryNotEmpty);
        }
        if is_anyones_cwd(inumber) {
            let _ = self.itable.put(target);
            return Err(KernelError::DirectoryBusy);
        }
        dir::remove(self.device.as_ref(), &parent, &name)?;
        target.mark_removed();
        self.itable.put(target)
    }

    /// Resolve `path` fully and return the inode to install as the
    /// caller's new current directory.
    pub fn chdir(&self, path: &str, cwd: &RcInode) -> KResult<RcInode> {
        let target = self.resolve_full(path, cwd)?;
        if !target.is_dir() {
            return Err(KernelError::NotADirectory);
        }
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemBlockDevice;

    fn mounted() -> FileSystem {
        let _ = env_logger::try_init();
        let dev: Arc<dyn BlockDevice> = Arc::new(MemBlockDevice::new(64));
        FileSystem::format(dev).unwrap()
    }

    #[test]
    fn root_is_its_own_dot_and_dot_dot() {
        let fs = mounted();
        let root = fs.root().unwrap();
        assert_eq!(dir::lookup(fs.device.as_ref(), &root, ".").unwrap(), Some(root.inumber));
        assert_eq!(dir::lookup(fs.device.as_ref(), &root, "..").unwrap(), Some(root.inumber));
    }

    #[test]
    fn create_then_open_round_trips() {
        let fs = mounted();
        let root = fs.root().unwrap();
        fs.create("/a", 100, &root).unwrap();
        let opened = fs.open("/a", &root).unwrap();
        assert_eq!(opened.len(), 100);
    }

    #[test]
    fn scenario_create_write_read_reports_fixed_size() {
        let fs = mounted();
        let root = fs.root().unwrap();
        fs.create("/a", 100, &root).unwrap();
        let file = fs.open("/a", &root).unwrap();
        file.write_at(fs.device.as_ref(), b"xyz", 0).unwrap();
        let mut buf = [0u8; 3];
        file.read_at(fs.device.as_ref(), &mut buf, 0).unwrap();
        assert_eq!(&buf, b"xyz");
        assert_eq!(file.len(), 100);
    }

    #[test]
    fn mkdir_nested_then_chdir_back() {
        let fs = mounted();
        let root = fs.root().unwrap();
        fs.create_dir("/d", &root).unwrap();
        let d = fs.chdir("/d", &root).unwrap();
        fs.create_dir("sub", &d).unwrap();
        let sub = fs.chdir("sub", &d).unwrap();
        let back_to_d = fs.chdir("..", &sub).unwrap();
        assert_eq!(back_to_d.inumber, d.inumber);
        let back_to_root = fs.chdir("..", &back_to_d).unwrap();
        assert_eq!(back_to_root.inumber, root.inumber);
        let opened = fs.open("/d/sub", &root).unwrap();
        assert!(opened.is_dir());
    }

    #[test]
    fn create_duplicate_name_fails_and_frees_cluster() {
        let fs = mounted();
        let root = fs.root().unwrap();
        fs.create("/a", 0, &root).unwrap();
        let free_before = fs.fat.capacity_clusters();
        assert!(fs.create("/a", 0, &root).is_err());
        assert_eq!(fs.fat.capacity_clusters(), free_before);
    }

    #[test]
    fn remove_rejects_directories() {
        let fs = mounted();
        let root = fs.root().unwrap();
        fs.create_dir("/d", &root).unwrap();
        assert_eq!(fs.remove("/d", &root), Err(KernelError::NotADirectory));
    }

    #[test]
    fn open_after_remove_still_works_until_last_close() {
        let fs = mounted();
        let root = fs.root().unwrap();
        fs.create("/a", 10, &root).unwrap();
        let handle = fs.open("/a", &root).unwrap();
        fs.remove("/a", &root).unwrap();
        // still-open handle keeps working
        handle.write_at(fs.device.as_ref(), b"ok", 0).unwrap();
        assert!(fs.open("/a", &root).is_err());
        fs.itable.put(handle).unwrap();
    }
}
