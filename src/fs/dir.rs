//! Directories: inodes whose body is a packed array of fixed-size entries.
//!
//! Grounded in the teacher's `fs::inode::{Itable::dirlookup, dirlink}`, with
//! the on-disk record laid out this crate's own way (see
//! [`crate::param::DIRENT_SIZE`]) since §6 leaves the exact byte layout to
//! the implementer.

use itertools::Itertools;
use zerocopy::{AsBytes, FromBytes};

use crate::block::BlockDevice;
use crate::error::{KernelError, KResult};
use crate::fs::inode::RcInode;
use crate::fs::path::check_name;
use crate::param::{DIRENT_SIZE, NAME_MAX};

#[repr(C)]
#[derive(AsBytes, FromBytes, Clone, Copy)]
struct RawDirent {
    in_use: u8,
    _pad0: [u8; 3],
    inumber: u32,
    name: [u8; NAME_MAX + 1],
    _pad1: u8,
}

static_assertions::const_assert_eq!(std::mem::size_of::<RawDirent>(), DIRENT_SIZE);

impl RawDirent {
    const EMPTY: RawDirent =
        RawDirent { in_use: 0, _pad0: [0; 3], inumber: 0, name: [0; NAME_MAX + 1], _pad1: 0 };

    fn name_str(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        std::str::from_utf8(&self.name[..end]).unwrap_or("")
    }

    fn set_name(&mut self, name: &str) {
        self.name = [0; NAME_MAX + 1];
        self.name[..name.len()].copy_from_slice(name.as_bytes());
    }
}

fn read_entry(device: &dyn BlockDevice, dir: &RcInode, index: usize) -> KResult<Option<RawDirent>> {
    let offset = (index * DIRENT_SIZE) as u64;
    if offset >= dir.len() {
        return Ok(None);
    }
    let mut raw = [0u8; DIRENT_SIZE];
    let n = dir.read_at(device, &mut raw, offset)?;
    if n < DIRENT_SIZE {
        return Ok(None);
    }
    Ok(RawDirent::read_from(&raw[..]))
}

fn write_entry(device: &dyn BlockDevice, dir: &RcInode, index: usize, entry: &RawDirent) -> KResult<()> {
    let offset = (index * DIRENT_SIZE) as u64;
    dir.write_at(device, entry.as_bytes(), offset)?;
    Ok(())
}

fn entry_count(dir: &RcInode) -> usize {
    (dir.len() as usize) / DIRENT_SIZE
}

/// Look up `name` in `dir`'s entries.
pub fn lookup(device: &dyn BlockDevice, dir: &RcInode, name: &str) -> KResult<Option<u32>> {
    for i in 0..entry_count(dir) {
        if let Some(entry) = read_entry(device, dir, i)? {
            if entry.in_use != 0 && entry.name_str() == name {
                return Ok(Some(entry.inumber));
            }
        }
    }
    Ok(None)
}

/// Add a `(name, inumber)` entry to `dir`, reusing a free slot if one
/// exists, failing if `name` already resolves.
pub fn add(device: &dyn BlockDevice, dir: &RcInode, name: &str, inumber: u32) -> KResult<()> {
    check_name(name)?;
    if lookup(device, dir, name)?.is_some() {
        return Err(KernelError::AlreadyExists);
    }
    let count = entry_count(dir);
    let mut free_slot = None;
    for i in 0..count {
        if let Some(entry) = read_entry(device, dir, i)? {
            if entry.in_use == 0 {
                free_slot = Some(i);
                break;
            }
        }
    }
    let mut entry = RawDirent::EMPTY;
    entry.in_use = 1;
    entry.inumber = inumber;
    entry.set_name(name);
    let index = free_slot.unwrap_or(count);
    write_entry(device, dir, index, &entry)
}

/// Clear the entry named `name`. Caller is responsible for the emptiness
/// and current-directory checks §4.2 requires for directory targets.
pub fn remove(device: &dyn BlockDevice, dir: &RcInode, name: &str) -> KResult<()> {
    for i in 0..entry_count(dir) {
        if let Some(mut entry) = read_entry(device, dir, i)? {
            if entry.in_use != 0 && entry.name_str() == name {
                entry.in_use = 0;
                return write_entry(device, dir, i, &entry);
            }
        }
    }
    Err(KernelError::NotFound)
}

/// `true` if `dir` contains nothing but `.` and `..`.
pub fn is_empty(device: &dyn BlockDevice, dir: &RcInode) -> KResult<bool> {
    for i in 0..entry_count(dir) {
        if let Some(entry) = read_entry(device, dir, i)? {
            if entry.in_use != 0 && entry.name_str() != "." && entry.name_str() != ".." {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

/// List every in-use entry's name, skipping `.`/`..`, in a stable sorted
/// order rather than on-disk slot order (which shifts as entries are
/// freed and reused).
pub fn list(device: &dyn BlockDevice, dir: &RcInode) -> KResult<Vec<String>> {
    let mut out = Vec::new();
    for i in 0..entry_count(dir) {
        if let Some(entry) = read_entry(device, dir, i)? {
            if entry.in_use != 0 && entry.name_str() != "." && entry.name_str() != ".." {
                out.push(entry.name_str().to_string());
            }
        }
    }
    Ok(out.into_iter().sorted().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemBlockDevice;
    use crate::fs::fat::Fat;
    use crate::fs::inode::Itable;
    use std::sync::Arc;

    fn setup() -> (Arc<dyn BlockDevice>, Itable) {
        let dev: Arc<dyn BlockDevice> = Arc::new(MemBlockDevice::new(64));
        let fat = Arc::new(Fat::format(Arc::clone(&dev)).unwrap());
        (Arc::clone(&dev), Itable::new(dev, fat))
    }

    #[test]
    fn add_then_lookup_round_trips() {
        let (dev, table) = setup();
        let dir = table.alloc(0, true).unwrap();
        add(dev.as_ref(), &dir, "a", 42).unwrap();
        assert_eq!(lookup(dev.as_ref(), &dir, "a").unwrap(), Some(42));
        assert_eq!(lookup(dev.as_ref(), &dir, "missing").unwrap(), None);
    }

    #[test]
    fn duplicate_name_rejected() {
        let (dev, table) = setup();
        let dir = table.alloc(0, true).unwrap();
        add(dev.as_ref(), &dir, "a", 1).unwrap();
        assert_eq!(add(dev.as_ref(), &dir, "a", 2), Err(KernelError::AlreadyExists));
    }

    #[test]
    fn remove_frees_slot_for_reuse() {
        let (dev, table) = setup();
        let dir = table.alloc(0, true).unwrap();
        add(dev.as_ref(), &dir, "a", 1).unwrap();
        remove(dev.as_ref(), &dir, "a").unwrap();
        assert_eq!(lookup(dev.as_ref(), &dir, "a").unwrap(), None);
        add(dev.as_ref(), &dir, "b", 2).unwrap();
        assert_eq!(entry_count(&dir), 2);
    }

    #[test]
    fn emptiness_ignores_dot_entries() {
        let (dev, table) = setup();
        let dir = table.alloc(0, true).unwrap();
        add(dev.as_ref(), &dir, ".", dir.inumber).unwrap();
        add(dev.as_ref(), &dir, "..", dir.inumber).unwrap();
        assert!(is_empty(dev.as_ref(), &dir).unwrap());
        add(dev.as_ref(), &dir, "child", 99).unwrap();
        assert!(!is_empty(dev.as_ref(), &dir).unwrap());
    }
}
