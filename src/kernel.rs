//! The kernel-wide context: one file system, one frame table, one swap
//! device, shared by every task.
//!
//! §9's redesign note replaces the source's scattered globals (`filesys_lock`,
//! a bare `struct list frame_table`, `swap_table`) with a single initialized-
//! once value passed by reference, with per-field locks where the fields are
//! genuinely independent — the FAT's own lock, the frame table's own lock,
//! and a crate-level `filesys_lock` for the multi-step directory operations
//! (§4.2) that need to appear atomic to concurrent lookups.

use std::sync::Arc;

use crate::block::BlockDevice;
use crate::error::KResult;
use crate::fs::FileSystem;
use crate::lock::Sleeplock;
use crate::vm::frame::FrameTable;
use crate::vm::swap::Swap;

/// Everything shared across every task: the mounted file system, the global
/// frame pool, and the swap device, plus the coarse lock serializing
/// multi-step path operations the way the teacher kernel's `icache.lock`
/// does for `namex`.
pub struct Kernel {
    pub fs: FileSystem,
    pub frames: FrameTable,
    pub swap: Swap,
    /// Held across `create`/`create_dir`/`remove`/`remove_dir`/`chdir`, so a
    /// concurrent lookup never observes a directory entry added but not yet
    /// linked to its freshly allocated inode (§4.2).
    pub filesys_lock: Sleeplock<()>,
}

impl Kernel {
    /// Format a fresh disk image and swap device and build a kernel context
    /// over them, with `frame_capacity` physical frames available.
    pub fn format(device: Arc<dyn BlockDevice>, swap_device: Arc<dyn BlockDevice>, frame_capacity: usize) -> KResult<Self> {
        let fs = FileSystem::format(device)?;
        Ok(Kernel {
            fs,
            frames: FrameTable::new(frame_capacity),
            swap: Swap::new(swap_device),
            filesys_lock: Sleeplock::new(()),
        })
    }

    /// Mount an already-formatted disk image and swap device.
    pub fn open(device: Arc<dyn BlockDevice>, swap_device: Arc<dyn BlockDevice>, frame_capacity: usize) -> KResult<Self> {
        let fs = FileSystem::open(device)?;
        Ok(Kernel {
            fs,
            frames: FrameTable::new(frame_capacity),
            swap: Swap::new(swap_device),
            filesys_lock: Sleeplock::new(()),
        })
    }

    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        self.fs.device()
    }
}
