//! Lock wrappers.
//!
//! §1 assumes "a binary sleeping lock with priority donation" is provided by
//! the embedding kernel and is not this crate's to implement, the same way
//! the teacher kernel's `lock` module assumes an interrupt controller and a
//! `Cpu` table it can busy-wait against. What *is* this crate's concern is
//! distinguishing, at each call site, a lock meant to be held briefly
//! (the frame table, the FAT) from one meant to be held across disk I/O (an
//! inode). We keep the teacher's two-name split — `Spinlock` / `Sleeplock` —
//! as a documentation device even though, without a scheduler underneath us,
//! both compile down to the same `spin::Mutex`.

use spin::{Mutex, MutexGuard};

/// A lock meant to be held only across short, non-blocking critical
/// sections (frame-table bookkeeping, FAT cluster links).
pub struct Spinlock<T> {
    inner: Mutex<T>,
}

impl<T> Spinlock<T> {
    pub const fn new(data: T) -> Self {
        Self { inner: Mutex::new(data) }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock()
    }
}

/// A lock meant to be held across operations that may suspend the caller
/// (disk reads/writes on a locked inode). Named separately from
/// [`Spinlock`] purely to document intent at call sites, per §5's
/// suspension-point model.
pub struct Sleeplock<T> {
    inner: Mutex<T>,
}

impl<T> Sleeplock<T> {
    pub const fn new(data: T) -> Self {
        Self { inner: Mutex::new(data) }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock()
    }
}
