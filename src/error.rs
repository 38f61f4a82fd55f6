//! Crate-wide error type.
//!
//! The teacher kernel mostly returns bare `Result<T, ()>` at its innermost
//! layers (see `fs::inode::InodeGuard::read_internal` and friends) and only
//! gives errors names at the syscall boundary, where a `-1`/`false` has to be
//! produced. We keep that same shape — internal helpers that can only fail
//! one way still return `Result<T, ()>` — but give every error that can
//! reach a caller through the filesystem/VM/syscall facades a name, grouped
//! along the five categories from the error-handling design.

use core::fmt;

/// Every error the kernel core's public API can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    // -- user faults --
    /// A user-supplied pointer referred to kernel address space.
    KernelAddress,
    /// A user-supplied pointer did not resolve to a mapped, accessible page.
    BadPointer,
    /// A write was attempted through a read-only mapping.
    NotWritable,
    /// The file descriptor argument was out of range or unused.
    InvalidFd,
    /// A syscall argument was structurally invalid (e.g. unaligned `mmap`
    /// address, zero-length mapping, negative size).
    InvalidArgument,

    // -- resource exhaustion --
    /// The FAT has no free cluster left to allocate.
    NoSpace,
    /// The swap device has no free slot left to evict a page into.
    NoSwapSlot,
    /// The task's file descriptor table is full.
    FdTableFull,
    /// The global frame table could not produce a frame even after eviction.
    OutOfFrames,

    // -- path errors --
    /// A path component does not exist.
    NotFound,
    /// A non-final path component was not a directory.
    NotADirectory,
    /// A path component exceeded [`crate::param::NAME_MAX`].
    NameTooLong,
    /// `create`/`mkdir` target already exists.
    AlreadyExists,

    // -- consistency errors --
    /// `remove`/`rmdir` target is a non-empty directory.
    DirectoryNotEmpty,
    /// `remove`/`rmdir` target is some task's current directory.
    DirectoryBusy,
    /// The address range requested for `mmap`/page allocation overlaps an
    /// existing mapping.
    AlreadyMapped,

    // -- kernel-fatal --
    /// The on-disk FAT failed an integrity check (cycle, out-of-range link).
    FatCorrupt,
    /// An inode header's magic number did not match.
    BadInodeMagic,
    /// A frame was released twice, or released while still mapped.
    DoubleFree,
    /// The underlying block device reported an I/O failure.
    IoError,
}

impl KernelError {
    /// True for the categories the syscall dispatcher converts to
    /// `exit(-1)` rather than an in-band `-1`/`false` return (§7 category 1).
    pub fn is_user_fault(self) -> bool {
        matches!(
            self,
            KernelError::KernelAddress | KernelError::BadPointer | KernelError::NotWritable
        )
    }

    /// True for the categories that should halt the kernel with a
    /// diagnostic rather than merely fail the current operation (§7
    /// category 5).
    pub fn is_kernel_fatal(self) -> bool {
        matches!(
            self,
            KernelError::FatCorrupt | KernelError::BadInodeMagic | KernelError::DoubleFree
        )
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            KernelError::KernelAddress => "pointer refers to kernel address space",
            KernelError::BadPointer => "pointer does not resolve to a mapped page",
            KernelError::NotWritable => "write through read-only mapping",
            KernelError::InvalidFd => "invalid file descriptor",
            KernelError::InvalidArgument => "invalid argument",
            KernelError::NoSpace => "no free cluster",
            KernelError::NoSwapSlot => "no free swap slot",
            KernelError::FdTableFull => "file descriptor table full",
            KernelError::OutOfFrames => "out of physical frames",
            KernelError::NotFound => "no such file or directory",
            KernelError::NotADirectory => "not a directory",
            KernelError::NameTooLong => "name too long",
            KernelError::AlreadyExists => "file already exists",
            KernelError::DirectoryNotEmpty => "directory not empty",
            KernelError::DirectoryBusy => "directory is some task's current directory",
            KernelError::AlreadyMapped => "address range already mapped",
            KernelError::FatCorrupt => "FAT integrity check failed",
            KernelError::BadInodeMagic => "inode magic mismatch",
            KernelError::DoubleFree => "frame freed twice",
            KernelError::IoError => "block device I/O error",
        };
        f.write_str(msg)
    }
}

pub type KResult<T> = Result<T, KernelError>;
