//! Tunable constants for the kernel core.
//!
//! Mirrors the role of a teaching kernel's `param.rs`: every magic number
//! that shows up more than once lives here instead of at its call site.

/// Size of one disk sector in bytes. A cluster is exactly one sector.
pub const SECTOR_SIZE: usize = 512;

/// Cluster 0 is reserved and never allocated.
pub const CLUSTER_RESERVED: u32 = 0;

/// Cluster 1 holds the FAT's own on-disk image.
pub const FAT_CLUSTER: u32 = 1;

/// Cluster 2 is the first cluster available to `create_chain`, and also
/// where the root directory is rooted.
pub const ROOT_CLUSTER: u32 = 2;

/// Longest name a single path component may have.
pub const NAME_MAX: usize = 14;

/// On-disk size, in bytes, of one directory entry: `in_use:1 + pad:3 +
/// inumber:4 + name:15 + pad:1`, 24 bytes total. The name field has to hold
/// `NAME_MAX + 1` bytes for the trailing NUL, which doesn't fit in the
/// illustrative 20-byte sketch alongside 4-byte-aligned `inumber` — we keep
/// every other field and round the record up to a 4-byte multiple instead.
pub const DIRENT_SIZE: usize = 24;

/// Number of entries every freshly created directory starts with (`.`, `..`).
pub const DIRENT_DOT_COUNT: usize = 2;

/// Max open file descriptors per task. Indices 0 and 1 are reserved for
/// stdin/stdout and never refer to a real file.
pub const MAX_FD: usize = 128;

/// Page size in bytes, matching a typical teaching-kernel (Pintos-derived)
/// target: 4 KiB user pages.
pub const PAGE_SIZE: usize = 4096;

/// Sectors needed to back one page-sized swap slot.
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;

/// Top of the user address space's stack region.
pub const USER_STACK_TOP: u64 = 0x4747_7000;

/// Stack growth is only granted within this many bytes below
/// [`USER_STACK_TOP`].
pub const STACK_GROWTH_LIMIT: u64 = 1024 * 1024;

/// Lowest virtual address reserved for the kernel. Any user pointer at or
/// above this is rejected outright by fault classification step 1 and by
/// syscall pointer validation, without ever consulting the SPT.
pub const KERNEL_VADDR_BASE: u64 = 0x8000_0000_0000;

/// Longest a `READ`/`WRITE`/`EXEC` command line or path argument the
/// syscall layer will copy in from user memory before giving up and
/// reporting an error, mirroring a teaching kernel's fixed `MAXPATH`-style
/// stack buffer instead of an unbounded heap allocation driven by
/// attacker-controlled length.
pub const MAX_PATH: usize = 128;
