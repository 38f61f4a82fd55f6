//! Address newtypes.
//!
//! The teacher's `vm.rs` generates one wrapper type per address space with
//! a `define_addr_type!` macro rather than passing bare integers around;
//! we keep that habit for the one address space this crate actually
//! touches (user virtual addresses) instead of juggling raw `u64`s through
//! the SPT, frame table, and fault classifier.

use crate::param::PAGE_SIZE;

macro_rules! define_addr_type {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub u64);

        impl $name {
            pub fn page_floor(self) -> Self {
                $name(self.0 & !(PAGE_SIZE as u64 - 1))
            }

            pub fn is_page_aligned(self) -> bool {
                self.0 % PAGE_SIZE as u64 == 0
            }
        }

        impl core::ops::Add<u64> for $name {
            type Output = $name;
            fn add(self, rhs: u64) -> $name {
                $name(self.0 + rhs)
            }
        }

        impl core::ops::Sub<u64> for $name {
            type Output = $name;
            fn sub(self, rhs: u64) -> $name {
                $name(self.0 - rhs)
            }
        }
    };
}

define_addr_type!(VirtAddr);

/// A resident frame's identity. This crate owns physical-seeming memory
/// directly as plain buffers rather than mapping real hardware, so
/// "physical address" here just names which frame, not where it sits —
/// kept as its own type anyway so `PageTable::translate` can't be
/// confused with a `VirtAddr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhysAddr(pub u32);
