//! A software stand-in for the hardware page-table primitive §1 assumes
//! exists. Real embedders supply their own `PageTable` impl backed by
//! actual MMU structures; this one backs the crate's own test suite and
//! the `inspect()`-style diagnostic from `original_source/vm/inspect.c`.

use std::collections::HashMap;
use std::sync::Mutex;

use bitflags::bitflags;

use crate::addr::{PhysAddr, VirtAddr};
use crate::error::KResult;
use crate::vm::frame::PageTable;

bitflags! {
    /// Stand-in for the status bits a real PTE packs alongside the frame
    /// number: writable, accessed, and (for exercising fault
    /// classification step 2 without real write-protect hardware) a
    /// test-only "force a protection violation here" bit.
    struct PteFlags: u8 {
        const WRITABLE = 0b001;
        const ACCESSED = 0b010;
        const PROTECTION_VIOLATION = 0b100;
    }
}

struct Entry {
    frame: PhysAddr,
    flags: PteFlags,
}

/// An in-memory `PageTable` over a plain hash map, used in tests in place
/// of a real MMU.
pub struct TestPageTable {
    entries: Mutex<HashMap<u64, Entry>>,
}

impl TestPageTable {
    pub fn new() -> Self {
        TestPageTable { entries: Mutex::new(HashMap::new()) }
    }

    pub fn touch(&self, va: VirtAddr) {
        if let Some(e) = self.entries.lock().unwrap().get_mut(&va.0) {
            e.flags.insert(PteFlags::ACCESSED);
        }
    }

    pub fn force_protection_violation(&self, va: VirtAddr) {
        if let Some(e) = self.entries.lock().unwrap().get_mut(&va.0) {
            e.flags.insert(PteFlags::PROTECTION_VIOLATION);
        }
    }
}

impl Default for TestPageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PageTable for TestPageTable {
    fn map(&self, va: VirtAddr, frame: PhysAddr, writable: bool) -> KResult<()> {
        let flags = if writable { PteFlags::WRITABLE } else { PteFlags::empty() };
        self.entries.lock().unwrap().insert(va.0, Entry { frame, flags });
        Ok(())
    }

    fn unmap(&self, va: VirtAddr) {
        self.entries.lock().unwrap().remove(&va.0);
    }

    fn is_accessed(&self, va: VirtAddr) -> bool {
        self.entries.lock().unwrap().get(&va.0).map(|e| e.flags.contains(PteFlags::ACCESSED)).unwrap_or(false)
    }

    fn clear_accessed(&self, va: VirtAddr) {
        if let Some(e) = self.entries.lock().unwrap().get_mut(&va.0) {
            e.flags.remove(PteFlags::ACCESSED);
        }
    }

    fn is_present(&self, va: VirtAddr) -> bool {
        self.entries.lock().unwrap().contains_key(&va.0)
    }

    fn is_protection_violation(&self, va: VirtAddr) -> bool {
        self.entries
            .lock()
            .unwrap()
            .get(&va.0)
            .map(|e| e.flags.contains(PteFlags::PROTECTION_VIOLATION))
            .unwrap_or(false)
    }

    fn translate(&self, va: VirtAddr) -> Option<PhysAddr> {
        self.entries.lock().unwrap().get(&va.0).map(|e| e.frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_then_translate() {
        let pt = TestPageTable::new();
        pt.map(VirtAddr(0x1000), PhysAddr(3), true).unwrap();
        assert_eq!(pt.translate(VirtAddr(0x1000)), Some(PhysAddr(3)));
        pt.unmap(VirtAddr(0x1000));
        assert_eq!(pt.translate(VirtAddr(0x1000)), None);
    }

    #[test]
    fn accessed_bit_round_trips() {
        let pt = TestPageTable::new();
        pt.map(VirtAddr(0x2000), PhysAddr(0), true).unwrap();
        assert!(!pt.is_accessed(VirtAddr(0x2000)));
        pt.touch(VirtAddr(0x2000));
        assert!(pt.is_accessed(VirtAddr(0x2000)));
        pt.clear_accessed(VirtAddr(0x2000));
        assert!(!pt.is_accessed(VirtAddr(0x2000)));
    }
}
