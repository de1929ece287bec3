//! Component D: the frame table. One entry per live user mapping,
//! process-global, insertion-ordered. The clock cursor lives in `vm::Vm`
//! (one level up) rather than here, since eviction and installation must
//! never disagree about its position — both only ever run under the same
//! lock.

use alloc::vec::Vec;
use x86_64::structures::paging::{Page, PhysFrame, Size4KiB};

#[derive(Debug, Clone, Copy)]
pub struct FrameTableEntry {
    pub frame: PhysFrame<Size4KiB>,
    pub vpage: Page<Size4KiB>,
    pub owner: u32,
    pub writable: bool,
}

#[derive(Default)]
pub struct FrameTable {
    entries: Vec<FrameTableEntry>,
}

impl FrameTable {
    pub fn new() -> Self {
        FrameTable { entries: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends a new entry. Called only after the MMU mapping has already
    /// succeeded (the frame table records reality, it doesn't create it).
    pub fn install(&mut self, entry: FrameTableEntry) {
        debug_assert!(
            !self.entries.iter().any(|e| e.frame == entry.frame),
            "no two frame-table entries may share a frame"
        );
        self.entries.push(entry);
    }

    /// Removes the entry at `index`, keeping remaining indices stable for
    /// everything before `index` (the clock cursor only ever reads at its
    /// own position then advances, so a swap-remove would silently skip
    /// whatever used to sit at the tail).
    pub fn remove_at(&mut self, index: usize) -> FrameTableEntry {
        self.entries.remove(index)
    }

    pub fn at(&self, index: usize) -> &FrameTableEntry {
        &self.entries[index]
    }

    pub fn find_by_frame(&self, frame: PhysFrame<Size4KiB>) -> Option<usize> {
        self.entries.iter().position(|e| e.frame == frame)
    }

    pub fn find_by_vpage(&self, owner: u32, vpage: Page<Size4KiB>) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.owner == owner && e.vpage == vpage)
    }

    /// Removes every entry belonging to `owner`, returning them so the
    /// caller (process exit) can unmap and free each frame.
    pub fn drain_owner(&mut self, owner: u32) -> Vec<FrameTableEntry> {
        let (owned, rest): (Vec<_>, Vec<_>) = self.entries.drain(..).partition(|e| e.owner == owner);
        self.entries = rest;
        owned
    }

    pub fn iter(&self) -> impl Iterator<Item = &FrameTableEntry> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use x86_64::{PhysAddr, VirtAddr};

    fn frame(n: u64) -> PhysFrame<Size4KiB> {
        PhysFrame::containing_address(PhysAddr::new(n * 4096))
    }

    fn page(n: u64) -> Page<Size4KiB> {
        Page::containing_address(VirtAddr::new(n * 4096))
    }

    #[test]
    fn install_and_find() {
        let mut table = FrameTable::new();
        table.install(FrameTableEntry { frame: frame(1), vpage: page(1), owner: 7, writable: true });
        table.install(FrameTableEntry { frame: frame(2), vpage: page(2), owner: 7, writable: false });

        assert_eq!(table.len(), 2);
        assert_eq!(table.find_by_frame(frame(2)), Some(1));
        assert_eq!(table.find_by_vpage(7, page(1)), Some(0));
        assert_eq!(table.find_by_vpage(8, page(1)), None);
    }

    #[test]
    #[should_panic]
    fn install_rejects_duplicate_frame() {
        let mut table = FrameTable::new();
        table.install(FrameTableEntry { frame: frame(1), vpage: page(1), owner: 7, writable: true });
        table.install(FrameTableEntry { frame: frame(1), vpage: page(2), owner: 7, writable: true });
    }

    #[test]
    fn drain_owner_only_removes_matching_entries() {
        let mut table = FrameTable::new();
        table.install(FrameTableEntry { frame: frame(1), vpage: page(1), owner: 1, writable: true });
        table.install(FrameTableEntry { frame: frame(2), vpage: page(2), owner: 2, writable: true });
        table.install(FrameTableEntry { frame: frame(3), vpage: page(3), owner: 1, writable: true });

        let drained = table.drain_owner(1);
        assert_eq!(drained.len(), 2);
        assert_eq!(table.len(), 1);
        assert_eq!(table.at(0).owner, 2);
    }
}
