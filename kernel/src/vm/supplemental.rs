//! Component E: the supplementary page table. Per process, one entry per
//! virtual page that isn't yet backed by a resident frame — the fault
//! resolver consults it to learn how to materialize a page the first time
//! it's touched.

use alloc::sync::Arc;
use alloc::vec::Vec;
use x86_64::structures::paging::{Page, Size4KiB};

use crate::filesystem::vfs::Inode;

#[derive(Clone)]
pub enum PageSource {
    Executable { inode: Arc<Inode> },
    /// Structural only — nothing in this crate's syscall table constructs
    /// this variant (no `mmap`), matching the upstream project this was
    /// distilled from, where the field exists but is never populated.
    MmappedFile { inode: Arc<Inode>, id: u32 },
}

#[derive(Clone)]
pub struct SuppEntry {
    pub vpage: Page<Size4KiB>,
    pub source: PageSource,
    pub offset: u64,
    pub read_bytes: u32,
    pub zero_bytes: u32,
    pub writable: bool,
}

/// Per-process table of not-yet-resident pages. A linear `Vec` scan, same
/// as `UserProcess::files`: simple collections until profiling says
/// otherwise.
#[derive(Default, Clone)]
pub struct SuppPageTable(Vec<SuppEntry>);

impl SuppPageTable {
    pub fn new() -> Self {
        SuppPageTable(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Records a page's backing. Overwrites an existing entry for the same
    /// `vpage` rather than erroring — the loader may re-record a page that
    /// spans two PT_LOAD segments' zero-fill tail.
    pub fn record(&mut self, entry: SuppEntry) {
        if let Some(existing) = self.0.iter_mut().find(|e| e.vpage == entry.vpage) {
            *existing = entry;
        } else {
            self.0.push(entry);
        }
    }

    pub fn lookup(&self, vpage: Page<Size4KiB>) -> Option<&SuppEntry> {
        self.0.iter().find(|e| e.vpage == vpage)
    }

    /// Removes the entry once its frame has been faulted in and installed
    /// in the frame table — a resident page is no longer "supplementary".
    pub fn remove(&mut self, vpage: Page<Size4KiB>) -> Option<SuppEntry> {
        let index = self.0.iter().position(|e| e.vpage == vpage)?;
        Some(self.0.remove(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = &SuppEntry> {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::vfs::FileType;
    use x86_64::VirtAddr;

    fn page(n: u64) -> Page<Size4KiB> {
        Page::containing_address(VirtAddr::new(n * 4096))
    }

    fn dummy_inode() -> Arc<Inode> {
        Arc::new(Inode {
            dev: 0,
            inode: 0,
            file_type: FileType::File,
            size: 0,
            major: None,
            minor: None,
            inner: None,
        })
    }

    #[test]
    fn record_then_lookup() {
        let mut table = SuppPageTable::new();
        table.record(SuppEntry {
            vpage: page(1),
            source: PageSource::Executable { inode: dummy_inode() },
            offset: 0,
            read_bytes: 4096,
            zero_bytes: 0,
            writable: false,
        });

        assert!(table.lookup(page(1)).is_some());
        assert!(table.lookup(page(2)).is_none());
    }

    #[test]
    fn record_overwrites_same_vpage() {
        let mut table = SuppPageTable::new();
        table.record(SuppEntry {
            vpage: page(1),
            source: PageSource::Executable { inode: dummy_inode() },
            offset: 0,
            read_bytes: 100,
            zero_bytes: 3996,
            writable: false,
        });
        table.record(SuppEntry {
            vpage: page(1),
            source: PageSource::Executable { inode: dummy_inode() },
            offset: 4096,
            read_bytes: 4096,
            zero_bytes: 0,
            writable: true,
        });

        assert_eq!(table.len(), 1);
        assert_eq!(table.lookup(page(1)).unwrap().offset, 4096);
        assert!(table.lookup(page(1)).unwrap().writable);
    }

    #[test]
    fn remove_takes_entry_out() {
        let mut table = SuppPageTable::new();
        table.record(SuppEntry {
            vpage: page(7),
            source: PageSource::Executable { inode: dummy_inode() },
            offset: 0,
            read_bytes: 4096,
            zero_bytes: 0,
            writable: false,
        });

        assert!(table.remove(page(7)).is_some());
        assert!(table.lookup(page(7)).is_none());
        assert!(table.is_empty());
    }
}
