//! The MMU driver is, per the design, an opaque collaborator: install or
//! clear a mapping, query accessed/dirty bits. `Mmu` is that boundary.
//! `X86Mmu` is the real implementation (a thin wrapper around the
//! `x86_64` crate's `OffsetPageTable`, the same mapper `UserProcess`
//! already held directly before this module existed). `MockMmu` lets the
//! eviction clock and the fault resolver run as ordinary host tests.

use alloc::collections::btree_map::BTreeMap;
use x86_64::structures::paging::{
    mapper::MapToError, Mapper, OffsetPageTable, Page, PageTableFlags, PhysFrame, Size4KiB,
};
use x86_64::VirtAddr;

use super::config;

#[derive(Debug)]
pub enum MmuError {
    MapFailed,
    NotMapped,
}

/// A single user virtual page's mapping, as far as the VM subsystem needs
/// to know about it.
pub trait Mmu {
    /// Installs `vpage -> frame`, user-accessible, with `writable` controlling
    /// the `WRITABLE` bit. Fails only if the underlying page-table hierarchy
    /// cannot be built (out of frames for intermediate tables).
    fn map(&mut self, vpage: Page<Size4KiB>, frame: PhysFrame<Size4KiB>, writable: bool) -> Result<(), MmuError>;

    /// Tears down a mapping, handing back the frame that was mapped there.
    fn unmap(&mut self, vpage: Page<Size4KiB>) -> Option<PhysFrame<Size4KiB>>;

    fn is_mapped(&self, vpage: Page<Size4KiB>) -> bool;

    fn translate(&self, vpage: Page<Size4KiB>) -> Option<PhysFrame<Size4KiB>>;

    /// True if the CPU has set the accessed bit since it was last cleared.
    fn accessed(&self, vpage: Page<Size4KiB>) -> bool;

    fn clear_accessed(&mut self, vpage: Page<Size4KiB>);

    fn dirty(&self, vpage: Page<Size4KiB>) -> bool;

    /// Writes `frame`'s contents through the mapper's physical-memory
    /// window. Used both to zero a fresh frame and to stage ELF/swap bytes
    /// before a mapping for it exists.
    fn write_frame(&mut self, frame: PhysFrame<Size4KiB>, offset: usize, bytes: &[u8]);

    fn read_frame(&self, frame: PhysFrame<Size4KiB>, offset: usize, bytes: &mut [u8]);
}

/// Real mapper, backed by the teacher's `OffsetPageTable` + `PhysicalMemoryManager`.
///
/// Intermediate page-table frames come from `crate::PMM`, a pool kept
/// deliberately separate from `vm::Vm.frames` (the evictable user-data
/// pool): `resolve`/`evict_one` run with `vm::VM`'s lock already held, and
/// an `X86Mmu` is built and used inside that scope, so it must not need a
/// second lock on the same `Vm`.
pub struct X86Mmu<'a> {
    mapper: OffsetPageTable<'a>,
}

impl<'a> X86Mmu<'a> {
    pub fn new(mapper: OffsetPageTable<'a>) -> Self {
        X86Mmu { mapper }
    }

    /// Hands the wrapped mapper back, for call sites (process construction)
    /// that need to keep it around past the `Mmu` borrow used to build the
    /// address space.
    pub fn into_inner(self) -> OffsetPageTable<'a> {
        self.mapper
    }

    fn phys_ptr(&self, frame: PhysFrame<Size4KiB>, offset: usize) -> *mut u8 {
        (self.mapper.phys_offset() + frame.start_address().as_u64() + offset as u64).as_mut_ptr()
    }
}

impl Mmu for X86Mmu<'_> {
    fn map(&mut self, vpage: Page<Size4KiB>, frame: PhysFrame<Size4KiB>, writable: bool) -> Result<(), MmuError> {
        let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
        if writable {
            flags |= PageTableFlags::WRITABLE;
        }

        let mut pmm = crate::PMM.get().expect("PMM not initialised").lock();
        match unsafe { self.mapper.map_to(vpage, frame, flags, &mut *pmm) } {
            Ok(flush) => {
                flush.flush();
                Ok(())
            }
            Err(MapToError::FrameAllocationFailed) => Err(MmuError::MapFailed),
            Err(_) => Err(MmuError::MapFailed),
        }
    }

    fn unmap(&mut self, vpage: Page<Size4KiB>) -> Option<PhysFrame<Size4KiB>> {
        let (frame, flush) = self.mapper.unmap(vpage).ok()?;
        flush.flush();
        Some(frame)
    }

    fn is_mapped(&self, vpage: Page<Size4KiB>) -> bool {
        self.mapper.translate_page(vpage).is_ok()
    }

    fn translate(&self, vpage: Page<Size4KiB>) -> Option<PhysFrame<Size4KiB>> {
        self.mapper.translate_page(vpage).ok()
    }

    fn accessed(&self, vpage: Page<Size4KiB>) -> bool {
        self.mapper
            .translate_page(vpage)
            .is_ok_and(|_| self.flags(vpage).contains(PageTableFlags::ACCESSED))
    }

    fn clear_accessed(&mut self, vpage: Page<Size4KiB>) {
        self.set_flag(vpage, PageTableFlags::ACCESSED, false);
    }

    fn dirty(&self, vpage: Page<Size4KiB>) -> bool {
        self.flags(vpage).contains(PageTableFlags::DIRTY)
    }

    fn write_frame(&mut self, frame: PhysFrame<Size4KiB>, offset: usize, bytes: &[u8]) {
        let dst = unsafe { core::slice::from_raw_parts_mut(self.phys_ptr(frame, offset), bytes.len()) };
        dst.copy_from_slice(bytes);
    }

    fn read_frame(&self, frame: PhysFrame<Size4KiB>, offset: usize, bytes: &mut [u8]) {
        let src = unsafe { core::slice::from_raw_parts(self.phys_ptr(frame, offset), bytes.len()) };
        bytes.copy_from_slice(src);
    }
}

impl X86Mmu<'_> {
    /// Raw flag lookup, walking the same recursive structure
    /// `OffsetPageTable` already owns. There's no public accessor for a
    /// single leaf entry's flags, so this mirrors `fork_page_table`'s
    /// existing habit of reaching into `level_4_table()` by hand.
    fn flags(&self, vpage: Page<Size4KiB>) -> PageTableFlags {
        use x86_64::structures::paging::PageTable;

        let addr = vpage.start_address();
        let indexes = [
            u16::from(addr.p4_index()),
            u16::from(addr.p3_index()),
            u16::from(addr.p2_index()),
            u16::from(addr.p1_index()),
        ];

        let mut table: &PageTable = self.mapper.level_4_table();
        for (depth, &index) in indexes.iter().enumerate() {
            let entry = &table[index as usize];
            if depth == indexes.len() - 1 {
                return entry.flags();
            }
            if !entry.flags().contains(PageTableFlags::PRESENT) {
                return PageTableFlags::empty();
            }
            let next_table_ptr =
                (self.mapper.phys_offset() + entry.addr().as_u64()).as_ptr::<PageTable>();
            table = unsafe { &*next_table_ptr };
        }
        unreachable!()
    }

    fn set_flag(&mut self, vpage: Page<Size4KiB>, flag: PageTableFlags, value: bool) {
        use x86_64::structures::paging::PageTable;

        let addr = vpage.start_address();
        let indexes = [
            u16::from(addr.p4_index()),
            u16::from(addr.p3_index()),
            u16::from(addr.p2_index()),
        ];

        let mut table: &mut PageTable = self.mapper.level_4_table_mut();
        for &index in &indexes {
            let entry = &table[index as usize];
            if !entry.flags().contains(PageTableFlags::PRESENT) {
                return;
            }
            let next_table_ptr =
                (self.mapper.phys_offset() + entry.addr().as_u64()).as_mut_ptr::<PageTable>();
            table = unsafe { &mut *next_table_ptr };
        }

        let leaf = &mut table[u16::from(addr.p1_index()) as usize];
        let mut flags = leaf.flags();
        flags.set(flag, value);
        let frame = leaf.frame().expect("leaf entry must map a frame");
        leaf.set_frame(frame, flags);
    }
}

/// A page mapped in `MockMmu`: the frame it points at, plus the
/// writable/accessed/dirty bits a real MMU would track for it.
#[derive(Clone, Copy)]
struct MockEntry {
    frame: PhysFrame<Size4KiB>,
    writable: bool,
    accessed: bool,
    dirty: bool,
}

/// Host-testable stand-in for the real MMU. Frame contents live in a
/// `BTreeMap<PhysFrame, [u8; PAGE_SIZE]>` rather than a physical-memory
/// window, since there's no real physical address space under `cargo test`.
#[derive(Default)]
pub struct MockMmu {
    mappings: BTreeMap<Page<Size4KiB>, MockEntry>,
    frames: BTreeMap<PhysFrame<Size4KiB>, alloc::vec::Vec<u8>>,
}

impl MockMmu {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: marks `vpage` as written (sets the dirty bit) the way a
    /// real CPU store would.
    pub fn touch_write(&mut self, vpage: Page<Size4KiB>) {
        if let Some(entry) = self.mappings.get_mut(&vpage) {
            entry.accessed = true;
            entry.dirty = true;
        }
    }

    pub fn touch_read(&mut self, vpage: Page<Size4KiB>) {
        if let Some(entry) = self.mappings.get_mut(&vpage) {
            entry.accessed = true;
        }
    }
}

impl Mmu for MockMmu {
    fn map(&mut self, vpage: Page<Size4KiB>, frame: PhysFrame<Size4KiB>, writable: bool) -> Result<(), MmuError> {
        self.mappings.insert(
            vpage,
            MockEntry {
                frame,
                writable,
                accessed: false,
                dirty: false,
            },
        );
        self.frames
            .entry(frame)
            .or_insert_with(|| alloc::vec![0u8; config::PAGE_SIZE as usize]);
        Ok(())
    }

    fn unmap(&mut self, vpage: Page<Size4KiB>) -> Option<PhysFrame<Size4KiB>> {
        self.mappings.remove(&vpage).map(|e| e.frame)
    }

    fn is_mapped(&self, vpage: Page<Size4KiB>) -> bool {
        self.mappings.contains_key(&vpage)
    }

    fn translate(&self, vpage: Page<Size4KiB>) -> Option<PhysFrame<Size4KiB>> {
        self.mappings.get(&vpage).map(|e| e.frame)
    }

    fn accessed(&self, vpage: Page<Size4KiB>) -> bool {
        self.mappings.get(&vpage).is_some_and(|e| e.accessed)
    }

    fn clear_accessed(&mut self, vpage: Page<Size4KiB>) {
        if let Some(entry) = self.mappings.get_mut(&vpage) {
            entry.accessed = false;
        }
    }

    fn dirty(&self, vpage: Page<Size4KiB>) -> bool {
        self.mappings.get(&vpage).is_some_and(|e| e.dirty)
    }

    fn write_frame(&mut self, frame: PhysFrame<Size4KiB>, offset: usize, bytes: &[u8]) {
        let buf = self
            .frames
            .entry(frame)
            .or_insert_with(|| alloc::vec![0u8; config::PAGE_SIZE as usize]);
        buf[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    fn read_frame(&self, frame: PhysFrame<Size4KiB>, offset: usize, bytes: &mut [u8]) {
        let buf = self.frames.get(&frame).expect("read of unwritten frame");
        bytes.copy_from_slice(&buf[offset..offset + bytes.len()]);
    }
}
