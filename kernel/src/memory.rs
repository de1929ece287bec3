use alloc::vec;
use alloc::vec::Vec;
use bootloader_api::info::{MemoryRegionKind, MemoryRegions};
use linked_list_allocator::LockedHeap;
use x86_64::{PhysAddr, VirtAddr};
use x86_64::registers::control::Cr3;
use x86_64::structures::paging::{FrameAllocator, FrameDeallocator, Mapper, OffsetPageTable, Page, PageSize, PageTable, PageTableFlags, PhysFrame, Size4KiB};
use x86_64::structures::paging::mapper::MapToError;

pub const HEAP_START: u64 = 0x_4444_4444_0000;

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

pub const INITIAL_HEAP_SIZE: u64 = 1024 * 1024;


/// Builds the boot-time mapper as an `OffsetPageTable` over the
/// bootloader's physical-memory mapping, rather than recursive paging —
/// every `X86Mmu` the VM subsystem builds afterwards (including for
/// processes other than this one) relies on the same offset being valid,
/// so the boot mapper has to be built the same way.
///
/// # Safety
/// Can only be called once; `phys_offset` must be the virtual address the
/// bootloader mapped all physical memory at.
pub unsafe fn init(phys_offset: VirtAddr, memory_regions: &'static MemoryRegions) -> (OffsetPageTable<'static>, PhysicalMemoryManager) {
    let mut page_table = unsafe { init_page_table(phys_offset) };
    let mut pmm = PhysicalMemoryManager::init_with_heap(memory_regions, &mut page_table);
    (page_table, pmm)
}

unsafe fn init_page_table(phys_offset: VirtAddr) -> OffsetPageTable<'static> {
    let (level_4_table_frame, _) = Cr3::read();
    let virt = phys_offset + level_4_table_frame.start_address().as_u64();
    let page_table_ptr: *mut PageTable = virt.as_mut_ptr();
    unsafe { OffsetPageTable::new(&mut *page_table_ptr, phys_offset) }
}

pub struct PhysicalMemoryManager {
    free_frames: Vec<PhysFrame>
}

impl PhysicalMemoryManager {
    pub unsafe fn init_with_heap(memory_regions: &'static MemoryRegions, mapper: &mut impl Mapper<Size4KiB>) -> Self {
        Self::init_with_heap_inner(memory_regions, mapper)
    }

    /// Host-test constructor: wraps an already-known frame list, bypassing
    /// the bootloader memory map. Used by `vm::*` unit tests.
    #[cfg(test)]
    pub fn for_test(free_frames: Vec<PhysFrame>) -> Self {
        PhysicalMemoryManager { free_frames }
    }

    fn init_with_heap_inner(memory_regions: &'static MemoryRegions, mapper: &mut impl Mapper<Size4KiB>) -> PhysicalMemoryManager {
        let mut frame_allocator = unsafe { LinearFrameAllocator::new(memory_regions) };

        let heap_start = VirtAddr::new(HEAP_START);
        let heap_end = heap_start + INITIAL_HEAP_SIZE - 1u64;
        let page_range = Page::range_inclusive(
            Page::containing_address(heap_start),
            Page::containing_address(heap_end),
        );

        for page in page_range {
            let frame = frame_allocator
                .allocate_frame()
                .expect("Failed to initialise heap");
            let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
            unsafe {
                mapper.map_to(page, frame, flags, &mut frame_allocator).expect("Failed to initialise heap").flush();
            }
        }

        unsafe { ALLOCATOR.lock().init(heap_start.as_mut_ptr(), INITIAL_HEAP_SIZE as usize) };

        // FIXME: This is really slow
        let free_frames: Vec<_> = frame_allocator.available_frames().skip(frame_allocator.next).collect();

        PhysicalMemoryManager { free_frames }
    }
}

impl PhysicalMemoryManager {
    /// Carves `n` frames off this pool into a freshly returned manager,
    /// used at boot to split the single frame list the bootloader hands us
    /// into the general-purpose `PMM` pool (page tables, MMIO mappings) and
    /// the `vm::Vm` pool (evictable user data pages) — two independent
    /// locks so the MMU driver can allocate page-table frames without
    /// re-entering `vm::VM`'s lock while a fault is being resolved.
    pub fn split_off(&mut self, n: usize) -> PhysicalMemoryManager {
        let at = self.free_frames.len().saturating_sub(n);
        let taken = self.free_frames.split_off(at);
        PhysicalMemoryManager { free_frames: taken }
    }

    pub fn frame_count(&self) -> usize {
        self.free_frames.len()
    }

    /// Pulls a frame off the pool for user-process use, optionally zeroing
    /// it through the physical-memory offset mapping first. Lazily-loaded
    /// zero-fill pages and fresh stack frames need zeroing; a frame about
    /// to be overwritten wholesale (an ELF page about to be read into)
    /// doesn't.
    pub fn allocate_frame_for_user(&mut self, phys_offset: VirtAddr, zeroed: bool) -> Option<PhysFrame<Size4KiB>> {
        let frame = self.free_frames.pop()?;
        if zeroed {
            let ptr = (phys_offset + frame.start_address().as_u64()).as_mut_ptr::<u8>();
            unsafe { core::ptr::write_bytes(ptr, 0, Size4KiB::SIZE as usize) };
        }
        Some(frame)
    }
}

unsafe impl FrameAllocator<Size4KiB> for PhysicalMemoryManager {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        self.free_frames.pop()
    }
}

impl FrameDeallocator<Size4KiB> for PhysicalMemoryManager {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) {
        self.free_frames.push(frame);
    }
}

struct LinearFrameAllocator {
    next: usize,
    memory_regions: &'static MemoryRegions
}

impl LinearFrameAllocator {
    fn available_frames(&self) -> impl Iterator<Item = PhysFrame> {
        let available_memory_regions = self
            .memory_regions
            .iter()
            .filter(|region| region.kind == MemoryRegionKind::Usable);

        let available_frames = available_memory_regions
            .clone()
            .map(|region| region.start..region.end)
            .flatten()
            .filter(|addr| (addr & 0xfff) == 0)
            .map(|addr| PhysFrame::containing_address(PhysAddr::new(addr)));

        available_frames
    }
    unsafe fn new(memory_regions: &'static MemoryRegions) -> Self {
        LinearFrameAllocator {
            next: 0,
            memory_regions,
        }
    }
}

unsafe impl FrameAllocator<Size4KiB> for LinearFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        let frame = self.available_frames().nth(self.next);
        self.next += 1;
        frame
    }
}