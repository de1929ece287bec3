//! Component G: the page-fault resolver. Classifies a faulting address and
//! routes it to swap-in, lazy-load, stack-growth, or kill — the core state
//! machine this whole crate exists to get right.
//!
//! `resolve` takes its collaborators (the block device, the mapped-in
//! executable reader) as parameters rather than reaching for globals, so
//! the four-step classification runs as an ordinary host test against
//! `MockMmu`/`RamBlockDevice`. `user::syscalls` wires the real globals in.

use x86_64::structures::paging::{Page, Size4KiB};
use x86_64::VirtAddr;

use super::config::{self, PAGE_SIZE, STACK_GROWTH_SLACK};
use super::mmu::Mmu;
use super::supplemental::{PageSource, SuppPageTable};
use super::swap::BlockDevice;
use super::{Vm, VmError};
use crate::memory::PhysicalMemoryManager;

#[derive(Debug, Eq, PartialEq)]
pub enum FaultOutcome {
    Resolved,
    Kill,
}

/// RAII guard over a frame pulled from the pool mid-resolution. Freed back
/// to the pool on drop unless `commit`ted — the idiomatic replacement for
/// the "goto cleanup" pattern the original C resolver used on every
/// failing step.
struct AllocatedFrame<'a> {
    frames: &'a mut PhysicalMemoryManager,
    frame: Option<x86_64::structures::paging::PhysFrame<Size4KiB>>,
}

impl<'a> AllocatedFrame<'a> {
    fn take(frames: &'a mut PhysicalMemoryManager, frame: x86_64::structures::paging::PhysFrame<Size4KiB>) -> Self {
        AllocatedFrame { frames, frame: Some(frame) }
    }

    fn commit(mut self) -> x86_64::structures::paging::PhysFrame<Size4KiB> {
        let frame = self.frame.take().expect("AllocatedFrame committed twice");
        core::mem::forget(self);
        frame
    }
}

impl Drop for AllocatedFrame<'_> {
    fn drop(&mut self) {
        if let Some(frame) = self.frame.take() {
            unsafe {
                use x86_64::structures::paging::FrameDeallocator;
                self.frames.deallocate_frame(frame);
            }
        }
    }
}

/// Allocates a frame, evicting once if the pool is exhausted.
fn allocate_or_evict(
    vm: &mut Vm,
    device: &dyn BlockDevice,
    mmu: &mut impl Mmu,
    current_pid: u32,
) -> Option<x86_64::structures::paging::PhysFrame<Size4KiB>> {
    use x86_64::structures::paging::FrameAllocator;

    if let Some(frame) = vm.frames.allocate_frame() {
        return Some(frame);
    }
    if super::eviction::evict_one(vm, device, mmu, current_pid).is_err() {
        return None;
    }
    vm.frames.allocate_frame()
}

/// The four-step classification from spec.md §4.G. `supp` is the faulting
/// process's supplementary page table; `read_source` materializes bytes
/// for a `PageSource` (production: a VFS read; tests: an in-memory map).
#[allow(clippy::too_many_arguments)]
pub fn resolve(
    vm: &mut Vm,
    device: &dyn BlockDevice,
    mmu: &mut impl Mmu,
    supp: &mut SuppPageTable,
    current_pid: u32,
    fault_addr: VirtAddr,
    user: bool,
    esp: VirtAddr,
    read_source: &mut dyn FnMut(&PageSource, u64, &mut [u8]) -> usize,
) -> FaultOutcome {
    // Step 1: unsafe user access.
    if user && (fault_addr.as_u64() == 0 || fault_addr.as_u64() >= config::USER_TOP) {
        return FaultOutcome::Kill;
    }

    let vpage: Page<Size4KiB> = Page::containing_address(fault_addr);

    let Some(frame) = allocate_or_evict(vm, device, mmu, current_pid) else {
        return FaultOutcome::Kill;
    };
    let guard = AllocatedFrame::take(&mut vm.frames, frame);

    // Step 2: swap-in.
    if let Some(slot) = vm.swap_table.find(vpage, current_pid) {
        let writable = vm.swap_table.entry(slot).writable;
        let mut bytes = [0u8; PAGE_SIZE as usize];
        vm.swap_table.read(device, slot, &mut bytes);

        let frame = guard.commit();
        mmu.write_frame(frame, 0, &bytes);
        if mmu.map(vpage, frame, writable).is_err() {
            unsafe {
                use x86_64::structures::paging::FrameDeallocator;
                vm.frames.deallocate_frame(frame);
            }
            return FaultOutcome::Kill;
        }
        vm.swap_table.release(vpage, current_pid);
        vm.frame_table
            .install(super::frame_table::FrameTableEntry { frame, vpage, owner: current_pid, writable });
        return FaultOutcome::Resolved;
    }

    // Step 3: lazy load.
    if let Some(entry) = supp.lookup(vpage).cloned() {
        let frame = guard.commit();

        let mut read_bytes = [0u8; PAGE_SIZE as usize];
        let n = read_source(&entry.source, entry.offset, &mut read_bytes[..entry.read_bytes as usize]);
        for b in read_bytes[n..entry.read_bytes as usize].iter_mut() {
            *b = 0;
        }
        for b in read_bytes[entry.read_bytes as usize..].iter_mut() {
            *b = 0;
        }
        mmu.write_frame(frame, 0, &read_bytes);

        if mmu.map(vpage, frame, entry.writable).is_err() {
            unsafe {
                use x86_64::structures::paging::FrameDeallocator;
                vm.frames.deallocate_frame(frame);
            }
            return FaultOutcome::Kill;
        }
        vm.frame_table.install(super::frame_table::FrameTableEntry {
            frame,
            vpage,
            owner: current_pid,
            writable: entry.writable,
        });
        return FaultOutcome::Resolved;
    }

    // Step 4: stack growth. Neither swap nor supp claimed this page —
    // return the pre-allocated frame and allocate a fresh zeroed one,
    // matching spec.md's "pre-allocated frame returned to the pool" note.
    drop(guard);

    let low_bound = esp.as_u64().saturating_sub(STACK_GROWTH_SLACK);
    if fault_addr.as_u64() < low_bound || fault_addr.as_u64() >= config::USER_TOP {
        return FaultOutcome::Kill;
    }

    let Some(frame) = allocate_or_evict(vm, device, mmu, current_pid) else {
        return FaultOutcome::Kill;
    };
    let zeroes = [0u8; PAGE_SIZE as usize];
    mmu.write_frame(frame, 0, &zeroes);

    if mmu.map(vpage, frame, true).is_err() {
        unsafe {
            use x86_64::structures::paging::FrameDeallocator;
            vm.frames.deallocate_frame(frame);
        }
        return FaultOutcome::Kill;
    }
    vm.frame_table
        .install(super::frame_table::FrameTableEntry { frame, vpage, owner: current_pid, writable: true });
    FaultOutcome::Resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::vfs::{FileType, Inode};
    use crate::vm::mmu::MockMmu;
    use crate::vm::swap::RamBlockDevice;
    use alloc::sync::Arc;
    use x86_64::PhysAddr;
    use x86_64::structures::paging::PhysFrame;

    fn frame(n: u64) -> PhysFrame<Size4KiB> {
        PhysFrame::containing_address(PhysAddr::new(n * 4096))
    }

    fn vm_with_frames(n: u64) -> (Vm, RamBlockDevice) {
        let device = RamBlockDevice::new(config::SECTORS_PER_SLOT * 8);
        let pmm = PhysicalMemoryManager::for_test((0..n).map(frame).collect());
        (Vm::new(pmm, &device), device)
    }

    fn dummy_inode() -> Arc<Inode> {
        Arc::new(Inode { dev: 0, inode: 0, file_type: FileType::File, size: 4096, major: None, minor: None, inner: None })
    }

    #[test]
    fn kills_on_user_null_pointer() {
        let (mut vm, device) = vm_with_frames(2);
        let mut mmu = MockMmu::new();
        let mut supp = SuppPageTable::new();
        let mut reader = |_: &PageSource, _: u64, _: &mut [u8]| 0;

        let outcome = resolve(
            &mut vm, &device, &mut mmu, &mut supp, 1,
            VirtAddr::new(0), true, VirtAddr::new(config::USER_TOP), &mut reader,
        );
        assert_eq!(outcome, FaultOutcome::Kill);
    }

    #[test]
    fn lazy_loads_from_executable_source() {
        let (mut vm, device) = vm_with_frames(2);
        let mut mmu = MockMmu::new();
        let mut supp = SuppPageTable::new();
        let vpage: Page<Size4KiB> = Page::containing_address(VirtAddr::new(0x1000));
        supp.record(super::super::supplemental::SuppEntry {
            vpage,
            source: PageSource::Executable { inode: dummy_inode() },
            offset: 0,
            read_bytes: 5,
            zero_bytes: (PAGE_SIZE - 5) as u32,
            writable: false,
        });

        let mut reader = |_: &PageSource, _: u64, buf: &mut [u8]| {
            buf[..5].copy_from_slice(b"hello");
            5
        };

        let outcome = resolve(
            &mut vm, &device, &mut mmu, &mut supp, 1,
            vpage.start_address(), true, VirtAddr::new(config::USER_TOP), &mut reader,
        );
        assert_eq!(outcome, FaultOutcome::Resolved);
        assert!(mmu.is_mapped(vpage));
        assert!(supp.lookup(vpage).is_some(), "lazy-load entries must survive the fault that uses them");

        let mut readback = [0u8; 5];
        mmu.read_frame(mmu.translate(vpage).unwrap(), 0, &mut readback);
        assert_eq!(&readback, b"hello");
    }

    #[test]
    fn re_lazy_loads_after_the_frame_is_unmapped() {
        // A lazy-loaded page whose frame later goes away (e.g. evicted) must
        // still be re-materializable from the same supp entry on the next
        // fault, since the fault path never removes it.
        let (mut vm, device) = vm_with_frames(2);
        let mut mmu = MockMmu::new();
        let mut supp = SuppPageTable::new();
        let vpage: Page<Size4KiB> = Page::containing_address(VirtAddr::new(0x1000));
        supp.record(super::super::supplemental::SuppEntry {
            vpage,
            source: PageSource::Executable { inode: dummy_inode() },
            offset: 0,
            read_bytes: 5,
            zero_bytes: (PAGE_SIZE - 5) as u32,
            writable: false,
        });

        let mut reader = |_: &PageSource, _: u64, buf: &mut [u8]| {
            buf[..5].copy_from_slice(b"hello");
            5
        };

        let outcome = resolve(
            &mut vm, &device, &mut mmu, &mut supp, 1,
            vpage.start_address(), true, VirtAddr::new(config::USER_TOP), &mut reader,
        );
        assert_eq!(outcome, FaultOutcome::Resolved);

        // Simulate a clean discard eviction: unmap and drop the frame table
        // entry, exactly as `eviction::evict_one` does for a non-dirty page,
        // without touching the supp table.
        mmu.unmap(vpage);

        let outcome = resolve(
            &mut vm, &device, &mut mmu, &mut supp, 1,
            vpage.start_address(), true, VirtAddr::new(config::USER_TOP), &mut reader,
        );
        assert_eq!(outcome, FaultOutcome::Resolved);
        assert!(mmu.is_mapped(vpage));
    }

    #[test]
    fn swaps_in_over_lazy_load() {
        let (mut vm, device) = vm_with_frames(2);
        let mut mmu = MockMmu::new();
        let mut supp = SuppPageTable::new();
        let vpage: Page<Size4KiB> = Page::containing_address(VirtAddr::new(0x2000));

        let slot = vm.swap_table.reserve(vpage, 1, true).unwrap();
        let mut payload = [0u8; PAGE_SIZE as usize];
        payload[0] = 0xAB;
        vm.swap_table.write(&device, slot, &payload);

        let mut reader = |_: &PageSource, _: u64, _: &mut [u8]| panic!("swap-in must win over lazy load");

        let outcome = resolve(
            &mut vm, &device, &mut mmu, &mut supp, 1,
            vpage.start_address(), true, VirtAddr::new(config::USER_TOP), &mut reader,
        );
        assert_eq!(outcome, FaultOutcome::Resolved);
        assert_eq!(vm.swap_table.find(vpage, 1), None);

        let mut readback = [0u8; 1];
        mmu.read_frame(mmu.translate(vpage).unwrap(), 0, &mut readback);
        assert_eq!(readback[0], 0xAB);
    }

    #[test]
    fn grows_stack_just_above_the_slack_boundary() {
        let (mut vm, device) = vm_with_frames(2);
        let mut mmu = MockMmu::new();
        let mut supp = SuppPageTable::new();
        let esp = VirtAddr::new(config::USER_TOP - PAGE_SIZE);
        let fault_addr = VirtAddr::new(esp.as_u64() - STACK_GROWTH_SLACK);
        let mut reader = |_: &PageSource, _: u64, _: &mut [u8]| 0;

        let outcome = resolve(&mut vm, &device, &mut mmu, &mut supp, 1, fault_addr, true, esp, &mut reader);
        assert_eq!(outcome, FaultOutcome::Resolved);
        assert!(mmu.is_mapped(Page::containing_address(fault_addr)));
    }

    #[test]
    fn kills_one_byte_below_the_slack_boundary() {
        let (mut vm, device) = vm_with_frames(2);
        let mut mmu = MockMmu::new();
        let mut supp = SuppPageTable::new();
        let esp = VirtAddr::new(config::USER_TOP - PAGE_SIZE);
        let fault_addr = VirtAddr::new(esp.as_u64() - STACK_GROWTH_SLACK - 1);
        let mut reader = |_: &PageSource, _: u64, _: &mut [u8]| 0;

        let outcome = resolve(&mut vm, &device, &mut mmu, &mut supp, 1, fault_addr, true, esp, &mut reader);
        assert_eq!(outcome, FaultOutcome::Kill);
    }
}
