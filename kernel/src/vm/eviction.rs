//! Component F: the eviction engine. A clock approximation over the frame
//! table, scoped to the currently faulting process's own frames — the
//! teaching-OS simplification spec.md documents as a known limitation
//! rather than something this crate lifts.

use x86_64::structures::paging::{FrameDeallocator, PageSize, Size4KiB};

use super::config::PAGE_SIZE;
use super::mmu::Mmu;
use super::swap::BlockDevice;
use super::{Vm, VmError};

/// Runs one clock sweep, evicting exactly one frame owned by
/// `current_pid`. Returns `Err(VmError::OutOfFrames)` if the process owns
/// no frames at all (nothing to evict — the caller is then genuinely out
/// of memory).
///
/// The original teaching-OS implementation advanced the cursor modulo
/// `len() - 1`, which can never select the table's last slot. Fixed here
/// to modulo `len()`.
pub fn evict_one(vm: &mut Vm, device: &dyn BlockDevice, mmu: &mut impl Mmu, current_pid: u32) -> Result<(), VmError> {
    let len = vm.frame_table.len();
    if len == 0 {
        return Err(VmError::OutOfFrames);
    }

    // Bounded at two full sweeps: the first pass clears the accessed bit on
    // every frame the process owns without evicting anything if they were
    // all accessed since the last sweep, and the clock guarantees every
    // such frame gets its second chance on the pass right behind it.
    let mut scanned = 0;
    loop {
        if scanned >= 2 * len {
            return Err(VmError::OutOfFrames);
        }
        scanned += 1;

        if vm.clock_cursor >= vm.frame_table.len() {
            vm.clock_cursor = 0;
        }
        let index = vm.clock_cursor;
        let entry = *vm.frame_table.at(index);

        if entry.owner != current_pid {
            vm.clock_cursor = (vm.clock_cursor + 1) % vm.frame_table.len();
            continue;
        }

        if mmu.accessed(entry.vpage) {
            mmu.clear_accessed(entry.vpage);
            vm.clock_cursor = (vm.clock_cursor + 1) % vm.frame_table.len();
            continue;
        }

        // Victim found.
        if mmu.dirty(entry.vpage) {
            let slot = vm
                .swap_table
                .reserve(entry.vpage, entry.owner, entry.writable)
                .expect("swap exhausted while evicting a dirty frame");

            let mut bytes = [0u8; Size4KiB::SIZE as usize];
            mmu.read_frame(entry.frame, 0, &mut bytes);
            debug_assert_eq!(bytes.len(), PAGE_SIZE as usize);
            vm.swap_table.write(device, slot, &bytes);
        }

        mmu.unmap(entry.vpage);
        vm.frame_table.remove_at(index);
        unsafe { vm.frames.deallocate_frame(entry.frame) };

        vm.clock_cursor = if vm.frame_table.is_empty() {
            0
        } else {
            index % vm.frame_table.len()
        };
        return Ok(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::PhysicalMemoryManager;
    use crate::vm::frame_table::FrameTableEntry;
    use crate::vm::mmu::MockMmu;
    use crate::vm::swap::RamBlockDevice;
    use x86_64::{PhysAddr, VirtAddr};

    fn frame(n: u64) -> x86_64::structures::paging::PhysFrame {
        x86_64::structures::paging::PhysFrame::containing_address(PhysAddr::new(n * 4096))
    }

    fn page(n: u64) -> x86_64::structures::paging::Page {
        x86_64::structures::paging::Page::containing_address(VirtAddr::new(n * 4096))
    }

    fn vm_with_frames(n: u64) -> (Vm, RamBlockDevice) {
        let device = RamBlockDevice::new(super::super::config::SECTORS_PER_SLOT * 8);
        let pmm = PhysicalMemoryManager::for_test((0..n).map(frame).collect());
        (Vm::new(pmm, &device), device)
    }

    #[test]
    fn evicts_clean_unaccessed_frame_without_touching_swap() {
        let (mut vm, device) = vm_with_frames(4);
        let mut mmu = MockMmu::new();
        mmu.map(page(1), frame(1), true).unwrap();
        vm.frame_table.install(FrameTableEntry { frame: frame(1), vpage: page(1), owner: 1, writable: true });

        evict_one(&mut vm, &device, &mut mmu, 1).unwrap();

        assert!(!mmu.is_mapped(page(1)));
        assert!(vm.frame_table.is_empty());
        assert_eq!(vm.swap_table.find(page(1), 1), None);
    }

    #[test]
    fn accessed_frame_is_given_a_second_chance() {
        let (mut vm, device) = vm_with_frames(4);
        let mut mmu = MockMmu::new();
        mmu.map(page(1), frame(1), true).unwrap();
        mmu.map(page(2), frame(2), true).unwrap();
        mmu.touch_read(page(1));
        vm.frame_table.install(FrameTableEntry { frame: frame(1), vpage: page(1), owner: 1, writable: true });
        vm.frame_table.install(FrameTableEntry { frame: frame(2), vpage: page(2), owner: 1, writable: true });

        evict_one(&mut vm, &device, &mut mmu, 1).unwrap();

        // page(1) survived (accessed bit cleared, not evicted); page(2) was the victim.
        assert!(mmu.is_mapped(page(1)));
        assert!(!mmu.accessed(page(1)));
        assert!(!mmu.is_mapped(page(2)));
    }

    #[test]
    fn dirty_victim_is_written_to_swap_before_eviction() {
        let (mut vm, device) = vm_with_frames(4);
        let mut mmu = MockMmu::new();
        mmu.map(page(3), frame(3), true).unwrap();
        mmu.write_frame(frame(3), 0, b"payload");
        mmu.touch_write(page(3));
        vm.frame_table.install(FrameTableEntry { frame: frame(3), vpage: page(3), owner: 9, writable: true });

        evict_one(&mut vm, &device, &mut mmu, 9).unwrap();

        let slot = vm.swap_table.find(page(3), 9).expect("dirty frame must land in swap");
        let mut readback = [0u8; super::super::config::PAGE_SIZE as usize];
        vm.swap_table.read(&device, slot, &mut readback);
        assert_eq!(&readback[..7], b"payload");
    }

    #[test]
    fn scoped_to_current_process_returns_out_of_frames_otherwise() {
        let (mut vm, device) = vm_with_frames(4);
        let mut mmu = MockMmu::new();
        mmu.map(page(1), frame(1), true).unwrap();
        vm.frame_table.install(FrameTableEntry { frame: frame(1), vpage: page(1), owner: 2, writable: true });

        let result = evict_one(&mut vm, &device, &mut mmu, 1);
        assert!(matches!(result, Err(VmError::OutOfFrames)));
    }
}
