//! Component C: the swap allocator. The block device underneath it is an
//! opaque sector store — a driver for a real swap partition doesn't exist
//! anywhere in this tree, so `BlockDevice` is the boundary and
//! `RamBlockDevice` stands in for it (see DESIGN.md open question 7).

use alloc::vec::Vec;
use x86_64::structures::paging::{Page, Size4KiB};

use super::config::{PAGE_SIZE, SECTORS_PER_SLOT, SECTOR_SIZE};

pub trait BlockDevice {
    fn sector_count(&self) -> u64;
    fn read_sector(&self, sector: u64, buf: &mut [u8]);
    fn write_sector(&self, sector: u64, buf: &[u8]);
}

/// In-memory stand-in for the swap partition. Good enough for bring-up and
/// for every test in this crate; a real implementation would talk to an
/// AHCI/virtio block driver instead.
pub struct RamBlockDevice {
    sectors: spin::Mutex<Vec<[u8; SECTOR_SIZE as usize]>>,
}

impl RamBlockDevice {
    pub fn new(sector_count: u64) -> Self {
        RamBlockDevice {
            sectors: spin::Mutex::new(alloc::vec![[0u8; SECTOR_SIZE as usize]; sector_count as usize]),
        }
    }
}

impl BlockDevice for RamBlockDevice {
    fn sector_count(&self) -> u64 {
        self.sectors.lock().len() as u64
    }

    fn read_sector(&self, sector: u64, buf: &mut [u8]) {
        buf.copy_from_slice(&self.sectors.lock()[sector as usize]);
    }

    fn write_sector(&self, sector: u64, buf: &[u8]) {
        self.sectors.lock()[sector as usize].copy_from_slice(buf);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SwapSlotEntry {
    pub slot_sector: u64,
    pub taken: bool,
    pub vpage: Option<Page<Size4KiB>>,
    pub owner: Option<u32>,
    pub writable: bool,
}

#[derive(Default)]
pub struct SwapTable {
    slots: Vec<SwapSlotEntry>,
}

impl SwapTable {
    /// Discovers the device size and preallocates one free slot per
    /// page-sized region, as spec.md's §4.C describes. Called once, at
    /// first use.
    pub fn init(device: &dyn BlockDevice) -> Self {
        let slot_count = device.sector_count() / SECTORS_PER_SLOT;
        let slots = (0..slot_count)
            .map(|i| SwapSlotEntry {
                slot_sector: i * SECTORS_PER_SLOT,
                taken: false,
                vpage: None,
                owner: None,
                writable: false,
            })
            .collect();
        SwapTable { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Linear scan for the first free slot, per spec.md (no free-list
    /// shortcut — this table is expected to be small relative to swap
    /// capacity, and a free-list would be a second invariant to keep in
    /// sync with `taken`).
    pub fn reserve(&mut self, vpage: Page<Size4KiB>, owner: u32, writable: bool) -> Option<usize> {
        let index = self.slots.iter().position(|s| !s.taken)?;
        let slot = &mut self.slots[index];
        slot.taken = true;
        slot.vpage = Some(vpage);
        slot.owner = Some(owner);
        slot.writable = writable;
        Some(index)
    }

    pub fn release(&mut self, vpage: Page<Size4KiB>, owner: u32) -> Option<usize> {
        let index = self
            .slots
            .iter()
            .position(|s| s.taken && s.vpage == Some(vpage) && s.owner == Some(owner))?;
        self.slots[index] = SwapSlotEntry {
            slot_sector: self.slots[index].slot_sector,
            taken: false,
            vpage: None,
            owner: None,
            writable: false,
        };
        Some(index)
    }

    pub fn find(&self, vpage: Page<Size4KiB>, owner: u32) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.taken && s.vpage == Some(vpage) && s.owner == Some(owner))
    }

    pub fn entry(&self, index: usize) -> &SwapSlotEntry {
        &self.slots[index]
    }

    pub fn write(&self, device: &dyn BlockDevice, index: usize, page_bytes: &[u8; PAGE_SIZE as usize]) {
        let base = self.slots[index].slot_sector;
        for i in 0..SECTORS_PER_SLOT {
            let start = (i * SECTOR_SIZE) as usize;
            device.write_sector(base + i, &page_bytes[start..start + SECTOR_SIZE as usize]);
        }
    }

    pub fn read(&self, device: &dyn BlockDevice, index: usize, page_bytes: &mut [u8; PAGE_SIZE as usize]) {
        let base = self.slots[index].slot_sector;
        for i in 0..SECTORS_PER_SLOT {
            let start = (i * SECTOR_SIZE) as usize;
            device.read_sector(base + i, &mut page_bytes[start..start + SECTOR_SIZE as usize]);
        }
    }

    /// Releases every slot belonging to `owner`, for process exit.
    pub fn release_owner(&mut self, owner: u32) {
        for slot in self.slots.iter_mut().filter(|s| s.owner == Some(owner)) {
            slot.taken = false;
            slot.vpage = None;
            slot.owner = None;
            slot.writable = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use x86_64::VirtAddr;

    fn page(n: u64) -> Page<Size4KiB> {
        Page::containing_address(VirtAddr::new(n * PAGE_SIZE))
    }

    #[test]
    fn reserve_release_round_trip() {
        let device = RamBlockDevice::new(SECTORS_PER_SLOT * 4);
        let mut table = SwapTable::init(&device);
        assert_eq!(table.len(), 4);

        let idx = table.reserve(page(1), 42, true).expect("slot available");
        assert!(table.entry(idx).taken);
        assert_eq!(table.find(page(1), 42), Some(idx));

        table.release(page(1), 42);
        assert!(!table.entry(idx).taken);
        assert_eq!(table.find(page(1), 42), None);
    }

    #[test]
    fn at_most_one_taken_entry_per_vpage_owner() {
        let device = RamBlockDevice::new(SECTORS_PER_SLOT * 2);
        let mut table = SwapTable::init(&device);

        let first = table.reserve(page(5), 1, false).unwrap();
        let second = table.reserve(page(9), 1, false).unwrap();
        assert_ne!(first, second);

        // Exhausted: a third reservation fails.
        assert_eq!(table.reserve(page(1), 1, false), None);
    }

    #[test]
    fn write_then_read_is_byte_identical() {
        let device = RamBlockDevice::new(SECTORS_PER_SLOT * 2);
        let mut table = SwapTable::init(&device);
        let idx = table.reserve(page(3), 1, true).unwrap();

        let mut written = [0u8; PAGE_SIZE as usize];
        for (i, b) in written.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        table.write(&device, idx, &written);

        let mut read_back = [0u8; PAGE_SIZE as usize];
        table.read(&device, idx, &mut read_back);
        assert_eq!(written, read_back);
    }
}
