//! The VM subsystem: components B–F (frame pool, swap allocator, frame
//! table, supplementary page table, eviction engine) behind one lock, per
//! the design note that a single global "VM lock" suffices. Reached
//! through the `VM` global the same way the teacher reaches `PROCESS_TABLE`
//! / `VFS` / `PMM`.

pub mod config;
pub mod eviction;
pub mod fault;
pub mod frame_table;
pub mod loader;
pub mod mmu;
pub mod supplemental;
pub mod swap;

use alloc::boxed::Box;

use conquer_once::spin::OnceCell;
use spin::Mutex;

use crate::memory::PhysicalMemoryManager;
use frame_table::FrameTable;
use swap::{BlockDevice, SwapTable};

#[derive(Debug)]
pub enum VmError {
    OutOfFrames,
    BadElf(loader::LoadError),
    MmuInstallFailed,
}

/// Owns components B–F. `clock_cursor` lives here, not inside `FrameTable`,
/// so eviction and installation can never disagree about its position —
/// both only ever run while holding this struct's lock.
pub struct Vm {
    pub frames: PhysicalMemoryManager,
    pub frame_table: FrameTable,
    pub swap_table: SwapTable,
    pub clock_cursor: usize,
}

impl Vm {
    pub fn new(frames: PhysicalMemoryManager, device: &dyn BlockDevice) -> Self {
        Vm {
            frames,
            frame_table: FrameTable::new(),
            swap_table: SwapTable::init(device),
            clock_cursor: 0,
        }
    }
}

pub static VM: OnceCell<Mutex<Vm>> = OnceCell::uninit();

/// The block device backing swap, owned for the life of the kernel. `Vm`'s
/// own methods take `&dyn BlockDevice` as an explicit parameter rather than
/// storing it (so host tests can swap in a fresh `RamBlockDevice` per test
/// without touching a global) — production call sites fetch it from here.
pub static SWAP_DEVICE: OnceCell<Box<dyn BlockDevice>> = OnceCell::uninit();

pub fn init(frames: PhysicalMemoryManager, device: Box<dyn BlockDevice>) {
    VM.try_init_once(|| Mutex::new(Vm::new(frames, device.as_ref())))
        .expect("vm::init() can only be called once.");
    SWAP_DEVICE
        .try_init_once(|| device)
        .expect("vm::init() can only be called once.");
}

/// Convenience accessor for the call sites that need both the lock and the
/// device in the same breath (the page-fault path, the evictor).
pub fn swap_device() -> &'static dyn BlockDevice {
    SWAP_DEVICE.get().expect("vm::init should have been called").as_ref()
}
