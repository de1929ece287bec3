#![feature(abi_x86_interrupt)]
#![no_std]
#![no_main]
extern crate alloc;

mod acpi_handler;
mod apic;
mod console;
mod cpu;
mod filesystem;
mod interrupts;
mod memory;
mod panic;
mod scheduler;
mod user;
mod vm;

use alloc::boxed::Box;
use alloc::vec::Vec;

use bootloader_api::config::Mapping;
use bootloader_api::BootloaderConfig;
use conquer_once::spin::OnceCell;
use spin::Mutex;
use x86_64::VirtAddr;

use console::Console;
use cpu::{Cpus, PerCpu};
use filesystem::devfs::Devfs;
use filesystem::memfs::MemFs;
use filesystem::ramdisk::Ramdisk;
use filesystem::vfs::VirtualFileSystem;
use memory::PhysicalMemoryManager;
use user::{ProcessTable, UserProcess};
use vm::swap::RamBlockDevice;

/// Where the local APIC's memory-mapped registers are mapped, an address
/// chosen well clear of the heap and any process's user-space range.
pub const LAPIC_START_VIRT: u64 = 0x_5555_5555_0000;
pub const IOAPIC_START_VIRT: u64 = 0x_5555_5556_0000;

/// Frames not handed to `vm::Vm`'s evictable pool: page-table frames (for
/// both the boot mapper and every process's address space) and one-off
/// MMIO mappings (LAPIC, IOAPIC). Kept behind its own lock so the MMU
/// driver never needs to re-enter `vm::VM`'s lock while a fault is being
/// resolved.
pub static PMM: OnceCell<Mutex<PhysicalMemoryManager>> = OnceCell::uninit();

/// One entry per CPU; only ever one entry today.
pub static CPUS: OnceCell<Cpus> = OnceCell::uninit();

pub static VFS: OnceCell<VirtualFileSystem> = OnceCell::uninit();

/// Frames handed to the evictable user-data pool, split off `PMM` at boot.
/// Picked as roughly three quarters of the frames the bootloader leaves
/// free, leaving the rest for page tables and MMIO windows.
const VM_POOL_FRACTION_NUM: usize = 3;
const VM_POOL_FRACTION_DEN: usize = 4;

/// Sectors backing the swap block device. The real block-device driver is
/// an opaque collaborator this crate never implements (see DESIGN.md); a
/// `RamBlockDevice` stands in, giving swap a genuine backing store without
/// a disk controller driver.
const SWAP_DEVICE_SECTORS: u64 = vm::config::SECTORS_PER_SLOT * 256;

pub static BOOTLOADER_CONFIG: BootloaderConfig = {
    let mut config = BootloaderConfig::new_default();
    config.mappings.physical_memory = Some(Mapping::Dynamic);
    config.mappings.page_table_recursive = None;
    config
};

bootloader_api::entry_point!(kernel_main, config = &BOOTLOADER_CONFIG);

fn kernel_main(boot_info: &'static mut bootloader_api::BootInfo) -> ! {
    let framebuffer = boot_info
        .framebuffer
        .as_mut()
        .expect("bootloader did not provide a framebuffer");
    unsafe { panic::PANIC_FRAMEBUFFER = Some(&raw mut *framebuffer) };
    let console = Console::new(framebuffer);

    let phys_offset = VirtAddr::new(
        boot_info
            .physical_memory_offset
            .into_option()
            .expect("bootloader did not map physical memory"),
    );

    let (mapper, mut pmm) = unsafe { memory::init(phys_offset, &boot_info.memory_regions) };

    let vm_frames = pmm.frame_count() * VM_POOL_FRACTION_NUM / VM_POOL_FRACTION_DEN;
    let vm_pool = pmm.split_off(vm_frames);

    PMM.init_once(|| Mutex::new(pmm));

    let swap_device = RamBlockDevice::new(SWAP_DEVICE_SECTORS);
    vm::init(vm_pool, Box::new(swap_device));

    let cpu = unsafe { PerCpu::init_cpu() };
    CPUS.init_once(|| Cpus::new(cpu));
    unsafe { CPUS.get().unwrap().get_cpu().init_gdt() };

    interrupts::init_idt();
    scheduler::init();
    ProcessTable::init();

    let mut vfs = VirtualFileSystem::new();
    vfs.mount(1, Box::new(Devfs::init(console, 1)), "dev", 0)
        .expect("mounting devfs must succeed");
    vfs.mount(2, Box::new(Ramdisk::from_files(2, Vec::new())), "bin", 0)
        .expect("mounting ramdisk must succeed");
    vfs.mount(3, Box::new(MemFs::new(3)), "home", 0)
        .expect("mounting memfs must succeed");
    VFS.init_once(|| vfs);

    let rsdp_addr = boot_info.rsdp_addr.into_option().expect("bootloader did not provide an RSDP address");
    let handler = acpi_handler::Handler { phys_offset };
    let acpi_tables =
        unsafe { acpi::AcpiTables::from_rsdp(handler, rsdp_addr as usize) }.expect("failed to parse ACPI tables");
    let platform_info = acpi_tables.platform_info().expect("failed to read ACPI platform info");

    let mut mapper = mapper;
    apic::enable(&mut mapper, &platform_info.interrupt_model);

    let bootstrap_pid = UserProcess::create(mapper);

    kernel_log!("boot complete, starting init");
    if user::lifecycle::exec(bootstrap_pid, "bin/init") < 0 {
        kernel_log!("no init program found; idling");
    }

    x86_64::instructions::interrupts::enable();
    loop {
        scheduler::yield_execution();
    }
}
