//! Constants shared by every VM subsystem piece. Kept as bare `const`s,
//! matching the rest of the kernel (`memory::HEAP_START`,
//! `cpu::DOUBLE_FAULT_IST_INDEX`) rather than a runtime config layer.

/// Size of a page and of a physical frame. x86_64 4 KiB pages only — no
/// huge-page support anywhere in this kernel.
pub const PAGE_SIZE: u64 = 4096;

/// Size of a disk sector on the swap block device.
pub const SECTOR_SIZE: u64 = 512;

/// Sectors occupied by a single swap slot.
pub const SECTORS_PER_SLOT: u64 = PAGE_SIZE / SECTOR_SIZE;

/// Top of the user address range (System V AMD64 ABI figure 3.9: the
/// initial stack occupies the top of the lower canonical half). Matches
/// the constant the teacher's `UserProcess::execve` already used.
pub const USER_TOP: u64 = 0x7fff_ffff_0000;

/// How far below the stack pointer at fault time a fault is still treated
/// as an implicit stack extension. Accommodates `push`/`pusha` look-ahead.
/// Fixed at 32 per the design review (see DESIGN.md open question 3).
pub const STACK_GROWTH_SLACK: u64 = 32;

/// Upper bound on program headers a loaded ELF image may declare.
pub const MAX_PROGRAM_HEADERS: usize = 1024;

/// Minimum and maximum filename length accepted by `create`/`remove`/`open`.
pub const MIN_FILENAME_LEN: usize = 1;
pub const MAX_FILENAME_LEN: usize = 14;

pub fn valid_filename(name: &str) -> bool {
    (MIN_FILENAME_LEN..=MAX_FILENAME_LEN).contains(&name.len())
}
