//! Component H: the executable loader. Validates the ELF64 header
//! (matching the kernel's own architecture — see DESIGN.md's ELF-width
//! open question), then emits one supplementary entry per page of every
//! `PT_LOAD` segment. No segment bytes are read here; they materialize
//! only through `vm::fault::resolve`.
//!
//! Field offsets are the ELF64 header layout `UserProcess::execve`
//! already parsed by hand; this module keeps that approach rather than
//! introducing a parsing crate, since the teacher has no such dependency
//! anywhere in its stack.

use alloc::sync::Arc;
use alloc::vec::Vec;
use x86_64::structures::paging::{Page, Size4KiB};
use x86_64::VirtAddr;

use super::config::{self, MAX_PROGRAM_HEADERS, PAGE_SIZE, USER_TOP};
use super::mmu::Mmu;
use super::supplemental::{PageSource, SuppEntry, SuppPageTable};
use super::{Vm, VmError};
use crate::filesystem::vfs::Inode;

const EI_CLASS_64: u8 = 2;
const EI_DATA_LE: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_X86_64: u16 = 62;
const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;
const PT_INTERP: u32 = 3;
const PT_SHLIB: u32 = 5;

#[derive(Debug)]
pub enum LoadError {
    TooShort,
    BadMagic,
    NotElf64,
    NotLittleEndian,
    NotExecutable,
    WrongMachine,
    PhentsizeMismatch,
    TooManyProgramHeaders,
    DisallowedSegmentType,
    SegmentOutOfBounds,
    VmError(VmError),
}

impl From<VmError> for LoadError {
    fn from(e: VmError) -> Self {
        LoadError::VmError(e)
    }
}

#[repr(C)]
struct ProgramHeader {
    segment_type: u64, // p_type (low 32 bits) | p_flags << 32, matching the teacher's packed field
    offset: u64,
    virtual_address: u64,
    unused: u64,
    image_size: u64,
    mem_size: u64,
    align: u64,
}

fn read_u16(binary: &[u8], at: usize) -> u16 {
    u16::from_le_bytes(binary[at..at + 2].try_into().unwrap())
}

fn read_u64(binary: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(binary[at..at + 8].try_into().unwrap())
}

/// Validates the ELF64 header and emits one supplementary entry per page
/// of every `PT_LOAD` segment. Returns the entry point.
pub fn validate_and_record(binary: &[u8], inode: &Arc<Inode>, supp: &mut SuppPageTable) -> Result<VirtAddr, LoadError> {
    if binary.len() < 0x40 {
        return Err(LoadError::TooShort);
    }
    if binary[0x0..0x4] != *b"\x7fELF" {
        return Err(LoadError::BadMagic);
    }
    if binary[0x4] != EI_CLASS_64 {
        return Err(LoadError::NotElf64);
    }
    if binary[0x5] != EI_DATA_LE {
        return Err(LoadError::NotLittleEndian);
    }
    if read_u16(binary, 0x10) != ET_EXEC {
        return Err(LoadError::NotExecutable);
    }
    if read_u16(binary, 0x12) != EM_X86_64 {
        return Err(LoadError::WrongMachine);
    }

    let entry = read_u64(binary, 0x18);
    let phoff = read_u64(binary, 0x20) as usize;
    let phentsize = read_u16(binary, 0x36) as usize;
    let phnum = read_u16(binary, 0x38) as usize;

    if phentsize < size_of::<ProgramHeader>() {
        return Err(LoadError::PhentsizeMismatch);
    }
    if phnum > MAX_PROGRAM_HEADERS {
        return Err(LoadError::TooManyProgramHeaders);
    }

    for i in 0..phnum {
        let offset = phoff + phentsize * i;
        if offset + size_of::<ProgramHeader>() > binary.len() {
            return Err(LoadError::SegmentOutOfBounds);
        }
        let header = unsafe { &*(binary[offset..offset + size_of::<ProgramHeader>()].as_ptr() as *const ProgramHeader) };

        let segment_type = header.segment_type as u32;
        if segment_type == PT_DYNAMIC || segment_type == PT_INTERP || segment_type == PT_SHLIB {
            return Err(LoadError::DisallowedSegmentType);
        }
        if segment_type != PT_LOAD {
            continue;
        }

        let segment_flags = (header.segment_type >> 32) as u32;
        let writable = (segment_flags & 2) != 0;

        let vaddr = header.virtual_address;
        let file_end = header
            .offset
            .checked_add(header.image_size)
            .ok_or(LoadError::SegmentOutOfBounds)?;
        let mem_end = vaddr.checked_add(header.mem_size).ok_or(LoadError::SegmentOutOfBounds)?;

        if vaddr == 0
            || mem_end >= USER_TOP
            || file_end as usize > binary.len()
            || header.image_size > header.mem_size
        {
            return Err(LoadError::SegmentOutOfBounds);
        }

        let page_start = vaddr & !(PAGE_SIZE - 1);
        let mut page_vaddr = page_start;
        while page_vaddr < mem_end {
            let page: Page<Size4KiB> = Page::containing_address(VirtAddr::new(page_vaddr));

            let page_file_start = page_vaddr.max(vaddr);
            let page_file_end = (page_vaddr + PAGE_SIZE).min(vaddr + header.image_size);
            let read_bytes = page_file_end.saturating_sub(page_file_start).min(PAGE_SIZE) as u32;
            let zero_bytes = (PAGE_SIZE as u32) - read_bytes;
            let file_offset = header.offset + (page_file_start.saturating_sub(vaddr));

            supp.record(SuppEntry {
                vpage: page,
                source: PageSource::Executable { inode: Arc::clone(inode) },
                offset: if read_bytes > 0 { file_offset } else { 0 },
                read_bytes,
                zero_bytes,
                writable,
            });

            page_vaddr += PAGE_SIZE;
        }
    }

    Ok(VirtAddr::new(entry))
}

/// Builds the initial stack page: a zeroed frame at `USER_TOP - PAGE_SIZE`
/// carrying a standard System V AMD64 argv block (8-byte aligned — the
/// 64-bit generalization of spec.md's "standard System-V argv block"
/// note). Returns the initial stack pointer.
pub fn build_stack(vm: &mut Vm, mmu: &mut impl Mmu, owner: u32, args: &[&str]) -> Result<VirtAddr, VmError> {
    use x86_64::structures::paging::FrameAllocator;

    let frame = vm
        .frames
        .allocate_frame()
        .ok_or(VmError::OutOfFrames)?;

    let vpage: Page<Size4KiB> = Page::containing_address(VirtAddr::new(USER_TOP - PAGE_SIZE));
    let page_top = PAGE_SIZE as usize;
    let mut scratch = [0u8; PAGE_SIZE as usize];

    // Pack argv strings downward from the page top, then the pointer
    // array, argv base, argc, and a zero return address — the layout
    // `UserProcess::execve` already built for the 32-bit word size,
    // regeneralized to 8-byte alignment for x86_64.
    let mut cursor = page_top;
    let mut string_offsets = Vec::with_capacity(args.len());
    for arg in args {
        cursor -= arg.len() + 1;
        scratch[cursor..cursor + arg.len()].copy_from_slice(arg.as_bytes());
        scratch[cursor + arg.len()] = 0;
        string_offsets.push(cursor as u64);
    }
    cursor &= !0x7;

    let argv_entries = args.len() + 1; // + null sentinel
    let trailer_words = argv_entries + 2; // argv pointers + argc + fake return address
    cursor -= trailer_words * 8;
    cursor &= !0xf; // keep the eventual %rsp 16-byte aligned at the call boundary

    let mut word = cursor;

    scratch[word..word + 8].copy_from_slice(&0u64.to_le_bytes()); // fake return address
    word += 8;
    scratch[word..word + 8].copy_from_slice(&(args.len() as u64).to_le_bytes()); // argc
    word += 8;
    for offset in &string_offsets {
        let vaddr = USER_TOP - PAGE_SIZE + offset;
        scratch[word..word + 8].copy_from_slice(&vaddr.to_le_bytes());
        word += 8;
    }
    scratch[word..word + 8].copy_from_slice(&0u64.to_le_bytes()); // argv null sentinel

    mmu.write_frame(frame, 0, &scratch);
    mmu.map(vpage, frame, true).map_err(|_| VmError::MmuInstallFailed)?;
    vm.frame_table
        .install(super::frame_table::FrameTableEntry { frame, vpage, owner, writable: true });

    Ok(VirtAddr::new(USER_TOP - PAGE_SIZE) + cursor as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::vfs::FileType;
    use crate::memory::PhysicalMemoryManager;
    use crate::vm::mmu::MockMmu;
    use crate::vm::swap::RamBlockDevice;
    use x86_64::structures::paging::PhysFrame;
    use x86_64::PhysAddr;

    fn frame(n: u64) -> PhysFrame<Size4KiB> {
        PhysFrame::containing_address(PhysAddr::new(n * 4096))
    }

    fn dummy_inode() -> Arc<Inode> {
        Arc::new(Inode { dev: 0, inode: 1, file_type: FileType::File, size: 0, major: None, minor: None, inner: None })
    }

    fn make_elf(phnum: u16, entry: u64, segments: &[(u64, u64, u64, u32)]) -> Vec<u8> {
        // segments: (vaddr, file_size, mem_size, flags)
        let phoff = 0x40u64;
        let phentsize = size_of::<ProgramHeader>() as u16;
        let mut body_offset = phoff as usize + phentsize as usize * segments.len();
        let mut binary = alloc::vec![0u8; body_offset];

        binary[0x0..0x4].copy_from_slice(b"\x7fELF");
        binary[0x4] = EI_CLASS_64;
        binary[0x5] = EI_DATA_LE;
        binary[0x10..0x12].copy_from_slice(&ET_EXEC.to_le_bytes());
        binary[0x12..0x14].copy_from_slice(&EM_X86_64.to_le_bytes());
        binary[0x18..0x20].copy_from_slice(&entry.to_le_bytes());
        binary[0x20..0x28].copy_from_slice(&phoff.to_le_bytes());
        binary[0x36..0x38].copy_from_slice(&phentsize.to_le_bytes());
        binary[0x38..0x3A].copy_from_slice(&phnum.to_le_bytes());

        for (i, (vaddr, file_size, mem_size, flags)) in segments.iter().enumerate() {
            let file_offset = body_offset as u64;
            let entry_off = phoff as usize + phentsize as usize * i;
            let packed_type = 1u64 | ((*flags as u64) << 32);
            binary[entry_off..entry_off + 8].copy_from_slice(&packed_type.to_le_bytes());
            binary[entry_off + 8..entry_off + 16].copy_from_slice(&file_offset.to_le_bytes());
            binary[entry_off + 16..entry_off + 24].copy_from_slice(&vaddr.to_le_bytes());
            binary[entry_off + 32..entry_off + 40].copy_from_slice(&file_size.to_le_bytes());
            binary[entry_off + 40..entry_off + 48].copy_from_slice(&mem_size.to_le_bytes());

            binary.resize(body_offset + *file_size as usize, 0xAA);
            body_offset = binary.len();
        }

        binary
    }

    #[test]
    fn rejects_non_elf() {
        let mut supp = SuppPageTable::new();
        let err = validate_and_record(&[0u8; 64], &dummy_inode(), &mut supp).unwrap_err();
        assert!(matches!(err, LoadError::BadMagic));
    }

    #[test]
    fn records_one_entry_per_page_of_a_load_segment() {
        let binary = make_elf(1, 0x1000, &[(0x1000, 8192, 8192, 0b101)]);
        let mut supp = SuppPageTable::new();
        let entry = validate_and_record(&binary, &dummy_inode(), &mut supp).unwrap();

        assert_eq!(entry, VirtAddr::new(0x1000));
        assert_eq!(supp.len(), 2);
        let first = supp.lookup(Page::containing_address(VirtAddr::new(0x1000))).unwrap();
        assert_eq!(first.read_bytes + first.zero_bytes, PAGE_SIZE as u32);
        assert!(!first.writable);
    }

    #[test]
    fn tiles_a_partial_last_page_with_zero_fill() {
        // 100 bytes of file content backing a 4096-byte (one page) segment.
        let binary = make_elf(1, 0x1000, &[(0x1000, 100, 4096, 0b110)]);
        let mut supp = SuppPageTable::new();
        validate_and_record(&binary, &dummy_inode(), &mut supp).unwrap();

        let entry = supp.lookup(Page::containing_address(VirtAddr::new(0x1000))).unwrap();
        assert_eq!(entry.read_bytes, 100);
        assert_eq!(entry.zero_bytes, PAGE_SIZE as u32 - 100);
        assert!(entry.writable);
    }

    #[test]
    fn rejects_dynamic_segment() {
        let binary = make_elf(1, 0x1000, &[(0x1000, 0, 0, 0)]);
        let mut supp = SuppPageTable::new();
        let phoff = 0x40usize;
        let mut binary = binary;
        let packed_type = PT_DYNAMIC as u64;
        binary[phoff..phoff + 8].copy_from_slice(&packed_type.to_le_bytes());

        let err = validate_and_record(&binary, &dummy_inode(), &mut supp).unwrap_err();
        assert!(matches!(err, LoadError::DisallowedSegmentType));
    }

    #[test]
    fn stack_is_built_with_argc_and_argv_strings_present() {
        let device = RamBlockDevice::new(config::SECTORS_PER_SLOT * 4);
        let pmm = PhysicalMemoryManager::for_test(alloc::vec![frame(1)]);
        let mut vm = Vm::new(pmm, &device);
        let mut mmu = MockMmu::new();

        let sp = build_stack(&mut vm, &mut mmu, 1, &["echo", "hello"]).unwrap();
        assert!(sp.as_u64() < USER_TOP);
        assert!(sp.as_u64() >= USER_TOP - PAGE_SIZE);
        assert!(mmu.is_mapped(Page::containing_address(VirtAddr::new(USER_TOP - PAGE_SIZE))));
    }
}
