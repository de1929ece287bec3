//! The thin syscall switch (spec.md §6 calls this an external collaborator,
//! "a thin switch reproduced verbatim from the syscall numbers"). Argument
//! pointers are range-checked against the user/kernel split here; an
//! in-range pointer that isn't actually backed by anything valid is left
//! to fault through the normal trap gate, where `handle_page_fault` kills
//! the process exactly as the fault resolver already does for any other
//! bad user access — there's no second, parallel mapping check to keep in
//! sync with `vm::fault::resolve`.

use core::arch::naked_asm;
use core::ffi::CStr;
use core::slice;

use alloc::sync::Arc;
use spin::Mutex;
use x86_64::instructions::port::Port;
use x86_64::structures::paging::OffsetPageTable;
use x86_64::VirtAddr;

use crate::filesystem::vfs::Filesystem;
use crate::scheduler::Thread;
use crate::user::lifecycle;
use crate::user::FileDescriptor;
use crate::vm;
use crate::{kernel_log, CPUS, VFS};

use super::{ProcessTable, UserProcess};

const CONSOLE_WRITE_CHUNK: usize = 256;

pub fn get_current_thread() -> Arc<Mutex<Thread>> {
    CPUS.get()
        .unwrap()
        .get_cpu()
        .current_thread
        .as_mut()
        .unwrap()
        .clone()
}

extern "sysv64" fn get_kernel_stack() -> u64 {
    CPUS.get()
        .unwrap()
        .get_cpu()
        .current_thread
        .as_mut()
        .unwrap()
        .lock()
        .kstack_addr()
        .as_u64()
}

fn current_pid() -> u32 {
    get_current_thread().lock().process.expect("no current process")
}

/// Gets the current process (for syscalls)
/// # Panics
/// If there is no current process or the CPU struct isn't initialised
fn get_current_process() -> Arc<Mutex<UserProcess>> {
    ProcessTable::get_by_pid(current_pid()).expect("no current process")
}

/// True if an address is in userspace. This is a higher-half kernel, so
/// userspace addresses all have bit 63 clear.
fn check_addr(addr: VirtAddr) -> bool {
    addr.as_u64() & (1 << 63) == 0
}

fn check_buffer(buffer: &[u8]) -> bool {
    let start = buffer.as_ptr();
    let end = unsafe { start.byte_add(buffer.len()) };
    check_addr(VirtAddr::from_ptr(start)) && check_addr(VirtAddr::from_ptr(end))
}

fn check_str(ptr: *const i8) -> Option<&'static str> {
    if ptr.is_null() || !check_addr(VirtAddr::new(ptr as u64)) {
        return None;
    }
    let s = unsafe { CStr::from_ptr(ptr) }.to_str().ok()?;
    if !check_buffer(s.as_bytes()) {
        return None;
    }
    Some(s)
}

fn home_dir() -> Result<Arc<crate::filesystem::vfs::Inode>, ()> {
    let vfs = VFS.get().unwrap();
    vfs.traverse_fs(vfs.root.clone(), "home").map_err(|_| ())
}

/// Powers the machine off. QEMU's isa-debug-exit device at port 0xf4 is the
/// usual way a bootloader-crate kernel does this under emulation; there's
/// no ACPI shutdown wired up, so bare metal just parks.
fn halt() -> ! {
    kernel_log!("system halted");
    unsafe {
        let mut port: Port<u32> = Port::new(0xf4);
        port.write(0x10);
    }
    loop {
        x86_64::instructions::hlt();
    }
}

fn sys_exit(code: i32) -> ! {
    lifecycle::user_exit(current_pid(), code)
}

fn sys_exec(cmd_line: *const i8) -> i64 {
    let Some(cmd_line) = check_str(cmd_line) else { return -1 };
    lifecycle::exec(current_pid(), cmd_line) as i64
}

fn sys_wait(pid: u32) -> i64 {
    lifecycle::wait(&get_current_process(), pid) as i64
}

fn sys_create(file: *const i8, initial_size: usize) -> u64 {
    let Some(name) = check_str(file) else { return 0 };
    if !vm::config::valid_filename(name) {
        return 0;
    }
    let Ok(dir) = home_dir() else { return 0 };
    VFS.get().unwrap().create(dir, name, initial_size).is_ok() as u64
}

fn sys_remove(file: *const i8) -> u64 {
    let Some(name) = check_str(file) else { return 0 };
    if !vm::config::valid_filename(name) {
        return 0;
    }
    let Ok(dir) = home_dir() else { return 0 };
    VFS.get().unwrap().remove(dir, name).is_ok() as u64
}

fn sys_open(file: *const i8) -> i64 {
    let Some(path) = check_str(file) else { return -1 };

    let vfs = VFS.get().unwrap();
    let Ok(inode) = vfs.traverse_fs(vfs.root.clone(), path) else { return -1 };
    if vfs.open(inode.clone()).is_err() {
        return -1;
    }

    let process = get_current_process();
    let mut process = process.lock();
    let fd = process.next_fd;
    process.files.insert(fd, Arc::new(spin::RwLock::new(FileDescriptor { inode, offset: 0 })));
    process.next_fd += 1;

    fd as i64
}

fn sys_filesize(fd: u32) -> i64 {
    let process = get_current_process();
    let process = process.lock();
    match process.files.get(&fd) {
        Some(fd) => fd.read().inode.size as i64,
        None => -1,
    }
}

fn sys_read(fd: u32, buf: *mut u8, count: usize) -> i64 {
    let buf = unsafe { slice::from_raw_parts_mut(buf, count) };
    if !check_buffer(buf) {
        return -1;
    }

    let process = get_current_process();
    let process = process.lock();
    let Some(fd) = process.files.get(&fd) else { return -1 };
    let mut fd = fd.write();

    let vfs = VFS.get().unwrap();
    match vfs.read(fd.inode.clone(), fd.offset, buf) {
        Ok(n) => {
            fd.offset += n as u64;
            n as i64
        }
        Err(_) => -1,
    }
}

/// Writes `buf` to `fd`, forwarding it to the VFS in chunks of at most
/// `CONSOLE_WRITE_CHUNK` bytes — the console device is only ever handed
/// small pieces at a time.
fn sys_write(fd: u32, buf: *const u8, count: usize) -> i64 {
    let buf = unsafe { slice::from_raw_parts(buf, count) };
    if !check_buffer(buf) {
        return -1;
    }

    let process = get_current_process();
    let process = process.lock();
    let Some(fd) = process.files.get(&fd) else { return -1 };
    let mut fd = fd.write();

    let vfs = VFS.get().unwrap();
    let mut written = 0;
    for chunk in buf.chunks(CONSOLE_WRITE_CHUNK) {
        match vfs.write(fd.inode.clone(), fd.offset, chunk) {
            Ok(n) => {
                fd.offset += n as u64;
                written += n;
                if n < chunk.len() {
                    break;
                }
            }
            Err(_) => break,
        }
    }

    if written == 0 && !buf.is_empty() { -1 } else { written as i64 }
}

fn sys_seek(fd: u32, position: u64) -> u64 {
    let process = get_current_process();
    let process = process.lock();
    if let Some(fd) = process.files.get(&fd) {
        fd.write().offset = position;
    }
    0
}

fn sys_tell(fd: u32) -> i64 {
    let process = get_current_process();
    let process = process.lock();
    match process.files.get(&fd) {
        Some(fd) => fd.read().offset as i64,
        None => -1,
    }
}

fn sys_close(fd: u32) -> u64 {
    let process = get_current_process();
    let mut process = process.lock();
    if let Some(fd) = process.files.remove(&fd) {
        let _ = VFS.get().unwrap().close(fd.read().inode.clone());
    }
    0
}

pub extern "sysv64" fn handle_syscall_inner(syscall_number: u64, arg0: u64, arg1: u64, arg2: u64, _arg3: u64) -> u64 {
    match syscall_number {
        0 => halt(),
        1 => sys_exit(arg0 as i32),
        2 => sys_exec(arg0 as usize as *const i8) as u64,
        3 => sys_wait(arg0 as u32) as u64,
        4 => sys_create(arg0 as usize as *const i8, arg1 as usize),
        5 => sys_remove(arg0 as usize as *const i8),
        6 => sys_open(arg0 as usize as *const i8) as u64,
        7 => sys_filesize(arg0 as u32) as u64,
        8 => sys_read(arg0 as u32, arg1 as usize as *mut u8, arg2 as usize) as u64,
        9 => sys_write(arg0 as u32, arg1 as usize as *const u8, arg2 as usize) as u64,
        10 => sys_seek(arg0 as u32, arg1),
        11 => sys_tell(arg0 as u32) as u64,
        12 => {
            sys_close(arg0 as u32);
            0
        }
        _ => {
            kernel_log!("unknown syscall {}: ({}, {}, {})", syscall_number, arg0, arg1, arg2);
            u64::MAX
        }
    }
}

/// Reads the bytes a `PageSource` refers to, the production counterpart to
/// the in-memory readers `vm::fault`'s own tests use.
fn read_page_source(source: &vm::supplemental::PageSource, offset: u64, buf: &mut [u8]) -> usize {
    use vm::supplemental::PageSource;

    let inode = match source {
        PageSource::Executable { inode } => inode,
        PageSource::MmappedFile { inode, .. } => inode,
    };

    VFS.get().unwrap().read(inode.clone(), offset, buf).unwrap_or(0)
}

/// Called from the page-fault trap gate (`interrupts::exception_handlers`)
/// for a fault taken in user mode. Classifies and resolves it through
/// `vm::fault::resolve`, killing the owning process on failure exactly as
/// a bad syscall pointer would be.
pub fn handle_page_fault(fault_addr: VirtAddr, user: bool, esp: VirtAddr) -> bool {
    let process = get_current_process();
    let mut process = process.lock();
    let pid = process.pid;

    // `X86Mmu::new` takes ownership of an `OffsetPageTable`, but `process`
    // already owns one — rebuild a second handle onto the same physical
    // table rather than fight the borrow checker for the original, the
    // same raw-pointer trick `blank_l4_table` uses to clone a mapper.
    let phys_offset = process.mapper.phys_offset();
    let l4_ptr: *mut x86_64::structures::paging::PageTable = process.mapper.level_4_table_mut();
    let mapper = unsafe { OffsetPageTable::new(&mut *l4_ptr, phys_offset) };
    let mut mmu = vm::mmu::X86Mmu::new(mapper);

    let mut vm_guard = vm::VM.get().unwrap().lock();
    let device = vm::swap_device();
    let mut reader = read_page_source;
    let outcome = vm::fault::resolve(
        &mut vm_guard,
        device,
        &mut mmu,
        &mut process.supp,
        pid,
        fault_addr,
        user,
        esp,
        &mut reader,
    );

    matches!(outcome, vm::fault::FaultOutcome::Resolved)
}

#[unsafe(naked)]
pub unsafe extern "sysv64" fn handle_syscall() {
    // save registers required by sysretq
    naked_asm!(
        "
        // systretq uses these
        push rcx // saved rip
        push r11 // saved rflags

        // We use these two callee-saved registers so back up the original values
        push rbp // Will store old sp
        push rbx // Will store new sp

        push rax // sycall number
        push rdi // arg0
        push rsi // arg1
        push rdx // arg2
        push r10 // arg3

        call {} // Return value is now in rax
        mov rbx, rax // RBX = new sp

        // Restore syscall params
        pop r10
        pop rdx
        pop rsi
        pop rdi
        pop rax

        mov rbp, rsp // backup userspace stack
        mov rsp, rbx // switch to new stack

        // === FROM NOW ON WE ARE ON KERNEL STACK ===

        // We push args to new stack
        push rax // sycall number
        push rdi // arg0
        push rsi // arg1
        push rdx // arg2
        push r10 // arg3

        // Pop to follow normal sysv64 calling convention
        pop r8
        pop rcx
        pop rdx
        pop rsi
        pop rdi

        call {}

        jmp {}
        ",
        sym get_kernel_stack,
        sym handle_syscall_inner,
        sym syscall_ret
    );
}

/// Handles returning to userspace, restoring the userspace stack via the
/// callee-saved rbp register.
#[unsafe(naked)]
pub unsafe extern "sysv64" fn syscall_ret() {
    naked_asm!(
        "
        mov rsp, rbp // Restore userspace stack
        pop rbx
        pop rbp
        pop r11
        pop rcx
        sysretq
        "
    )
}
