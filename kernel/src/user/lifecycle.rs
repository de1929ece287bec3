//! Component I: the parent/child process lifecycle protocol. `exec` loads
//! and starts a new process synchronously on the calling (parent) thread —
//! the physical-memory offset mapping every `OffsetPageTable` uses makes a
//! child's page tables just as reachable as the parent's own, so there is
//! no need to actually schedule the child before its address space is
//! fully built. This collapses Pintos's two-phase
//! `process_execute`/`start_process` rendezvous into one synchronous call,
//! which is why `ChildState::Initializing` is never observed from outside
//! this module: a child is only ever published (registered with
//! `ProcessTable`, given a `ChildBlock`, enqueued) once loading has already
//! succeeded. See DESIGN.md for the reasoning.

use alloc::borrow::ToOwned;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use spin::Mutex;
use x86_64::structures::paging::{FrameAllocator, FrameDeallocator, Mapper, OffsetPageTable, PageTable, PhysFrame};

use crate::filesystem;
use crate::scheduler::{self, Thread, WaitQueue};
use crate::vm::mmu::X86Mmu;
use crate::vm::{self, loader};
use crate::PMM;
use crate::{kernel_log, VFS};

use super::{FileDescriptor, ProcessTable, UserProcess};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    Initializing,
    Started,
    Exited,
    Failed,
}

/// A child's status, shared between parent and child. The parent's
/// `status_waitq` is what callers actually block on; this struct is just
/// the condition they re-check each time they wake.
pub struct ChildBlock {
    pub child_pid: u32,
    pub state: ChildState,
    pub exit_code: i32,
    pub parent: Option<Weak<Mutex<UserProcess>>>,
}

/// Clones the kernel half (entries 256..512, shared by every address space)
/// of `parent`'s L4 table into a fresh, otherwise-empty table. Replaces the
/// teacher's `fork_page_table`, which additionally deep-cloned the user
/// half for a Pintos-style `fork()` this kernel's syscall table has no use
/// for (`exec` builds the child's address space from scratch instead).
fn blank_l4_table(parent: &OffsetPageTable<'static>) -> (OffsetPageTable<'static>, PhysFrame) {
    let frame = PMM.get().unwrap().lock().allocate_frame().expect("no frame available for page table");

    let phys_offset = parent.phys_offset();
    let dst_ptr = (phys_offset + frame.start_address().as_u64()).as_mut_ptr::<PageTable>();
    let dst: &'static mut PageTable = unsafe { &mut *dst_ptr };
    *dst = PageTable::new();

    for (i, entry) in parent.level_4_table().iter().enumerate() {
        if i >= 256 {
            dst[i] = entry.clone();
        }
    }

    let mapper = unsafe { OffsetPageTable::new(dst, phys_offset) };
    (mapper, frame)
}

/// Implements the `exec` syscall: tokenizes `cmd_line`, reads the named
/// executable from the VFS, builds a child address space and loads it, and
/// on success registers and enqueues the child. Returns the child's pid, or
/// -1 if the command line is empty, the file can't be found, or it fails
/// `vm::loader` validation — mirroring spec scenario 4 (a bad ELF never
/// produces a running process, and so never prints an exit line).
pub fn exec(parent_pid: u32, cmd_line: &str) -> i32 {
    let mut args = cmd_line.split_whitespace();
    let Some(path) = args.next() else { return -1 };
    let args: Vec<&str> = core::iter::once(path).chain(args).collect();

    let Ok(binary) = filesystem::read(path) else {
        kernel_log!("exec: {}: no such file", path);
        return -1;
    };

    let parent = ProcessTable::get_by_pid(parent_pid).expect("current process must exist");

    let (child_l4, cr3_frame) = {
        let parent_guard = parent.lock();
        blank_l4_table(&parent_guard.mapper)
    };

    let mut supp = vm::supplemental::SuppPageTable::new();

    let vfs = VFS.get().unwrap();
    let Ok(inode) = vfs.traverse_fs(vfs.root.clone(), path) else {
        kernel_log!("exec: {}: no such file", path);
        return -1;
    };

    let entry = match loader::validate_and_record(&binary, &inode, &mut supp) {
        Ok(entry) => entry,
        Err(e) => {
            kernel_log!("exec: {}: bad executable ({:?})", path, e);
            return -1;
        }
    };

    let mut mmu = X86Mmu::new(child_l4);
    let child_pid = super::next_pid();

    let stack_top = {
        let mut vm_guard = vm::VM.get().unwrap().lock();
        match loader::build_stack(&mut vm_guard, &mut mmu, child_pid, &args) {
            Ok(sp) => sp,
            Err(e) => {
                kernel_log!("exec: {}: failed to build stack ({:?})", path, e);
                return -1;
            }
        }
    };

    let mapper = mmu.into_inner();

    vfs.open(inode.clone()).expect("opening the just-loaded binary inode must succeed");
    vfs.deny_write(&inode);

    let own_status = Arc::new(Mutex::new(ChildBlock {
        child_pid,
        state: ChildState::Started,
        exit_code: 0,
        parent: Some(Arc::downgrade(&parent)),
    }));
    // `own_status` is shared verbatim between the child's own
    // `UserProcess::own_status` field and the parent's `children` entry for
    // it below — the single `ChildBlock` both sides read and, on exit,
    // mutate under its own lock.

    let thread = Arc::new(Mutex::new(Thread::from_func(super::enter_userspace, None, Some(path.to_owned()), Some(cr3_frame))));
    thread.lock().process = Some(child_pid);
    thread.lock().context.rbp = entry.as_u64();
    thread.lock().context.rbx = stack_top.as_u64();

    let mut files = alloc::collections::btree_map::BTreeMap::new();
    files.insert(0, Arc::new(spin::RwLock::new(FileDescriptor { inode: console_inode(), offset: 0 })));
    files.insert(1, Arc::new(spin::RwLock::new(FileDescriptor { inode: console_inode(), offset: 0 })));

    let child = UserProcess {
        files,
        next_fd: 2,
        mapper,
        thread: thread.clone(),
        pid: child_pid,
        supp,
        exe: Some(inode),
        name: path.to_owned(),
        children: Vec::new(),
        own_status: own_status.clone(),
        status_waitq: WaitQueue::new(),
        cr3_frame,
    };

    super::ProcessTable::add_process(child);
    parent.lock().children.push(own_status);
    scheduler::enqueue(thread);

    child_pid as i32
}

fn console_inode() -> Arc<crate::filesystem::vfs::Inode> {
    let vfs = VFS.get().unwrap();
    vfs.traverse_fs(vfs.root.clone(), "dev/console")
        .expect("devfs must be mounted at dev/ before any process runs")
}

/// Implements the `wait` syscall. Looks up `child_pid` among `parent`'s
/// recorded children; if absent (never a child, or already reaped) returns
/// -1. Otherwise blocks until the child leaves `Started`, reaps its block,
/// and returns its exit code.
pub fn wait(parent: &Arc<Mutex<UserProcess>>, child_pid: u32) -> i32 {
    let child_block = {
        let parent_guard = parent.lock();
        parent_guard
            .children
            .iter()
            .find(|cb| cb.lock().child_pid == child_pid)
            .cloned()
    };
    let Some(child_block) = child_block else { return -1 };

    loop {
        let done = { child_block.lock().state != ChildState::Started };
        if done {
            break;
        }

        let parked = {
            let parent_guard = parent.lock();
            parent_guard
                .status_waitq
                .park_if(|| child_block.lock().state == ChildState::Started)
        };
        if parked {
            scheduler::yield_execution();
        }
    }

    let mut parent_guard = parent.lock();
    if let Some(idx) = parent_guard.children.iter().position(|cb| Arc::ptr_eq(cb, &child_block)) {
        parent_guard.children.remove(idx);
    }
    drop(parent_guard);

    child_block.lock().exit_code
}

/// Implements the user-visible half of `exit`: prints the standard exit
/// line, records the exit code, signals the parent (or frees this
/// process's own status block if the parent is gone), reparents or frees
/// this process's own children, and closes every open file including the
/// executable (re-enabling writes to it). Never returns — the calling
/// thread parks forever, reaped only once nothing else references it.
pub fn user_exit(pid: u32, code: i32) -> ! {
    let process = ProcessTable::get_by_pid(pid).expect("exiting process must exist");
    let (name, own_status, children, files, exe) = {
        let guard = process.lock();
        (
            guard.name.clone(),
            guard.own_status.clone(),
            guard.children.clone(),
            guard.files.clone(),
            guard.exe.clone(),
        )
    };

    kernel_log!("{}: exit({})", name, code);

    let parent = {
        let mut status = own_status.lock();
        status.state = ChildState::Exited;
        status.exit_code = code;
        status.parent.clone()
    };

    match parent.as_ref().and_then(Weak::upgrade) {
        Some(parent) => {
            parent.lock().status_waitq.wake_all();
        }
        None => {
            // Parent already exited and nulled our back-pointer (or never
            // existed): nothing else references `own_status`, so dropping
            // `process` below is the free.
        }
    }

    for child in children {
        let mut child_guard = child.lock();
        let already_done = matches!(child_guard.state, ChildState::Exited | ChildState::Failed);
        if !already_done {
            child_guard.parent = None;
        }
        // If it's already exited, its `ChildBlock` is only reachable through
        // this `children` `Vec`, which is about to be dropped along with
        // `process` itself — that drop is the free.
    }

    let vfs = VFS.get().unwrap();
    for fd in files.values() {
        let fd = fd.read();
        let _ = vfs.close(fd.inode.clone());
    }
    if let Some(exe) = exe {
        vfs.allow_write(&exe);
    }

    // Reclaim every frame this process still owned: unmap it from this
    // process's own page tables, then hand it back to the evictable pool.
    // Any swap slot reserved for this process but not currently occupying a
    // frame is released too.
    {
        let mut vm_guard = vm::VM.get().unwrap().lock();
        let owned = vm_guard.frame_table.drain_owner(pid);
        let mut process_guard = process.lock();
        for entry in owned {
            if let Ok((frame, flush)) = process_guard.mapper.unmap(entry.vpage) {
                flush.flush();
                unsafe { vm_guard.frames.deallocate_frame(frame) };
            }
        }
        vm_guard.swap_table.release_owner(pid);
    }

    ProcessTable::remove(pid);

    loop {
        scheduler::yield_execution();
    }
}
