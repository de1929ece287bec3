use core::arch::naked_asm;
use core::sync::atomic::{AtomicU32, Ordering};

use alloc::collections::btree_map::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use conquer_once::spin::OnceCell;
use spin::RwLock;
use spin::mutex::Mutex;
use x86_64::registers::control::Cr3;
use x86_64::structures::paging::{OffsetPageTable, PhysFrame};

use crate::filesystem::vfs::Inode;
use crate::scheduler::{Thread, WaitQueue};
use crate::vm::supplemental::SuppPageTable;
use lifecycle::{ChildBlock, ChildState};

pub mod lifecycle;
pub mod syscalls;

static NEXT_PID: AtomicU32 = AtomicU32::new(1);
static PROCESS_TABLE: OnceCell<ProcessTable> = OnceCell::uninit();

/// Hands out a fresh pid. Only `UserProcess::create` (the bootstrap
/// process) and `lifecycle::exec` (every child) may call this.
pub(super) fn next_pid() -> u32 {
    NEXT_PID.fetch_add(1, Ordering::Relaxed)
}

pub struct ProcessTable {
    /// Maps PID to user process
    processes: RwLock<BTreeMap<u32, Arc<Mutex<UserProcess>>>>,
}

impl ProcessTable {
    pub fn init() {
        PROCESS_TABLE.init_once(|| ProcessTable {
            processes: RwLock::new(BTreeMap::new()),
        });
    }

    /// Gets a process by its PID
    /// # Panics
    /// Panics if ProcessTable::init() has not been called.
    ///
    /// Most references to processes should be by PID. Holding this Arc<> for too long
    /// will delay process destruction, so drop this as soon as possible.
    pub fn get_by_pid(pid: u32) -> Option<Arc<Mutex<UserProcess>>> {
        PROCESS_TABLE
            .get()
            .expect("Expected ProcessTable::init() to have been called.")
            .processes
            .read()
            .get(&pid)
            .cloned()
    }

    /// Used internally by `lifecycle::exec` and `UserProcess::create` to
    /// register a newly built process.
    pub(super) fn add_process(process: UserProcess) {
        PROCESS_TABLE
            .get()
            .expect("Expected ProcessTable::init() to have been called.")
            .processes
            .write()
            .insert(process.pid, Arc::new(Mutex::new(process)));
    }

    /// Drops a process out of the table once it has exited and been reaped
    /// (or its zombie status block has been handed off for good).
    pub(super) fn remove(pid: u32) {
        PROCESS_TABLE
            .get()
            .expect("Expected ProcessTable::init() to have been called.")
            .processes
            .write()
            .remove(&pid);
    }
}

pub struct FileDescriptor {
    pub inode: Arc<Inode>,
    pub offset: u64,
}

/// Per-process record (spec.md §3's "process descriptor"). `supp`,
/// `children`, `own_status`, and `status_waitq` are the pieces
/// `lifecycle.rs` adds on top of what the teacher's bare address-space
/// wrapper used to carry.
pub struct UserProcess {
    /// Open file descriptors, first free one ≥ 2 issued on open.
    pub files: BTreeMap<u32, Arc<RwLock<FileDescriptor>>>,
    pub next_fd: u32,
    pub mapper: OffsetPageTable<'static>,
    pub thread: Arc<Mutex<Thread>>,
    pub pid: u32,
    /// Not-yet-resident pages; consulted by `vm::fault::resolve`.
    pub supp: SuppPageTable,
    /// The executable backing this process, write-denied for as long as
    /// this field holds it. `None` only for the bootstrap process, which
    /// never runs user code of its own.
    pub exe: Option<Arc<Inode>>,
    pub name: String,
    /// Status blocks for this process's own children, so `user_exit` can
    /// null their back-pointers.
    pub children: Vec<Arc<Mutex<ChildBlock>>>,
    /// This process's own status block, shared with whatever parent
    /// spawned it (`None` parent link for the bootstrap process).
    pub own_status: Arc<Mutex<ChildBlock>>,
    /// Signalled by a child publishing its exit into `own_status`.
    pub status_waitq: WaitQueue,
    pub cr3_frame: PhysFrame,
}

impl UserProcess {
    /// Builds the bootstrap process: reuses the boot-time page tables, and
    /// exists only so `lifecycle::exec` has a "parent" to clone the
    /// kernel-half mappings from when it spawns the first real user
    /// process. Returns the new pid.
    pub fn create(mapper: OffsetPageTable<'static>) -> u32 {
        let pid = next_pid();

        let thread = Arc::new(Mutex::new(Thread::from_func(
            enter_userspace,
            None,
            None,
            None,
        )));

        let own_status = Arc::new(Mutex::new(ChildBlock {
            child_pid: pid,
            state: ChildState::Started,
            exit_code: 0,
            parent: None,
        }));

        let cr3_frame = Cr3::read().0;

        let process = UserProcess {
            files: BTreeMap::new(),
            next_fd: 2,
            mapper,
            thread: thread.clone(),
            pid,
            supp: SuppPageTable::new(),
            exe: None,
            name: String::from("kernel"),
            children: Vec::new(),
            own_status,
            status_waitq: WaitQueue::new(),
            cr3_frame,
        };

        thread.lock().process = Some(pid);
        thread.lock().cr3_frame = Some(cr3_frame);

        ProcessTable::add_process(process);

        pid
    }
}

/// Enters userspace, enabling interrupts. Since thread entry points
/// can't take parameters:
/// - rbp stores userspace entry point
/// - rbx stores userspace stack pointer
#[unsafe(naked)]
pub(super) unsafe extern "sysv64" fn enter_userspace() {
    naked_asm!(
        // We must keep the userspace stack in rbx, since the kstack
        // is used to 'return' into here.
        "mov rsp, rbx
        mov rcx, rbp
        mov r11, 0x0202
        sysretq"
    )
}
