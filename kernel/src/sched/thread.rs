//! Thread records.

use core::ptr::NonNull;

use super::context::Context;

/// Thread identifier: an index into the thread table.
pub type Tid = usize;

/// Entry function of a kernel thread; receives the startup argument words.
pub type ThreadEntry = fn(args: [usize; 8]);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Uninitialized,
    Waiting,
    Running,
    Ready,
    Exited,
}

/// Written at the top of every kernel stack so the owning thread can be
/// recovered from a stack pointer during a trap.
#[repr(C)]
pub struct StackAnchor {
    pub thread: Tid,
    pub _pad: usize,
}

/// One slot of the fixed-size thread table.
pub(super) struct ThreadSlot {
    pub state: ThreadState,
    pub name: &'static str,
    /// Base of the thread's kernel stack page (None for the boot thread,
    /// whose stack predates the pool).
    pub stack: Option<NonNull<u8>>,
    pub ctx: Context,
    /// Startup block: entry pc and up to 8 argument words, consumed by the
    /// first-run shim.
    pub entry: Option<ThreadEntry>,
    pub args: [usize; 8],
    pub parent: Tid,
    /// Condition this thread is blocked on (diagnostic only).
    pub waiting_on: *const (),
    /// Linkage for the ready list or a condition's wait list; a thread is on
    /// at most one list at a time.
    pub next: Option<Tid>,
    pub exit_code: usize,
    /// Head of the list of locks this thread currently owns.
    pub owned_locks: *const super::lock::Lock,
    /// Owning process slot, inherited across spawn.
    pub pid: usize,
}

impl ThreadSlot {
    pub(super) const fn empty() -> Self {
        Self {
            state: ThreadState::Uninitialized,
            name: "",
            stack: None,
            ctx: Context::zeroed(),
            entry: None,
            args: [0; 8],
            parent: 0,
            waiting_on: core::ptr::null(),
            next: None,
            exit_code: 0,
            owned_locks: core::ptr::null(),
            pid: 0,
        }
    }

    /// The boot thread: already running on the boot stack when the kernel
    /// reaches Rust code.
    pub(super) const fn boot() -> Self {
        let mut slot = Self::empty();
        slot.state = ThreadState::Running;
        slot.name = "main";
        slot
    }
}
