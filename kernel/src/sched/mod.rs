//! Thread kernel.
//!
//! Parallel threads on a single hart: a FIFO ready list, cooperative
//! suspension through condition variables, reentrant ownership locks,
//! alarm-based sleep, and timer-driven preemption on return to user mode.
//! Exactly one thread runs at a time; the idle thread (`NTHR - 1`) stands in
//! whenever the ready list is empty.
//!
//! Thread-kernel state is mutated with interrupts disabled on the current
//! hart; there are no spin locks on these paths because a suspended thread
//! must be able to leave its critical section via a context switch.

pub mod alarm;
pub mod condition;
pub mod context;
pub mod lock;
mod thread;

pub use condition::Condition;
pub use lock::Lock;
pub use thread::{StackAnchor, ThreadEntry, ThreadState, Tid};

use core::cell::UnsafeCell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::{
    config::{NTHR, PAGE_SIZE, THREAD_STACK_SIZE},
    error::{KernelError, KernelResult},
    mm::PAGE_POOL,
};
use context::Context;
use thread::ThreadSlot;

/// The boot thread's slot.
pub const MAIN_TID: Tid = 0;

/// The idle thread's slot: always ready, never queued.
pub const IDLE_TID: Tid = NTHR - 1;

pub(crate) struct ThreadTable {
    pub(crate) ready_head: Option<Tid>,
    ready_tail: Option<Tid>,
    current: Tid,
    slots: [ThreadSlot; NTHR],
}

impl ThreadTable {
    const fn boot() -> Self {
        const EMPTY: ThreadSlot = ThreadSlot::empty();
        let mut slots = [EMPTY; NTHR];
        slots[MAIN_TID] = ThreadSlot::boot();
        Self {
            ready_head: None,
            ready_tail: None,
            current: MAIN_TID,
            slots,
        }
    }
}

struct SchedCell(UnsafeCell<ThreadTable>);

// SAFETY: the table is only accessed with interrupts disabled on the single
// hart (the host target emulates the disable with a process-wide lock), so
// access is always exclusive.
unsafe impl Sync for SchedCell {}

static SCHED: SchedCell = SchedCell(UnsafeCell::new(ThreadTable::boot()));

/// Per-thread child-exit conditions, indexed by the *parent* tid.
static CHILD_EXIT: [Condition; NTHR] = [const { Condition::new("child-exit") }; NTHR];

static PREEMPT_PENDING: AtomicBool = AtomicBool::new(false);

/// Exclusive access to the thread table.
///
/// # Safety
///
/// Interrupts must be disabled on the current hart, and the returned
/// reference must not outlive that window or overlap another call.
pub(crate) unsafe fn table_mut() -> &'static mut ThreadTable {
    // SAFETY: forwarded contract.
    unsafe { &mut *SCHED.0.get() }
}

fn with_table<R>(f: impl FnOnce(&mut ThreadTable) -> R) -> R {
    let was = crate::arch::irq_disable();
    // SAFETY: interrupts just disabled; the closure gets the only reference.
    let result = f(unsafe { &mut *SCHED.0.get() });
    crate::arch::irq_restore(was);
    result
}

pub(crate) fn ready_enqueue(table: &mut ThreadTable, tid: Tid) {
    table.slots[tid].next = None;
    match table.ready_tail {
        Some(tail) => table.slots[tail].next = Some(tid),
        None => table.ready_head = Some(tid),
    }
    table.ready_tail = Some(tid);
}

fn ready_dequeue(table: &mut ThreadTable) -> Option<Tid> {
    let head = table.ready_head?;
    table.ready_head = table.slots[head].next.take();
    if table.ready_head.is_none() {
        table.ready_tail = None;
    }
    Some(head)
}

/// Hand the hart to the next ready thread (or idle). Interrupts must be
/// disabled; returns when the outgoing thread is scheduled again.
pub(crate) fn reschedule(table: &mut ThreadTable) {
    let prev = table.current;
    let next = ready_dequeue(table).unwrap_or(IDLE_TID);
    table.slots[next].state = ThreadState::Running;
    if next == prev {
        return;
    }
    table.current = next;
    let old: *mut Context = &mut table.slots[prev].ctx;
    let new: *const Context = &table.slots[next].ctx;
    // SAFETY: both contexts live in the static table; interrupts are
    // disabled across the switch.
    unsafe { context::switch(old, new) };
}

/// First-run shim every spawned thread starts in: pulls the startup block
/// out of the thread slot, enables interrupts, and calls the entry. Entry
/// return is thread exit.
extern "C" fn thread_shim() -> ! {
    let (entry, args) = {
        // SAFETY: we arrived via reschedule, so interrupts are disabled.
        let table = unsafe { table_mut() };
        let cur = table.current;
        (
            table.slots[cur].entry.expect("thread started without an entry"),
            table.slots[cur].args,
        )
    };
    crate::arch::irq_enable();
    entry(args);
    exit(0);
}

/// Fill `tid`'s slot for a fresh thread. Interrupts must be disabled.
fn arm_slot(
    table: &mut ThreadTable,
    tid: Tid,
    name: &'static str,
    entry: ThreadEntry,
    args: [usize; 8],
    parent: Tid,
    stack: NonNull<u8>,
) {
    let parent_pid = table.slots[parent].pid;
    let slot = &mut table.slots[tid];
    *slot = ThreadSlot::empty();
    slot.state = ThreadState::Ready;
    slot.name = name;
    slot.entry = Some(entry);
    slot.args = args;
    slot.parent = parent;
    slot.pid = parent_pid;
    slot.stack = Some(stack);

    let top = stack.as_ptr() as usize + THREAD_STACK_SIZE;
    let anchor = (top - core::mem::size_of::<StackAnchor>()) as *mut StackAnchor;
    // SAFETY: the anchor lies inside the freshly allocated stack page.
    unsafe {
        (*anchor).thread = tid;
        (*anchor)._pad = 0;
    }
    slot.ctx = Context::zeroed();
    slot.ctx.ra = thread_shim as usize;
    slot.ctx.sp = anchor as usize;
}

/// Create a thread and arm it (UNINITIALIZED -> READY).
pub fn spawn(name: &'static str, entry: ThreadEntry, args: [usize; 8]) -> KernelResult<Tid> {
    with_table(|table| {
        let parent = table.current;
        let tid = (0..NTHR)
            .find(|&t| t != IDLE_TID && table.slots[t].state == ThreadState::Uninitialized)
            .ok_or(KernelError::TooManyThreads)?;
        let stack = PAGE_POOL.lock().alloc_pages(THREAD_STACK_SIZE / PAGE_SIZE);
        arm_slot(table, tid, name, entry, args, parent, stack);
        ready_enqueue(table, tid);
        Ok(tid)
    })
}

/// Give up the hart; the caller goes to the ready tail.
pub fn yield_now() {
    let was = crate::arch::irq_disable();
    {
        // SAFETY: interrupts are disabled.
        let table = unsafe { table_mut() };
        let cur = table.current;
        table.slots[cur].state = ThreadState::Ready;
        if cur != IDLE_TID {
            ready_enqueue(table, cur);
        }
        reschedule(table);
    }
    crate::arch::irq_restore(was);
}

/// Terminate the current thread. Its slot stays EXITED until the parent
/// reaps it via [`join`].
pub fn exit(code: usize) -> ! {
    let _ = crate::arch::irq_disable();
    let (cur, parent) = {
        // SAFETY: interrupts are disabled.
        let table = unsafe { table_mut() };
        let cur = table.current;
        // Exiting while holding a lock is a bug in the thread; strip the
        // locks and wake their waiters.
        let mut lock_ptr = table.slots[cur].owned_locks;
        table.slots[cur].owned_locks = core::ptr::null();
        while !lock_ptr.is_null() {
            // SAFETY: the owned list only holds locks that outlive their
            // list entry.
            let lock = unsafe { &*lock_ptr };
            log::warn!(target: "sched", "thread {} exited holding lock '{}'", cur, lock.name());
            lock_ptr = lock.force_release();
        }
        table.slots[cur].state = ThreadState::Exited;
        table.slots[cur].exit_code = code;
        (cur, table.slots[cur].parent)
    };
    CHILD_EXIT[parent].broadcast();
    {
        // SAFETY: interrupts are still disabled.
        let table = unsafe { table_mut() };
        reschedule(table);
    }
    unreachable!("exited thread {} was rescheduled", cur);
}

enum JoinScan {
    Reaped(Tid, usize),
    Waiting,
    NoChild,
}

/// Wait for a child to exit and reap it. `which == 0` waits for any child;
/// otherwise only for that specific thread. Returns the reaped tid and its
/// exit code.
pub fn join(which: Tid) -> KernelResult<(Tid, usize)> {
    loop {
        let scan = with_table(|table| {
            let cur = table.current;
            let mut found = false;
            for tid in 0..NTHR {
                if tid == cur
                    || table.slots[tid].state == ThreadState::Uninitialized
                    || table.slots[tid].parent != cur
                {
                    continue;
                }
                if which != 0 && tid != which {
                    continue;
                }
                found = true;
                if table.slots[tid].state == ThreadState::Exited {
                    let code = table.slots[tid].exit_code;
                    reap(table, tid);
                    return JoinScan::Reaped(tid, code);
                }
            }
            if found {
                JoinScan::Waiting
            } else {
                JoinScan::NoChild
            }
        });
        match scan {
            JoinScan::Reaped(tid, code) => return Ok((tid, code)),
            JoinScan::NoChild => return Err(KernelError::NoChild),
            JoinScan::Waiting => {
                let cur = current_tid();
                CHILD_EXIT[cur].wait_if(|| {
                    // SAFETY: wait_if runs the predicate with interrupts
                    // disabled.
                    let table = unsafe { table_mut() };
                    !has_exited_child(table, cur, which)
                });
            }
        }
    }
}

fn has_exited_child(table: &ThreadTable, cur: Tid, which: Tid) -> bool {
    (0..NTHR).any(|tid| {
        tid != cur
            && table.slots[tid].state == ThreadState::Exited
            && table.slots[tid].parent == cur
            && (which == 0 || tid == which)
    })
}

/// Free an EXITED thread's slot and stack; its children move to the reaper.
fn reap(table: &mut ThreadTable, tid: Tid) {
    let parent = table.slots[tid].parent;
    for t in 0..NTHR {
        if t != tid
            && table.slots[t].state != ThreadState::Uninitialized
            && table.slots[t].parent == tid
        {
            table.slots[t].parent = parent;
        }
    }
    if let Some(stack) = table.slots[tid].stack.take() {
        PAGE_POOL
            .lock()
            .free_pages(stack, THREAD_STACK_SIZE / PAGE_SIZE);
    }
    table.slots[tid] = ThreadSlot::empty();
}

/// Note a pending preemption (timer path).
pub(crate) fn request_preempt() {
    PREEMPT_PENDING.store(true, Ordering::Relaxed);
}

/// The single preemption check point: return from trap. Only a return to
/// user mode reschedules; kernel code is never preempted mid-flight.
pub fn preempt_point(from_user: bool) {
    if from_user && PREEMPT_PENDING.swap(false, Ordering::Relaxed) {
        yield_now();
    }
}

pub fn current_tid() -> Tid {
    with_table(|table| table.current)
}

pub fn current_name() -> &'static str {
    with_table(|table| table.slots[table.current].name)
}

pub fn thread_state(tid: Tid) -> ThreadState {
    with_table(|table| table.slots[tid].state)
}

/// Owning process of a thread (process glue).
pub fn thread_pid(tid: Tid) -> usize {
    with_table(|table| table.slots[tid].pid)
}

pub fn set_thread_pid(tid: Tid, pid: usize) {
    with_table(|table| table.slots[tid].pid = pid);
}

pub fn current_pid() -> usize {
    with_table(|table| table.slots[table.current].pid)
}

/// Kernel stack top of a thread (the stack anchor address); used to program
/// the trap stack before entering user mode.
pub fn kernel_stack_top(tid: Tid) -> Option<usize> {
    with_table(|table| {
        table.slots[tid]
            .stack
            .map(|base| base.as_ptr() as usize + THREAD_STACK_SIZE
                - core::mem::size_of::<StackAnchor>())
    })
}

/// The idle thread's stack is static: the thread manager comes up before
/// the page pool in the boot order.
#[repr(C, align(4096))]
struct IdleStack([u8; THREAD_STACK_SIZE]);

struct IdleStackCell(UnsafeCell<IdleStack>);

// SAFETY: only the idle thread ever runs on this stack.
unsafe impl Sync for IdleStackCell {}

static IDLE_STACK: IdleStackCell = IdleStackCell(UnsafeCell::new(IdleStack([0; THREAD_STACK_SIZE])));

/// Arm the idle thread.
pub fn init() {
    with_table(|table| {
        let stack = NonNull::new(IDLE_STACK.0.get() as *mut u8).expect("static stack is non-null");
        arm_slot(table, IDLE_TID, "idle", idle_main, [0; 8], MAIN_TID, stack);
        // The idle thread is the scheduler's fallback, never queued, never
        // reaped; its stack is not pool property.
        table.slots[IDLE_TID].stack = None;
    });
    log::info!(target: "sched", "thread manager ready, {} slots", NTHR);
}

/// Idle loop: wait for an interrupt whenever the ready list is empty. The
/// check and the wait run with interrupts disabled, which closes the race
/// against a wakeup arriving between them.
fn idle_main(_args: [usize; 8]) {
    loop {
        let was = crate::arch::irq_disable();
        let queue_empty = {
            // SAFETY: interrupts are disabled.
            unsafe { table_mut() }.ready_head.is_none()
        };
        if queue_empty {
            crate::arch::wait_for_interrupt();
        }
        crate::arch::irq_restore(was);
        yield_now();
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use alloc::vec::Vec;

    use super::*;

    #[repr(align(4096))]
    struct PageBuf([u8; PAGE_SIZE]);

    fn seed_global_pool() {
        use std::sync::Once;
        static ONCE: Once = Once::new();
        ONCE.call_once(|| {
            let buf: alloc::boxed::Box<[PageBuf]> = (0..64)
                .map(|_| PageBuf([0; PAGE_SIZE]))
                .collect::<Vec<_>>()
                .into_boxed_slice();
            let leaked = alloc::boxed::Box::leak(buf);
            // SAFETY: leaked, page-aligned, exclusively the pool's now.
            unsafe {
                PAGE_POOL
                    .lock()
                    .init(leaked.as_mut_ptr() as usize, leaked.len() * PAGE_SIZE);
            }
        });
    }

    fn ready_snapshot() -> Vec<Tid> {
        with_table(|table| {
            let mut out = Vec::new();
            let mut cur = table.ready_head;
            while let Some(tid) = cur {
                out.push(tid);
                cur = table.slots[tid].next;
            }
            out
        })
    }

    fn noop_entry(_args: [usize; 8]) {}

    // One test function: the thread table is global state.
    #[test]
    fn spawn_states_and_ready_fifo() {
        seed_global_pool();

        assert_eq!(current_tid(), MAIN_TID);
        assert_eq!(thread_state(MAIN_TID), ThreadState::Running);

        let a = spawn("worker-a", noop_entry, [1, 0, 0, 0, 0, 0, 0, 0]).unwrap();
        let b = spawn("worker-b", noop_entry, [2, 0, 0, 0, 0, 0, 0, 0]).unwrap();
        let c = spawn("worker-c", noop_entry, [3, 0, 0, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(thread_state(a), ThreadState::Ready);
        assert_eq!(ready_snapshot(), [a, b, c], "creation order is FIFO");

        // Parent linkage and pid inheritance.
        with_table(|table| {
            assert_eq!(table.slots[a].parent, MAIN_TID);
            assert_eq!(table.slots[a].pid, table.slots[MAIN_TID].pid);
        });

        // The idle slot is reserved: fill every other slot, then expect
        // too-many-threads.
        let mut spawned = alloc::vec![a, b, c];
        loop {
            match spawn("filler", noop_entry, [0; 8]) {
                Ok(tid) => {
                    assert_ne!(tid, IDLE_TID);
                    spawned.push(tid);
                }
                Err(e) => {
                    assert_eq!(e, KernelError::TooManyThreads);
                    break;
                }
            }
        }
        assert_eq!(spawned.len(), NTHR - 2, "all slots but main and idle");

        // Join on a never-exiting child of someone else: main has children,
        // but a specific non-child tid reports no-child.
        assert_eq!(join(IDLE_TID), Err(KernelError::NoChild));

        // Roll the table back so other global-state tests see a quiet
        // scheduler.
        with_table(|table| {
            for &tid in &spawned {
                reap(table, tid);
            }
            table.ready_head = None;
            table.ready_tail = None;
        });
        assert_eq!(ready_snapshot(), []);
    }
}
