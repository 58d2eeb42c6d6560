//! Host-target shims for the architecture layer.
//!
//! These keep the portable kernel compiling on the developer machine. The
//! "interrupt flag" and "time" are plain atomics; unit tests advance the
//! clock explicitly. Privilege switching is unavailable and panics.

use core::cell::Cell;
use core::sync::atomic::{AtomicU64, Ordering};

use std::sync::{Mutex, MutexGuard, PoisonError};

use super::TrapFrame;

static CLOCK_US: AtomicU64 = AtomicU64::new(0);
static TIMER_DEADLINE_US: AtomicU64 = AtomicU64::new(u64::MAX);
static SATP: AtomicU64 = AtomicU64::new(0);

// "Interrupts disabled" on the single emulated hart: a process-wide
// reentrant lock. Code that disables interrupts gets the same exclusive
// access to shared kernel state it would have on hardware, even when the
// test harness runs on several OS threads.
static IRQ_LOCK: Mutex<()> = Mutex::new(());

std::thread_local! {
    static IRQ_GUARD: Cell<Option<MutexGuard<'static, ()>>> = const { Cell::new(None) };
    static IRQ_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Disable interrupts, returning whether they were enabled before.
pub fn irq_disable() -> bool {
    let depth = IRQ_DEPTH.with(|d| {
        let depth = d.get();
        d.set(depth + 1);
        depth
    });
    if depth == 0 {
        let guard = IRQ_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        IRQ_GUARD.with(|g| g.set(Some(guard)));
        true
    } else {
        false
    }
}

/// Restore the interrupt-enable state saved by [`irq_disable`].
pub fn irq_restore(was_enabled: bool) {
    IRQ_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    if was_enabled {
        IRQ_GUARD.with(|g| drop(g.take()));
    }
}

pub fn irq_enable() {
    IRQ_DEPTH.with(|d| d.set(0));
    IRQ_GUARD.with(|g| drop(g.take()));
}

pub fn irqs_enabled() -> bool {
    IRQ_DEPTH.with(|d| d.get() == 0)
}

pub fn wait_for_interrupt() {
    core::hint::spin_loop();
}

/// Monotonic microseconds. On the host this is the test clock.
pub fn time_us() -> u64 {
    CLOCK_US.load(Ordering::SeqCst)
}

/// Advance the test clock (test helper; there is no hardware behind it).
pub fn advance_time_us(us: u64) {
    CLOCK_US.fetch_add(us, Ordering::SeqCst);
}

/// Program the timer compare "register".
pub fn set_timer_us(deadline_us: u64) {
    TIMER_DEADLINE_US.store(deadline_us, Ordering::SeqCst);
}

/// The most recently programmed timer deadline (test helper).
pub fn timer_deadline_us() -> u64 {
    TIMER_DEADLINE_US.load(Ordering::SeqCst)
}

pub fn satp_read() -> u64 {
    SATP.load(Ordering::SeqCst)
}

pub fn satp_write(value: u64) {
    SATP.store(value, Ordering::SeqCst);
}

pub fn flush_tlb() {}

/// Jump to user mode with the given register snapshot.
pub fn enter_user(_tf: &TrapFrame) -> ! {
    panic!("user mode is not available on the host target");
}

/// Program the kernel stack used for traps taken from user mode.
pub fn set_kernel_trap_sp(_top: usize) {}

/// PLIC shims: no external interrupt controller on the host.
pub mod plic {
    pub fn enable(_source: u32, _priority: u32) {}
    pub fn disable(_source: u32) {}
    pub fn claim() -> Option<u32> {
        None
    }
    pub fn complete(_source: u32) {}
}
