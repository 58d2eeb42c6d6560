//! Alarms and timed sleep.
//!
//! Alarms form a single global list sorted by absolute wake time. The timer
//! compare register is always programmed to the earlier of the list head's
//! wake time and the next preemption tick; the timer interrupt fires expired
//! alarms, advances the preemption schedule, and reprograms the compare.

use core::cell::{Cell, UnsafeCell};
use core::sync::atomic::{AtomicU64, Ordering};

use super::condition::Condition;
use crate::config::PREEMPT_INTERVAL_US;

/// A pending wakeup. Lives on the sleeping thread's stack; it stays linked
/// until the timer path fires it, and the sleeper cannot return before then.
pub struct Alarm {
    wake_at_us: Cell<u64>,
    next: Cell<*const Alarm>,
    fired: Cell<bool>,
    cond: Condition,
}

// SAFETY: alarm fields are only touched with interrupts disabled on the
// single hart.
unsafe impl Send for Alarm {}
// SAFETY: as above.
unsafe impl Sync for Alarm {}

impl Alarm {
    fn new(wake_at_us: u64) -> Self {
        Self {
            wake_at_us: Cell::new(wake_at_us),
            next: Cell::new(core::ptr::null()),
            fired: Cell::new(false),
            cond: Condition::new("alarm"),
        }
    }
}

struct AlarmList(UnsafeCell<*const Alarm>);

// SAFETY: the head pointer is only touched with interrupts disabled on the
// single hart.
unsafe impl Sync for AlarmList {}

static ALARMS: AlarmList = AlarmList(UnsafeCell::new(core::ptr::null()));

/// Absolute time of the next preemption tick.
static NEXT_PREEMPT_US: AtomicU64 = AtomicU64::new(0);

/// Start the timer: schedule the first preemption tick.
pub fn init() {
    let next = crate::arch::time_us() + PREEMPT_INTERVAL_US;
    NEXT_PREEMPT_US.store(next, Ordering::Relaxed);
    crate::arch::set_timer_us(next);
    log::info!(target: "sched", "timer armed, tick every {} us", PREEMPT_INTERVAL_US);
}

/// Sleep for at least `us` microseconds. A zero duration returns without
/// blocking. Not interruptible.
pub fn sleep_us(us: u64) {
    sleep_until(crate::arch::time_us().saturating_add(us));
}

/// Sleep until the absolute time `deadline_us` has passed.
pub fn sleep_until(deadline_us: u64) {
    if crate::arch::time_us() >= deadline_us {
        return;
    }
    let alarm = Alarm::new(deadline_us);
    let was = crate::arch::irq_disable();
    insert(&alarm);
    program_timer();
    while !alarm.fired.get() {
        alarm.cond.wait_if(|| !alarm.fired.get());
    }
    crate::arch::irq_restore(was);
}

/// Insert into the sorted list. Interrupts must be disabled.
fn insert(alarm: &Alarm) {
    // SAFETY: interrupts are disabled; the list holds alarms that stay live
    // until fired (they sit on stacks of threads that cannot resume before
    // the fire).
    unsafe {
        let mut link: *mut *const Alarm = ALARMS.0.get();
        while !(*link).is_null() && (**link).wake_at_us.get() <= alarm.wake_at_us.get() {
            link = (**link).next.as_ptr();
        }
        alarm.next.set(*link);
        *link = alarm as *const Alarm;
    }
}

/// Timer interrupt path: fire due alarms, advance the preemption schedule,
/// reprogram the compare register.
pub fn on_tick() {
    let was = crate::arch::irq_disable();
    let now = crate::arch::time_us();

    if now >= NEXT_PREEMPT_US.load(Ordering::Relaxed) {
        super::request_preempt();
        NEXT_PREEMPT_US.store(now + PREEMPT_INTERVAL_US, Ordering::Relaxed);
    }

    // SAFETY: interrupts are disabled; list discipline as in `insert`.
    unsafe {
        let head: *mut *const Alarm = ALARMS.0.get();
        while !(*head).is_null() && (**head).wake_at_us.get() <= now {
            let alarm = *head;
            *head = (*alarm).next.get();
            (*alarm).next.set(core::ptr::null());
            (*alarm).fired.set(true);
            (*alarm).cond.broadcast();
        }
    }

    program_timer();
    crate::arch::irq_restore(was);
}

/// Program the compare register to the earlier of the next alarm and the
/// next preemption tick. Interrupts must be disabled.
fn program_timer() {
    // SAFETY: interrupts are disabled; head is either null or a live alarm.
    let head_wake = unsafe {
        let head = *ALARMS.0.get();
        if head.is_null() {
            u64::MAX
        } else {
            (*head).wake_at_us.get()
        }
    };
    let next = head_wake.min(NEXT_PREEMPT_US.load(Ordering::Relaxed));
    crate::arch::set_timer_us(next);
}

#[cfg(test)]
fn deadline_snapshot() -> alloc::vec::Vec<u64> {
    let was = crate::arch::irq_disable();
    let mut out = alloc::vec::Vec::new();
    // SAFETY: interrupts are disabled.
    unsafe {
        let mut cur = *ALARMS.0.get();
        while !cur.is_null() {
            out.push((*cur).wake_at_us.get());
            cur = (*cur).next.get();
        }
    }
    crate::arch::irq_restore(was);
    out
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    // One test function: the alarm list and test clock are global.
    #[test]
    fn alarm_list_ordering_and_firing() {
        init();
        let t0 = crate::arch::time_us();

        let a = Alarm::new(t0 + 500);
        let b = Alarm::new(t0 + 100);
        let c = Alarm::new(t0 + 300);
        let was = crate::arch::irq_disable();
        insert(&a);
        insert(&b);
        insert(&c);
        crate::arch::irq_restore(was);
        assert_eq!(deadline_snapshot(), [t0 + 100, t0 + 300, t0 + 500]);

        // Nothing due yet: a tick fires nothing.
        on_tick();
        assert!(!b.fired.get());

        // Advance past the first two deadlines.
        crate::arch::advance_time_us(350);
        on_tick();
        assert!(b.fired.get());
        assert!(c.fired.get());
        assert!(!a.fired.get());
        assert_eq!(deadline_snapshot(), [t0 + 500]);

        // The compare register tracks the remaining head (the preemption
        // tick is further out after the tick above).
        let deadline = crate::arch::timer_deadline_us();
        assert!(deadline <= t0 + 500 + PREEMPT_INTERVAL_US);

        crate::arch::advance_time_us(200);
        on_tick();
        assert!(a.fired.get());
        assert!(deadline_snapshot().is_empty());

        // A sleep whose deadline already passed returns without blocking.
        sleep_until(crate::arch::time_us());
        sleep_us(0);
    }
}
