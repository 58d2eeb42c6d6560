//! Interrupt manager.
//!
//! A table indexed by interrupt-source number of (handler, opaque argument).
//! Enabling a source installs its row and unmasks it at the PLIC; disabling
//! clears both. External interrupts are claimed, dispatched, and completed
//! here; the timer interrupt goes straight to the alarm/preemption path.

use spin::Mutex;

use crate::{arch, config::N_IRQ_SOURCES};

/// An interrupt handler: receives the source number and its registered
/// argument.
pub type Handler = fn(source: u32, arg: usize);

#[derive(Clone, Copy)]
struct Row {
    handler: Handler,
    arg: usize,
}

static TABLE: Mutex<[Option<Row>; N_IRQ_SOURCES]> = Mutex::new([None; N_IRQ_SOURCES]);

/// Prepare the interrupt manager and unmask the hart's interrupt sources.
pub fn init() {
    #[cfg(target_arch = "riscv64")]
    {
        arch::trap::init();
        arch::enable_interrupt_sources();
    }
    log::info!(target: "irq", "interrupt manager ready, {} source slots", N_IRQ_SOURCES);
}

/// Install a handler for `source` and enable it at the controller.
pub fn enable(source: u32, priority: u32, handler: Handler, arg: usize) {
    assert!((source as usize) < N_IRQ_SOURCES, "interrupt source out of range");
    // The dispatch path locks the table from interrupt context, so rows are
    // only touched with interrupts disabled.
    let was = arch::irq_disable();
    TABLE.lock()[source as usize] = Some(Row { handler, arg });
    arch::irq_restore(was);
    arch::plic::enable(source, priority);
}

/// Mask `source` and drop its handler row.
pub fn disable(source: u32) {
    assert!((source as usize) < N_IRQ_SOURCES, "interrupt source out of range");
    arch::plic::disable(source);
    let was = arch::irq_disable();
    TABLE.lock()[source as usize] = None;
    arch::irq_restore(was);
}

/// External-interrupt path: claim, dispatch, complete, until the controller
/// runs dry.
pub fn handle_external() {
    while let Some(source) = arch::plic::claim() {
        let row = TABLE.lock().get(source as usize).copied().flatten();
        match row {
            Some(row) => (row.handler)(source, row.arg),
            None => log::warn!(target: "irq", "spurious interrupt from source {}", source),
        }
        arch::plic::complete(source);
    }
}

/// Timer path: alarms and the preemption schedule.
pub fn handle_timer() {
    crate::sched::alarm::on_tick();
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    static HITS: AtomicUsize = AtomicUsize::new(0);

    fn count_handler(_source: u32, arg: usize) {
        HITS.fetch_add(arg, Ordering::SeqCst);
    }

    #[test]
    fn enable_installs_row_and_disable_clears_it() {
        enable(5, 1, count_handler, 3);
        let row = TABLE.lock()[5];
        assert!(row.is_some());
        (row.unwrap().handler)(5, row.unwrap().arg);
        assert_eq!(HITS.load(Ordering::SeqCst), 3);
        disable(5);
        assert!(TABLE.lock()[5].is_none());
    }
}
