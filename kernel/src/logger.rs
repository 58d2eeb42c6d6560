//! Kernel logger.
//!
//! Installs a [`log::Log`] implementation that renders records as
//! `[LEVEL target] message` lines through the console writer. Subsystems use
//! the `log` facade macros; nothing else in the kernel prints directly except
//! the panic handler.

use log::{LevelFilter, Metadata, Record};

struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl log::Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            println!("[{:5} {}] {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Install the kernel logger. First step of the boot sequence; calling it
/// twice is harmless (the second install attempt is ignored).
pub fn init(level: LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init(LevelFilter::Info);
        init(LevelFilter::Debug);
        log::info!("logger self-test");
    }
}
