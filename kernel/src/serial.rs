//! Polled console writer.
//!
//! The UART itself is an external collaborator; the kernel consumes it as a
//! plain byte sink. On riscv64 this is the NS16550A the qemu `virt` board
//! places at `0x1000_0000`, driven by polling the line-status register. On
//! the host target the "console" is process stdout, so unit tests show
//! kernel output.

use core::fmt;

use lazy_static::lazy_static;
use spin::Mutex;

/// Byte sink behind the `print!`/`println!` macros.
pub struct Console {
    #[cfg(target_arch = "riscv64")]
    base: usize,
}

#[cfg(target_arch = "riscv64")]
mod ns16550 {
    /// Transmit holding register offset.
    pub const THR: usize = 0;
    /// Line status register offset.
    pub const LSR: usize = 5;
    /// LSR bit: transmit holding register empty.
    pub const LSR_THRE: u8 = 1 << 5;
}

impl Console {
    #[cfg(target_arch = "riscv64")]
    const fn new(base: usize) -> Self {
        Self { base }
    }

    #[cfg(not(target_arch = "riscv64"))]
    const fn new() -> Self {
        Self {}
    }

    /// Write one byte, busy-waiting until the transmitter is ready.
    #[cfg(target_arch = "riscv64")]
    pub fn put_byte(&mut self, byte: u8) {
        let thr = (self.base + ns16550::THR) as *mut u8;
        let lsr = (self.base + ns16550::LSR) as *const u8;
        // SAFETY: base points at the board's UART MMIO window, which is
        // mapped (identity, global) for the whole kernel lifetime. Volatile
        // accesses are required for device registers.
        unsafe {
            while core::ptr::read_volatile(lsr) & ns16550::LSR_THRE == 0 {
                core::hint::spin_loop();
            }
            core::ptr::write_volatile(thr, byte);
        }
    }

    #[cfg(not(target_arch = "riscv64"))]
    pub fn put_byte(&mut self, byte: u8) {
        use std::io::Write;
        let _ = std::io::stdout().write_all(&[byte]);
    }
}

impl fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.put_byte(byte);
        }
        Ok(())
    }
}

lazy_static! {
    /// The one console writer, shared by print macros and the logger.
    pub static ref CONSOLE: Mutex<Console> = {
        #[cfg(target_arch = "riscv64")]
        let console = Console::new(0x1000_0000);
        #[cfg(not(target_arch = "riscv64"))]
        let console = Console::new();
        Mutex::new(console)
    };
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use fmt::Write;
    // Interrupt handlers also log; disabling interrupts around the lock
    // keeps a tick from deadlocking against a half-written line.
    let was = crate::arch::irq_disable();
    let _ = CONSOLE.lock().write_fmt(args);
    crate::arch::irq_restore(was);
}
