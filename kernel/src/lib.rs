//! Ember Kernel Library
//!
//! Core of a teaching operating-system kernel for a 64-bit RISC-V machine:
//! physical and virtual memory management, a cooperative/preemptible thread
//! kernel, a virtqueue block driver, a block cache, an on-disk file system,
//! and the uio/process/syscall glue on top.
//!
//! The crate builds for two targets:
//!
//! - `riscv64` bare metal (`target_os = "none"`): the real kernel, with the
//!   `linked_list_allocator` heap and a custom panic handler.
//! - The host: everything hardware-independent (page pool, page tables,
//!   virtqueue bookkeeping, block cache, file system, pipes) compiles against
//!   std and is exercised by the ordinary `#[test]` harness.

#![no_std]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]

extern crate alloc;

// Host target: link std so unit tests can use the standard harness and the
// system allocator.
#[cfg(not(target_os = "none"))]
extern crate std;

#[cfg(target_os = "none")]
use linked_list_allocator::LockedHeap;

#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

#[cfg(not(target_os = "none"))]
#[global_allocator]
static ALLOCATOR: std::alloc::System = std::alloc::System;

/// Get a reference to the kernel heap allocator (bare metal only).
#[cfg(target_os = "none")]
pub fn get_allocator() -> &'static LockedHeap {
    &ALLOCATOR
}

#[macro_use]
pub mod print;

pub mod arch;
pub mod config;
pub mod drivers;
pub mod error;
pub mod fs;
pub mod irq;
pub mod logger;
pub mod mm;
pub mod process;
pub mod sched;
pub mod serial;
pub mod sync;
pub mod syscall;
pub mod uio;

// Re-exports used throughout the crate and by the boot binary.
pub use config::{BLKSZ, NTHR, N_PROC, N_UIO, PAGE_SIZE};
pub use error::{KernelError, KernelResult};

/// Heap allocation error handler.
///
/// Panic is intentional: heap allocation failure in a no_std kernel is
/// unrecoverable. The alloc_error_handler ABI requires `-> !`.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("kernel heap exhausted: {:?}", layout);
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    println!("KERNEL PANIC: {}", info);
    loop {
        arch::wait_for_interrupt();
    }
}
