//! Ember kernel boot image.
//!
//! Loaded by OpenSBI at 0x8020_0000 on the qemu `virt` board, entered in
//! supervisor mode. Boot order: console, interrupt manager, thread manager,
//! timer, memory, process manager, device attach, mount.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(all(target_os = "none", target_arch = "riscv64"))]
core::arch::global_asm!(
    r#"
    .section .text.entry
    .globl _start
_start:
    la   sp, __boot_stack_top
    call kmain
1:  wfi
    j    1b

    .section .bss
    .align 4
__boot_stack:
    .space 16384
__boot_stack_top:
"#
);

#[cfg(all(target_os = "none", target_arch = "riscv64"))]
#[no_mangle]
pub extern "C" fn kmain() -> ! {
    use ember_kernel::*;

    logger::init(log::LevelFilter::Info);
    println!("ember kernel {}", env!("CARGO_PKG_VERSION"));

    irq::init();
    sched::init();
    sched::alarm::init();
    mm::init();
    process::init();
    drivers::virtio::blk::init();
    if let Err(e) = fs::init() {
        log::error!(target: "boot", "mount failed: {}", e);
    }

    log::info!(target: "boot", "boot complete");
    arch::irq_enable();
    loop {
        arch::wait_for_interrupt();
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    println!("ember-kernel is a bare-metal image; build it for riscv64gc-unknown-none-elf");
}
