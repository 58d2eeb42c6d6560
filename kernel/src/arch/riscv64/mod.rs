//! riscv64 architecture support (supervisor mode, single hart).

pub mod plic;
pub mod trap;

use riscv::register::{satp, sie, sstatus, time};

use super::TrapFrame;

/// qemu `virt` timebase: 10 MHz, so one microsecond is ten timer ticks.
const TICKS_PER_US: u64 = 10;

/// Disable supervisor interrupts, returning whether they were enabled.
pub fn irq_disable() -> bool {
    let was = sstatus::read().sie();
    // SAFETY: clearing SIE only defers interrupt delivery; it cannot break
    // memory safety.
    unsafe { sstatus::clear_sie() };
    was
}

/// Restore the interrupt-enable state saved by [`irq_disable`].
pub fn irq_restore(was_enabled: bool) {
    if was_enabled {
        // SAFETY: re-enabling interrupts that were enabled before.
        unsafe { sstatus::set_sie() };
    }
}

pub fn irq_enable() {
    // SAFETY: setting SIE enables interrupt delivery; handlers run on the
    // current thread's kernel stack.
    unsafe { sstatus::set_sie() };
}

pub fn irqs_enabled() -> bool {
    sstatus::read().sie()
}

pub fn wait_for_interrupt() {
    riscv::asm::wfi();
}

/// Monotonic microseconds since boot, from the `time` CSR (the platform's
/// real-time counter).
pub fn time_us() -> u64 {
    time::read64() / TICKS_PER_US
}

/// Program the timer compare register through the SBI TIME extension.
pub fn set_timer_us(deadline_us: u64) {
    let ticks = deadline_us.saturating_mul(TICKS_PER_US);
    // SAFETY: a plain SBI ecall (EID 0x54494D45 "TIME", FID 0); clobbers
    // only the registers named in the asm operands.
    unsafe {
        core::arch::asm!(
            "ecall",
            in("a7") 0x54494D45usize,
            in("a6") 0usize,
            inlateout("a0") ticks as usize => _,
            lateout("a1") _,
        );
    }
}

/// Enable the supervisor timer and external interrupt sources.
pub fn enable_interrupt_sources() {
    // SAFETY: setting SIE bits only allows delivery of interrupts the kernel
    // installs handlers for.
    unsafe {
        sie::set_stimer();
        sie::set_sext();
    }
}

/// Program the kernel stack used for traps taken from user mode
/// (`sscratch` holds it while the hart runs in user mode).
pub fn set_kernel_trap_sp(top: usize) {
    riscv::register::sscratch::write(top);
}

pub fn satp_read() -> u64 {
    satp::read().bits() as u64
}

pub fn satp_write(value: u64) {
    // SAFETY: callers pass a satp value built by the memory-space layer from
    // a live root table; the fence below makes the switch visible.
    unsafe {
        satp::write(value as usize);
        riscv::asm::sfence_vma_all();
    }
}

pub fn flush_tlb() {
    riscv::asm::sfence_vma_all();
}

core::arch::global_asm!(
    r#"
    .section .text
    .globl __enter_user
__enter_user:                    # a0 = &TrapFrame
    ld   t0, 248(a0)
    csrw sepc, t0
    li   t0, 1 << 8              # sstatus.SPP = 0 (return to user)
    csrc sstatus, t0
    li   t0, 1 << 5              # sstatus.SPIE = 1 (interrupts on in user)
    csrs sstatus, t0
    ld   x1,  0(a0)
    ld   x2,  8(a0)
    ld   x3,  16(a0)
    ld   x4,  24(a0)
    ld   x5,  32(a0)
    ld   x6,  40(a0)
    ld   x7,  48(a0)
    ld   x8,  56(a0)
    ld   x9,  64(a0)
    ld   x11, 80(a0)
    ld   x12, 88(a0)
    ld   x13, 96(a0)
    ld   x14, 104(a0)
    ld   x15, 112(a0)
    ld   x16, 120(a0)
    ld   x17, 128(a0)
    ld   x18, 136(a0)
    ld   x19, 144(a0)
    ld   x20, 152(a0)
    ld   x21, 160(a0)
    ld   x22, 168(a0)
    ld   x23, 176(a0)
    ld   x24, 184(a0)
    ld   x25, 192(a0)
    ld   x26, 200(a0)
    ld   x27, 208(a0)
    ld   x28, 216(a0)
    ld   x29, 224(a0)
    ld   x30, 232(a0)
    ld   x31, 240(a0)
    ld   x10, 72(a0)
    sret
"#
);

extern "C" {
    fn __enter_user(tf: *const TrapFrame) -> !;
}

/// Jump to user mode with the given register snapshot.
pub fn enter_user(tf: &TrapFrame) -> ! {
    // SAFETY: the frame is fully initialized and sepc/sstatus are set up by
    // the assembly; this never returns.
    unsafe { __enter_user(tf) }
}
