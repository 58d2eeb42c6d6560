//! Supervisor trap entry and dispatch.
//!
//! The vector saves the full integer register file into a [`TrapFrame`] on
//! the kernel stack, calls [`handle_trap`], and restores. For traps taken
//! from user mode, `sscratch` holds the current thread's kernel stack top;
//! while the hart runs in kernel mode `sscratch` is zero.

use riscv::register::{
    mtvec::TrapMode,
    scause::{self, Exception, Interrupt, Trap},
    sstatus, stvec,
};

use crate::arch::TrapFrame;

core::arch::global_asm!(
    r#"
    .section .text
    .align 4
    .globl __trap_vector
__trap_vector:
    csrrw sp, sscratch, sp       # from user: sp <- kernel stack, sscratch <- user sp
    bnez  sp, 1f
    csrrw sp, sscratch, sp       # from kernel: undo the swap, keep kernel sp
1:
    addi  sp, sp, -256
    sd    x1,  0(sp)
    sd    x3,  16(sp)
    sd    x4,  24(sp)
    sd    x5,  32(sp)
    sd    x6,  40(sp)
    sd    x7,  48(sp)
    sd    x8,  56(sp)
    sd    x9,  64(sp)
    sd    x10, 72(sp)
    sd    x11, 80(sp)
    sd    x12, 88(sp)
    sd    x13, 96(sp)
    sd    x14, 104(sp)
    sd    x15, 112(sp)
    sd    x16, 120(sp)
    sd    x17, 128(sp)
    sd    x18, 136(sp)
    sd    x19, 144(sp)
    sd    x20, 152(sp)
    sd    x21, 160(sp)
    sd    x22, 168(sp)
    sd    x23, 176(sp)
    sd    x24, 184(sp)
    sd    x25, 192(sp)
    sd    x26, 200(sp)
    sd    x27, 208(sp)
    sd    x28, 216(sp)
    sd    x29, 224(sp)
    sd    x30, 232(sp)
    sd    x31, 240(sp)
    csrr  t0, sscratch
    sd    t0, 8(sp)              # x2: the interrupted stack pointer
    csrr  t0, sepc
    sd    t0, 248(sp)
    csrw  sscratch, zero         # now in kernel mode
    mv    a0, sp
    call  handle_trap
    ld    t0, 248(sp)
    csrw  sepc, t0
    ld    x1,  0(sp)
    ld    x3,  16(sp)
    ld    x4,  24(sp)
    ld    x5,  32(sp)
    ld    x6,  40(sp)
    ld    x7,  48(sp)
    ld    x8,  56(sp)
    ld    x9,  64(sp)
    ld    x10, 72(sp)
    ld    x11, 80(sp)
    ld    x12, 88(sp)
    ld    x13, 96(sp)
    ld    x14, 104(sp)
    ld    x15, 112(sp)
    ld    x16, 120(sp)
    ld    x17, 128(sp)
    ld    x18, 136(sp)
    ld    x19, 144(sp)
    ld    x20, 152(sp)
    ld    x21, 160(sp)
    ld    x22, 168(sp)
    ld    x23, 176(sp)
    ld    x24, 184(sp)
    ld    x25, 192(sp)
    ld    x26, 200(sp)
    ld    x27, 208(sp)
    ld    x28, 216(sp)
    ld    x29, 224(sp)
    ld    x30, 232(sp)
    ld    x31, 240(sp)
    ld    x2,  8(sp)             # restores the interrupted sp last
    sret
"#
);

extern "C" {
    fn __trap_vector();
}

/// Install the trap vector.
pub fn init() {
    // SAFETY: __trap_vector is 4-byte aligned and stays resident for the
    // kernel's lifetime.
    unsafe { stvec::write(__trap_vector as usize, TrapMode::Direct) };
}

/// Rust half of the trap path.
///
/// Interrupts route through the interrupt manager; exceptions from user mode
/// become syscalls or fatal faults. Returning to user mode is the single
/// preemption point.
#[no_mangle]
pub extern "C" fn handle_trap(tf: &mut TrapFrame) {
    let from_user = sstatus::read().spp() == sstatus::SPP::User;
    let cause = scause::read();

    match cause.cause() {
        Trap::Interrupt(Interrupt::SupervisorTimer) => crate::irq::handle_timer(),
        Trap::Interrupt(Interrupt::SupervisorExternal) => crate::irq::handle_external(),
        Trap::Interrupt(other) => {
            log::warn!(target: "trap", "unhandled interrupt {:?}", other);
        }
        Trap::Exception(Exception::UserEnvCall) => {
            tf.pc = tf.pc.wrapping_add(4);
            let ret = crate::syscall::dispatch(tf);
            tf.set_a0(ret as usize);
        }
        // Faults from user mode are fatal for the process; there is no
        // demand paging.
        Trap::Exception(e) if from_user => {
            log::error!(target: "trap", "user fault: {:?} at pc {:#x}", e, tf.pc);
            crate::process::fault_exit();
        }
        Trap::Exception(e) => panic!("kernel trap: {:?} at pc {:#x}", e, tf.pc),
    }

    crate::sched::preempt_point(from_user);
}
