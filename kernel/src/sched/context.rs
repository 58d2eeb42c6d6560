//! Saved register context and the context-switch primitive.

/// Callee-saved register state of a suspended thread: return address, stack
/// pointer, and s0..s11. Caller-saved registers are dead across the switch
/// by the C ABI.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Context {
    pub ra: usize,
    pub sp: usize,
    pub s: [usize; 12],
}

impl Context {
    pub const fn zeroed() -> Self {
        Self {
            ra: 0,
            sp: 0,
            s: [0; 12],
        }
    }
}

#[cfg(target_arch = "riscv64")]
core::arch::global_asm!(
    r#"
    .section .text
    .globl __context_switch
__context_switch:                # a0 = *mut Context (old), a1 = *const Context (new)
    sd   ra, 0(a0)
    sd   sp, 8(a0)
    sd   s0, 16(a0)
    sd   s1, 24(a0)
    sd   s2, 32(a0)
    sd   s3, 40(a0)
    sd   s4, 48(a0)
    sd   s5, 56(a0)
    sd   s6, 64(a0)
    sd   s7, 72(a0)
    sd   s8, 80(a0)
    sd   s9, 88(a0)
    sd   s10, 96(a0)
    sd   s11, 104(a0)
    ld   ra, 0(a1)
    ld   sp, 8(a1)
    ld   s0, 16(a1)
    ld   s1, 24(a1)
    ld   s2, 32(a1)
    ld   s3, 40(a1)
    ld   s4, 48(a1)
    ld   s5, 56(a1)
    ld   s6, 64(a1)
    ld   s7, 72(a1)
    ld   s8, 80(a1)
    ld   s9, 88(a1)
    ld   s10, 96(a1)
    ld   s11, 104(a1)
    ret
"#
);

#[cfg(target_arch = "riscv64")]
extern "C" {
    fn __context_switch(old: *mut Context, new: *const Context);
}

/// Switch from the context at `old` (saved into) to the context at `new`
/// (restored from). Returns when the old thread is scheduled again.
///
/// # Safety
///
/// Both pointers must refer to live `Context` records; `new` must either be
/// a previously saved context or a freshly initialized one whose `ra` points
/// at a thread entry shim and whose `sp` is a valid stack top. Interrupts
/// must be disabled across the call.
#[cfg(target_arch = "riscv64")]
pub unsafe fn switch(old: *mut Context, new: *const Context) {
    // SAFETY: forwarded contract.
    unsafe { __context_switch(old, new) }
}

/// Host stub: there is no way to switch kernel stacks on the host target.
///
/// # Safety
///
/// Never actually runs; see the riscv64 version for the real contract.
#[cfg(not(target_arch = "riscv64"))]
pub unsafe fn switch(_old: *mut Context, _new: *const Context) {
    panic!("context switch is not available on the host target");
}
