//! PLIC access.
//!
//! The interrupt manager consumes the platform-level interrupt controller
//! purely as claim/complete/enable/disable of source numbers; the register
//! layout here is the qemu `virt` SiFive PLIC, supervisor context of hart 0.

/// PLIC MMIO base on the qemu `virt` board.
const PLIC_BASE: usize = 0x0C00_0000;

/// Supervisor context number for hart 0.
const CONTEXT: usize = 1;

fn priority_reg(source: u32) -> *mut u32 {
    (PLIC_BASE + 4 * source as usize) as *mut u32
}

fn enable_reg(source: u32) -> *mut u32 {
    (PLIC_BASE + 0x2000 + 0x80 * CONTEXT + 4 * (source as usize / 32)) as *mut u32
}

fn threshold_reg() -> *mut u32 {
    (PLIC_BASE + 0x20_0000 + 0x1000 * CONTEXT) as *mut u32
}

fn claim_reg() -> *mut u32 {
    (PLIC_BASE + 0x20_0004 + 0x1000 * CONTEXT) as *mut u32
}

/// Enable an interrupt source at the given priority.
pub fn enable(source: u32, priority: u32) {
    // SAFETY: the PLIC window is identity-mapped for the kernel's lifetime;
    // volatile read-modify-write of its registers is how the controller is
    // programmed.
    unsafe {
        core::ptr::write_volatile(priority_reg(source), priority);
        let reg = enable_reg(source);
        let bits = core::ptr::read_volatile(reg) | (1 << (source % 32));
        core::ptr::write_volatile(reg, bits);
        core::ptr::write_volatile(threshold_reg(), 0);
    }
}

/// Disable an interrupt source.
pub fn disable(source: u32) {
    // SAFETY: as in `enable`.
    unsafe {
        let reg = enable_reg(source);
        let bits = core::ptr::read_volatile(reg) & !(1 << (source % 32));
        core::ptr::write_volatile(reg, bits);
    }
}

/// Claim the highest-priority pending source, if any.
pub fn claim() -> Option<u32> {
    // SAFETY: reading the claim register atomically claims the source.
    let source = unsafe { core::ptr::read_volatile(claim_reg()) };
    if source == 0 {
        None
    } else {
        Some(source)
    }
}

/// Signal completion of a claimed source.
pub fn complete(source: u32) {
    // SAFETY: writing the claimed source number back completes it.
    unsafe { core::ptr::write_volatile(claim_reg(), source) };
}
