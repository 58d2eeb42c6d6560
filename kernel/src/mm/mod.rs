//! Memory management.
//!
//! - [`page_pool`]: physical page frames as a sorted free-chunk list.
//! - [`page_table`]: the Sv39 three-level page-table engine.
//! - [`mspace`]: memory-space lifecycle (main space, clone/reset/discard).
//! - [`heap`]: kernel heap bootstrap on bare metal.

pub mod heap;
pub mod mspace;
pub mod page_pool;
pub mod page_table;

pub use page_pool::{PagePool, PAGE_POOL};
pub use page_table::{Mapper, PageTable, Pte, PteFlags};

use crate::config::PAGE_SIZE;

/// Round `value` down to a page boundary.
pub const fn page_align_down(value: usize) -> usize {
    value & !(PAGE_SIZE - 1)
}

/// Round `value` up to a page boundary.
pub const fn page_align_up(value: usize) -> usize {
    (value + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

pub const fn is_page_aligned(value: usize) -> bool {
    value % PAGE_SIZE == 0
}

/// Physical RAM size assumed for the qemu `virt` board (`-m 128M`).
#[cfg(target_arch = "riscv64")]
pub const RAM_SIZE: usize = 128 << 20;

/// Base of RAM on the qemu `virt` board.
#[cfg(target_arch = "riscv64")]
pub const RAM_BASE: usize = 0x8000_0000;

/// Initialize memory management: seed the page pool with everything between
/// the kernel image and the end of RAM, carve the kernel heap, and build the
/// main memory space with its global mappings.
#[cfg(target_arch = "riscv64")]
pub fn init() {
    extern "C" {
        static __kernel_end: u8;
    }

    // SAFETY: __kernel_end is provided by the linker script and marks the
    // first byte past the loaded image; taking its address is always valid.
    let image_end = unsafe { core::ptr::addr_of!(__kernel_end) as usize };
    let pool_start = page_align_up(image_end);
    let pool_size = RAM_BASE + RAM_SIZE - pool_start;

    {
        let mut pool = PAGE_POOL.lock();
        // SAFETY: [pool_start, RAM end) is unused RAM owned exclusively by
        // the pool from here on.
        unsafe { pool.init(pool_start, pool_size) };
        heap::init(&mut pool);
        mspace::init_main(&mut pool);
        log::info!(
            target: "mm",
            "page pool: {} free pages above {:#x}",
            pool.free_page_count(),
            pool_start
        );
    }
}
