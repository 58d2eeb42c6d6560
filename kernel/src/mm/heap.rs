//! Kernel heap bootstrap.
//!
//! Carves a fixed region out of the page pool and hands it to the
//! `linked_list_allocator` global allocator. Host builds use the system
//! allocator, so this is bare-metal only.

#[cfg(target_os = "none")]
pub fn init(pool: &mut crate::mm::PagePool) {
    use crate::config::{KERNEL_HEAP_SIZE, PAGE_SIZE};

    let region = pool.alloc_pages(KERNEL_HEAP_SIZE / PAGE_SIZE);
    // SAFETY: the region was just carved from the pool and is handed to the
    // allocator exclusively, for the kernel's lifetime.
    unsafe {
        crate::get_allocator()
            .lock()
            .init(region.as_ptr(), KERNEL_HEAP_SIZE);
    }
    log::info!(target: "mm", "kernel heap: {} KiB", KERNEL_HEAP_SIZE / 1024);
}

#[cfg(not(target_os = "none"))]
pub fn init(_pool: &mut crate::mm::PagePool) {}
