//! Compile-time kernel configuration.
//!
//! Every tunable lives here; the rest of the kernel imports these constants
//! instead of hiding magic numbers in module bodies.

/// Size of a physical page frame in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Block size of the storage stack (transport sector, cache line, and file
/// system block are all the same 512-byte unit).
pub const BLKSZ: usize = 512;

/// Number of thread slots. Thread `NTHR - 1` is the idle thread.
pub const NTHR: usize = 32;

/// Kernel stack size per thread (one page).
pub const THREAD_STACK_SIZE: usize = PAGE_SIZE;

/// Capacity of a per-process handle table.
pub const N_UIO: usize = 16;

/// Number of process slots.
pub const N_PROC: usize = 16;

/// Number of block-cache entries.
pub const BLOCK_CACHE_SLOTS: usize = 64;

/// Preemption tick interval in microseconds (10 ms).
pub const PREEMPT_INTERVAL_US: u64 = 10_000;

/// Number of interrupt source slots managed by the interrupt manager.
pub const N_IRQ_SOURCES: usize = 64;

/// Size of the kernel heap carved from the page pool at boot.
pub const KERNEL_HEAP_SIZE: usize = 1 << 20;

/// Largest single heap allocation the kernel permits itself.
pub const MAX_HEAP_ALLOC: usize = 64 * 1024;

/// Pipe ring capacity: one page, or the heap-allocation cap if smaller.
pub const PIPE_CAPACITY: usize = if PAGE_SIZE < MAX_HEAP_ALLOC {
    PAGE_SIZE
} else {
    MAX_HEAP_ALLOC
};

/// Bottom of the user-memory window.
pub const UMEM_START: usize = 0x4000_0000;

/// Top (exclusive) of the user-memory window. The page just below this is
/// the user stack.
pub const UMEM_END: usize = 0x8000_0000;

/// Maximum length of a file name in a directory entry (excluding the
/// mandatory NUL).
pub const NAME_MAX: usize = 13;
