//! Write-once global cells.
//!
//! A no_std stand-in for `std::sync::OnceLock`, used for globals that are
//! installed exactly once during boot (main memory space, mount registry
//! entries, the registered image loader).

use core::sync::atomic::{AtomicPtr, Ordering};

/// A cell that can be written to only once.
pub struct OnceLock<T> {
    inner: AtomicPtr<T>,
}

impl<T> Default for OnceLock<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> OnceLock<T> {
    /// Create a new empty cell.
    pub const fn new() -> Self {
        Self {
            inner: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Get the value if initialized.
    pub fn get(&self) -> Option<&'static T> {
        let ptr = self.inner.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            // SAFETY: a non-null pointer was stored by `set()` from
            // `Box::into_raw`, so it refers to a live heap allocation that is
            // never freed (the cell leaks its contents by design). The
            // Acquire load pairs with the Release store in `set()`, so the
            // pointee is fully initialized before we read it.
            Some(unsafe { &*ptr })
        }
    }

    /// Initialize the cell. Returns `Err(value)` if it was already set.
    pub fn set(&self, value: T) -> Result<(), T> {
        let ptr = alloc::boxed::Box::into_raw(alloc::boxed::Box::new(value));
        match self.inner.compare_exchange(
            core::ptr::null_mut(),
            ptr,
            Ordering::Release,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(_) => {
                // SAFETY: `ptr` came from `Box::into_raw` just above and the
                // exchange failed, so nobody else took ownership; reclaiming
                // it here returns the value and avoids a leak.
                let boxed = unsafe { alloc::boxed::Box::from_raw(ptr) };
                Err(*boxed)
            }
        }
    }

    /// Get the value, initializing it from `f` if the cell is empty.
    pub fn get_or_init<F>(&self, f: F) -> &'static T
    where
        F: FnOnce() -> T,
    {
        if let Some(val) = self.get() {
            return val;
        }
        let _ = self.set(f());
        self.get().expect("OnceLock empty after set")
    }
}

// SAFETY: the inner value is behind an AtomicPtr with Acquire/Release
// ordering; ownership moves into the cell exactly once, so sending the cell
// is safe whenever T itself is Send.
unsafe impl<T: Send> Send for OnceLock<T> {}
// SAFETY: `get()` hands out shared references only after the Release store
// of a fully built T, and `set()` uses compare_exchange so at most one
// initialization wins. Shared access therefore needs T: Send + Sync.
unsafe impl<T: Send + Sync> Sync for OnceLock<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_once() {
        let cell = OnceLock::new();
        assert!(cell.get().is_none());
        assert!(cell.set(7).is_ok());
        assert_eq!(cell.set(9), Err(9));
        assert_eq!(*cell.get().unwrap(), 7);
    }

    #[test]
    fn get_or_init_runs_once() {
        let cell = OnceLock::new();
        assert_eq!(*cell.get_or_init(|| 1), 1);
        assert_eq!(*cell.get_or_init(|| 2), 1);
    }
}
