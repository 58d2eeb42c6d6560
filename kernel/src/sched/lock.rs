//! Reentrant ownership locks.
//!
//! A lock knows its owning thread and a recursion count; the same owner may
//! acquire it again. Contenders sleep on the lock's release condition (these
//! are the blocking locks used by the cache, block driver, file system, and
//! pipes). Every lock a thread owns is linked into that thread's lock list.

use core::cell::Cell;

use super::{condition::Condition, thread::Tid};

pub struct Lock {
    name: &'static str,
    owner: Cell<Option<Tid>>,
    depth: Cell<usize>,
    released: Condition,
    /// Next lock in the owning thread's lock list.
    next_owned: Cell<*const Lock>,
}

// SAFETY: all fields are only mutated with interrupts disabled on the single
// hart; the raw list pointer refers to locks that outlive their list entry
// (statics or objects kept alive by the owning subsystem).
unsafe impl Send for Lock {}
// SAFETY: as above.
unsafe impl Sync for Lock {}

impl Lock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            owner: Cell::new(None),
            depth: Cell::new(0),
            released: Condition::new(name),
            next_owned: Cell::new(core::ptr::null()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Acquire the lock, sleeping while another thread owns it. Reentrant:
    /// the owner may call this again and must release as many times.
    pub fn acquire(&self) {
        let was = crate::arch::irq_disable();
        let cur = {
            // SAFETY: interrupts are disabled, so the table is ours.
            unsafe { super::table_mut() }.current
        };
        loop {
            match self.owner.get() {
                None => {
                    self.owner.set(Some(cur));
                    self.depth.set(1);
                    // SAFETY: as above; short exclusive access to link the
                    // lock into the owner's list.
                    let table = unsafe { super::table_mut() };
                    self.next_owned.set(table.slots[cur].owned_locks);
                    table.slots[cur].owned_locks = self as *const Lock;
                    break;
                }
                Some(owner) if owner == cur => {
                    self.depth.set(self.depth.get() + 1);
                    break;
                }
                Some(_) => {
                    self.released
                        .wait_if(|| self.owner.get().is_some_and(|o| o != cur));
                }
            }
        }
        crate::arch::irq_restore(was);
    }

    /// Release one level of ownership. When the count reaches zero the owner
    /// is cleared, the lock leaves the owner's list, and contenders wake.
    ///
    /// Releasing a lock the current thread does not own is a kernel bug.
    pub fn release(&self) {
        let was = crate::arch::irq_disable();
        let cur = {
            // SAFETY: interrupts are disabled, so the table is ours.
            unsafe { super::table_mut() }.current
        };
        if self.owner.get() != Some(cur) {
            panic!("release of lock '{}' not owned by thread {}", self.name, cur);
        }
        let depth = self.depth.get() - 1;
        self.depth.set(depth);
        if depth == 0 {
            self.unlink_from(cur);
            self.owner.set(None);
            self.released.broadcast();
        }
        crate::arch::irq_restore(was);
    }

    /// Whether the calling thread currently owns this lock.
    pub fn held_by_current(&self) -> bool {
        let was = crate::arch::irq_disable();
        let cur = {
            // SAFETY: interrupts are disabled, so the table is ours.
            unsafe { super::table_mut() }.current
        };
        let held = self.owner.get() == Some(cur);
        crate::arch::irq_restore(was);
        held
    }

    /// Remove this lock from `tid`'s owned list. Interrupts must be
    /// disabled.
    fn unlink_from(&self, tid: Tid) {
        // SAFETY: interrupts are disabled; the list only contains live locks.
        let table = unsafe { super::table_mut() };
        let target = self as *const Lock;
        let mut link: *mut *const Lock = &mut table.slots[tid].owned_locks;
        // SAFETY: link pointers are derived from the slot field or a live
        // lock's next_owned cell.
        unsafe {
            while !(*link).is_null() {
                if *link == target {
                    *link = (**link).next_owned.get();
                    self.next_owned.set(core::ptr::null());
                    return;
                }
                link = (**link).next_owned.as_ptr();
            }
        }
        panic!("lock '{}' missing from owner list", self.name);
    }

    /// Strip ownership without the usual discipline (thread exit path).
    /// Returns the next lock in the owner's list.
    pub(super) fn force_release(&self) -> *const Lock {
        let next = self.next_owned.get();
        self.owner.set(None);
        self.depth.set(0);
        self.next_owned.set(core::ptr::null());
        self.released.broadcast();
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reentrant_acquire_release() {
        let lock = Lock::new("test");
        assert!(!lock.held_by_current());
        lock.acquire();
        assert!(lock.held_by_current());
        lock.acquire();
        lock.release();
        assert!(lock.held_by_current(), "still held after inner release");
        lock.release();
        assert!(!lock.held_by_current());
        // Reusable after full release.
        lock.acquire();
        lock.release();
    }

    #[test]
    #[should_panic(expected = "not owned")]
    fn release_unowned_is_fatal() {
        let lock = Lock::new("test");
        lock.release();
    }
}
