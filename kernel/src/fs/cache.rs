//! Block cache.
//!
//! A fixed set of 64 entries caches 512-byte blocks of the backing device,
//! at most one entry per block number. Callers pin an entry with
//! [`BlockCache::get_block`], work directly on the in-cache buffer, and
//! unpin with [`BlockCache::release_block`], optionally marking it dirty;
//! dirty entries are written back on eviction and on [`BlockCache::flush`].
//!
//! One cache-wide ownership lock serializes metadata; it is released across
//! device I/O so readers of other blocks keep moving. Waiters share a single
//! condition and recheck their entry after every wakeup.

use core::cell::UnsafeCell;
use core::ptr::NonNull;

use alloc::{boxed::Box, sync::Arc, vec::Vec};

use crate::{
    config::{BLKSZ, BLOCK_CACHE_SLOTS},
    error::{KernelError, KernelResult},
    fs::blockdev::Storage,
    sched::{Condition, Lock, Tid},
};

struct Entry {
    /// Block number on the backing device (meaningful when valid or being
    /// loaded).
    block: u64,
    buf: Box<[u8; BLKSZ]>,
    valid: bool,
    dirty: bool,
    in_use: bool,
    owner: Option<Tid>,
    /// Last-access timestamp from the cache-wide counter.
    stamp: u64,
}

impl Entry {
    fn new() -> Self {
        Self {
            block: 0,
            buf: Box::new([0; BLKSZ]),
            valid: false,
            dirty: false,
            in_use: false,
            owner: None,
            stamp: 0,
        }
    }
}

struct CacheInner {
    entries: Vec<Entry>,
    tick: u64,
}

pub struct BlockCache {
    dev: Arc<dyn Storage>,
    /// Cache-wide ownership lock for all metadata mutation.
    lock: Lock,
    /// Shared wakeup for entry-owner changes; every waiter rechecks.
    waiters: Condition,
    inner: UnsafeCell<CacheInner>,
}

// SAFETY: the inner state is mutated only while the cache lock is held; the
// wait predicates perform read-only peeks with interrupts disabled on the
// single hart.
unsafe impl Send for BlockCache {}
// SAFETY: as above.
unsafe impl Sync for BlockCache {}

impl BlockCache {
    pub fn new(dev: Arc<dyn Storage>) -> Self {
        Self {
            dev,
            lock: Lock::new("block-cache"),
            waiters: Condition::new("block-cache"),
            inner: UnsafeCell::new(CacheInner {
                entries: (0..BLOCK_CACHE_SLOTS).map(|_| Entry::new()).collect(),
                tick: 0,
            }),
        }
    }

    pub fn device(&self) -> &Arc<dyn Storage> {
        &self.dev
    }

    /// Pin the cache entry for the block at byte position `pos` (which must
    /// be block-aligned) and return its buffer.
    ///
    /// A hit bumps the access stamp; a miss evicts a victim, writing it
    /// back if dirty, and fetches the block from the device. While another
    /// thread owns the matching entry, the caller waits. A pin the calling
    /// thread still holds from an earlier `get_block` is released first.
    pub fn get_block(&self, pos: u64) -> KernelResult<NonNull<[u8; BLKSZ]>> {
        if pos % BLKSZ as u64 != 0 {
            return Err(KernelError::InvalidArgument {
                what: "unaligned cache position",
            });
        }
        let block = pos / BLKSZ as u64;
        let me = crate::sched::current_tid();

        self.lock.acquire();
        self.auto_release(me);
        loop {
            // SAFETY: cache lock held.
            let inner = unsafe { &mut *self.inner.get() };
            if let Some(idx) = inner
                .entries
                .iter()
                .position(|e| e.block == block && (e.valid || e.in_use))
            {
                if inner.entries[idx].in_use {
                    // Another thread owns this block; sleep and rescan.
                    self.lock.release();
                    let inner_ptr = self.inner.get();
                    self.waiters.wait_if(|| {
                        // SAFETY: read-only peek with interrupts disabled.
                        let inner = unsafe { &*inner_ptr };
                        let e = &inner.entries[idx];
                        e.in_use && e.block == block
                    });
                    self.lock.acquire();
                    continue;
                }
                inner.tick += 1;
                let stamp = inner.tick;
                let entry = &mut inner.entries[idx];
                entry.in_use = true;
                entry.owner = Some(me);
                entry.stamp = stamp;
                let ptr = NonNull::from(&mut *entry.buf);
                self.lock.release();
                return Ok(ptr);
            }

            // Miss: find a victim and load.
            let Some(idx) = pick_victim(inner) else {
                self.lock.release();
                return Err(KernelError::Busy {
                    resource: "block cache",
                });
            };

            if inner.entries[idx].valid && inner.entries[idx].dirty {
                // Write the victim back before reuse, then rescan: the
                // world may have changed while the lock was dropped.
                if let Err(e) = self.writeback_locked(idx, me) {
                    self.lock.release();
                    return Err(e);
                }
                continue;
            }

            // Claim the slot and fetch outside the lock.
            {
                let entry = &mut inner.entries[idx];
                entry.valid = false;
                entry.dirty = false;
                entry.in_use = true;
                entry.owner = Some(me);
                entry.block = block;
            }
            self.lock.release();
            let mut scratch = [0u8; BLKSZ];
            let loaded = self.dev.read_block(block, &mut scratch);
            self.lock.acquire();
            // SAFETY: cache lock reacquired.
            let inner = unsafe { &mut *self.inner.get() };
            inner.tick += 1;
            let stamp = inner.tick;
            let entry = &mut inner.entries[idx];
            match loaded {
                Ok(()) => {
                    entry.buf.copy_from_slice(&scratch);
                    entry.valid = true;
                    entry.dirty = false;
                    entry.stamp = stamp;
                    let ptr = NonNull::from(&mut *entry.buf);
                    self.lock.release();
                    return Ok(ptr);
                }
                Err(_) => {
                    entry.valid = false;
                    entry.dirty = false;
                    entry.in_use = false;
                    entry.owner = None;
                    self.lock.release();
                    self.waiters.broadcast();
                    return Err(KernelError::Io {
                        device: "block cache backing device",
                    });
                }
            }
        }
    }

    /// Unpin the entry whose buffer is `ptr`, marking it dirty if the
    /// caller modified it. Wakes every waiter.
    pub fn release_block(&self, ptr: NonNull<[u8; BLKSZ]>, dirty: bool) {
        self.lock.acquire();
        {
            // SAFETY: cache lock held.
            let inner = unsafe { &mut *self.inner.get() };
            let Some(entry) = inner
                .entries
                .iter_mut()
                .find(|e| core::ptr::eq(&*e.buf, ptr.as_ptr() as *const [u8; BLKSZ]))
            else {
                panic!("release of a pointer the cache does not own");
            };
            assert!(entry.in_use, "release of an unpinned cache entry");
            entry.in_use = false;
            entry.owner = None;
            if dirty {
                entry.dirty = true;
            }
        }
        self.lock.release();
        self.waiters.broadcast();
    }

    /// Write every dirty valid entry back to the device; clean entries on
    /// success. A failed write leaves its entry dirty and the first error
    /// is reported after every entry has been attempted.
    pub fn flush(&self) -> KernelResult<()> {
        let me = crate::sched::current_tid();
        let mut result = Ok(());
        self.lock.acquire();
        for idx in 0..BLOCK_CACHE_SLOTS {
            loop {
                // SAFETY: cache lock held.
                let inner = unsafe { &mut *self.inner.get() };
                let entry = &inner.entries[idx];
                if !(entry.valid && entry.dirty) {
                    break;
                }
                if entry.in_use {
                    // Pinned by someone else; wait for the release.
                    self.lock.release();
                    let inner_ptr = self.inner.get();
                    self.waiters.wait_if(|| {
                        // SAFETY: read-only peek with interrupts disabled.
                        unsafe { &*inner_ptr }.entries[idx].in_use
                    });
                    self.lock.acquire();
                    continue;
                }
                if let Err(e) = self.writeback_locked(idx, me) {
                    result = result.and(Err(e));
                    break;
                }
            }
        }
        self.lock.release();
        result
    }

    /// Release a pin the calling thread forgot. Called with the lock held.
    fn auto_release(&self, me: Tid) {
        // SAFETY: cache lock held.
        let inner = unsafe { &mut *self.inner.get() };
        if let Some(entry) = inner
            .entries
            .iter_mut()
            .find(|e| e.in_use && e.owner == Some(me))
        {
            entry.in_use = false;
            entry.owner = None;
            self.waiters.broadcast();
        }
    }

    /// Write entry `idx` back to the device. Called with the lock held;
    /// drops it across the device write and reacquires before returning.
    /// On failure the entry stays dirty.
    fn writeback_locked(&self, idx: usize, me: Tid) -> KernelResult<()> {
        // SAFETY: cache lock held.
        let inner = unsafe { &mut *self.inner.get() };
        let entry = &mut inner.entries[idx];
        debug_assert!(entry.valid && !entry.in_use);
        entry.in_use = true;
        entry.owner = Some(me);
        let block = entry.block;
        let mut scratch = [0u8; BLKSZ];
        scratch.copy_from_slice(&*entry.buf);

        self.lock.release();
        let written = self.dev.write_block(block, &scratch);
        self.lock.acquire();

        // SAFETY: cache lock reacquired.
        let inner = unsafe { &mut *self.inner.get() };
        let entry = &mut inner.entries[idx];
        entry.in_use = false;
        entry.owner = None;
        self.waiters.broadcast();
        match written {
            Ok(()) => {
                entry.dirty = false;
                Ok(())
            }
            Err(_) => Err(KernelError::Io {
                device: "block cache backing device",
            }),
        }
    }

    /// Invariant check used by tests: owners imply pins, dirt implies
    /// validity, and no block is cached twice.
    #[cfg(test)]
    fn check_invariants(&self) {
        self.lock.acquire();
        {
            // SAFETY: cache lock held.
            let inner = unsafe { &*self.inner.get() };
            let mut seen = Vec::new();
            for e in &inner.entries {
                if e.in_use {
                    assert!(e.owner.is_some());
                }
                if !e.valid {
                    assert!(!e.dirty);
                }
                if e.valid {
                    assert!(!seen.contains(&e.block), "block {} cached twice", e.block);
                    seen.push(e.block);
                }
            }
        }
        self.lock.release();
    }
}

/// Free slot first (invalid, unpinned), otherwise the unpinned entry with
/// the oldest access stamp.
fn pick_victim(inner: &CacheInner) -> Option<usize> {
    if let Some(idx) = inner
        .entries
        .iter()
        .position(|e| !e.valid && !e.in_use)
    {
        return Some(idx);
    }
    inner
        .entries
        .iter()
        .enumerate()
        .filter(|(_, e)| e.valid && !e.in_use)
        .min_by_key(|(_, e)| e.stamp)
        .map(|(idx, _)| idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::blockdev::RamDisk;

    fn cache_over(blocks: usize) -> (Arc<RamDisk>, BlockCache) {
        let disk = Arc::new(RamDisk::new(blocks));
        let cache = BlockCache::new(disk.clone() as Arc<dyn Storage>);
        (disk, cache)
    }

    fn read_buf(ptr: NonNull<[u8; BLKSZ]>) -> [u8; BLKSZ] {
        // SAFETY: the entry is pinned by this thread for the duration.
        unsafe { *ptr.as_ptr() }
    }

    fn write_buf(ptr: NonNull<[u8; BLKSZ]>, byte: u8) {
        // SAFETY: the entry is pinned by this thread for the duration.
        unsafe { (*ptr.as_ptr()).fill(byte) };
    }

    #[test]
    fn unaligned_position_is_rejected() {
        let (_disk, cache) = cache_over(8);
        assert!(matches!(
            cache.get_block(100),
            Err(KernelError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn miss_loads_from_device_and_hit_reuses_buffer() {
        let (disk, cache) = cache_over(8);
        disk.store(2 * BLKSZ as u64, &[0x5A; BLKSZ]).unwrap();

        let ptr = cache.get_block(2 * BLKSZ as u64).unwrap();
        assert_eq!(read_buf(ptr)[0], 0x5A);
        cache.release_block(ptr, false);

        let again = cache.get_block(2 * BLKSZ as u64).unwrap();
        assert_eq!(again, ptr, "one cached copy per block");
        cache.release_block(again, false);
        cache.check_invariants();
    }

    #[test]
    fn dirty_release_and_flush_write_back() {
        let (disk, cache) = cache_over(8);
        let ptr = cache.get_block(0).unwrap();
        write_buf(ptr, 0xAB);
        cache.release_block(ptr, true);

        // Not yet on the device.
        let mut raw = [0u8; BLKSZ];
        disk.read_block(0, &mut raw).unwrap();
        assert_eq!(raw[0], 0);

        cache.flush().unwrap();
        disk.read_block(0, &mut raw).unwrap();
        assert_eq!(raw[0], 0xAB);
        cache.check_invariants();
    }

    #[test]
    fn forgotten_pin_is_auto_released() {
        let (_disk, cache) = cache_over(8);
        let first = cache.get_block(0).unwrap();
        // No release: the next get from the same thread drops the old pin.
        let second = cache.get_block(BLKSZ as u64).unwrap();
        assert_ne!(first, second);
        // The first entry can be pinned again immediately.
        let again = cache.get_block(0).unwrap();
        assert_eq!(again, first);
        cache.release_block(again, false);
        cache.check_invariants();
    }

    #[test]
    fn eviction_picks_lru_and_writes_back_dirty_victim() {
        let (disk, cache) = cache_over(BLOCK_CACHE_SLOTS * 2);

        // Dirty block 0, then fill the rest of the cache.
        let ptr = cache.get_block(0).unwrap();
        write_buf(ptr, 0xCD);
        cache.release_block(ptr, true);
        for i in 1..BLOCK_CACHE_SLOTS as u64 {
            let p = cache.get_block(i * BLKSZ as u64).unwrap();
            cache.release_block(p, false);
        }

        // One more block: block 0 is the oldest and must be evicted, with
        // its contents written back on the way out.
        let p = cache.get_block(BLOCK_CACHE_SLOTS as u64 * BLKSZ as u64).unwrap();
        cache.release_block(p, false);

        let mut raw = [0u8; BLKSZ];
        disk.read_block(0, &mut raw).unwrap();
        assert_eq!(raw[0], 0xCD, "dirty victim written back");
        cache.check_invariants();
    }

    #[test]
    #[should_panic(expected = "does not own")]
    fn releasing_foreign_pointer_is_fatal() {
        let (_disk, cache) = cache_over(4);
        let mut foreign = Box::new([0u8; BLKSZ]);
        cache.release_block(NonNull::from(&mut *foreign), false);
    }
}
