//! Memory-space lifecycle.
//!
//! A memory space is named by an opaque tag encoding the paging mode, an
//! ASID, and the root table's physical page number (the value the hardware
//! address-space register takes). The statically reserved *main* space holds
//! the boot-time global mappings and is always a safe place to stand while
//! another space is torn down.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU16, Ordering};

#[cfg(target_arch = "riscv64")]
use crate::mm::PteFlags;
use crate::{
    mm::{Mapper, PagePool, PageTable, PAGE_POOL},
    sync::OnceLock,
};

/// satp mode field for Sv39 paging.
const SATP_MODE_SV39: u64 = 8 << 60;

/// Opaque identifier of a memory space: mode | ASID | root PPN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceTag(u64);

impl SpaceTag {
    pub fn new(root: NonNull<PageTable>, asid: u16) -> Self {
        Self(SATP_MODE_SV39 | ((asid as u64) << 44) | (root.as_ptr() as u64 >> 12))
    }

    /// The raw value handed to the hardware.
    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn asid(self) -> u16 {
        ((self.0 >> 44) & 0xFFFF) as u16
    }

    pub fn root(self) -> NonNull<PageTable> {
        let phys = (self.0 & 0x0FFF_FFFF_FFFF) << 12;
        // SAFETY: tags are only constructed from live root tables, which
        // stay allocated until discard.
        unsafe { NonNull::new_unchecked(phys as *mut PageTable) }
    }
}

static MAIN_SPACE: OnceLock<SpaceTag> = OnceLock::new();
static NEXT_ASID: AtomicU16 = AtomicU16::new(1);

fn alloc_asid() -> u16 {
    NEXT_ASID.fetch_add(1, Ordering::Relaxed)
}

/// The main memory space (boot global mappings only).
pub fn main_space() -> SpaceTag {
    *MAIN_SPACE.get().expect("memory management not initialized")
}

/// The space the hardware is currently running.
pub fn active_space() -> SpaceTag {
    SpaceTag(crate::arch::satp_read())
}

/// Install `tag` as the active space.
pub fn make_active(tag: SpaceTag) {
    crate::arch::satp_write(tag.bits());
}

/// Build the main space: global gigapage identity mappings for the MMIO
/// window and for RAM (kernel image plus the page pool), then switch to it.
#[cfg(target_arch = "riscv64")]
pub fn init_main(pool: &mut PagePool) {
    let root = Mapper::new_root(pool);
    let mut mapper = Mapper::new(root, pool);
    // Low gigapage: UART, PLIC, virtio-mmio slots.
    mapper.map_gigapage(
        0,
        0,
        PteFlags::READ | PteFlags::WRITE | PteFlags::GLOBAL,
    );
    // RAM gigapage: kernel text/rodata/data and the free pool.
    mapper.map_gigapage(
        crate::mm::RAM_BASE,
        crate::mm::RAM_BASE,
        PteFlags::READ | PteFlags::WRITE | PteFlags::EXEC | PteFlags::GLOBAL,
    );
    let tag = SpaceTag::new(root, 0);
    MAIN_SPACE
        .set(tag)
        .expect("main space initialized twice");
    make_active(tag);
}

/// Host-test variant: register an empty root as the main space.
#[cfg(not(target_arch = "riscv64"))]
pub fn init_main(pool: &mut PagePool) {
    let root = Mapper::new_root(pool);
    let tag = SpaceTag::new(root, 0);
    let _ = MAIN_SPACE.set(tag);
    make_active(tag);
}

/// Copy the active space into a fresh one and return its tag.
pub fn clone_active() -> SpaceTag {
    let mut pool = PAGE_POOL.lock();
    let mut mapper = Mapper::new(active_space().root(), &mut pool);
    let new_root = mapper.clone_tree();
    SpaceTag::new(new_root, alloc_asid())
}

/// Drop every non-global mapping of the active space, keeping its root.
pub fn reset_active() {
    let mut pool = PAGE_POOL.lock();
    Mapper::new(active_space().root(), &mut pool).reset_tree();
}

/// Switch to the main space, then tear the departing space down completely.
/// The statically reserved main root is never freed.
pub fn discard_active() {
    let old = active_space();
    let main = main_space();
    make_active(main);
    if old.root() != main.root() {
        let mut pool = PAGE_POOL.lock();
        Mapper::new(old.root(), &mut pool).discard_tree();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_round_trips_root_and_asid() {
        let root = NonNull::new(0x8020_0000 as *mut PageTable).unwrap();
        let tag = SpaceTag::new(root, 42);
        assert_eq!(tag.root(), root);
        assert_eq!(tag.asid(), 42);
        assert_eq!(tag.bits() >> 60, 8);
    }

    #[test]
    fn make_active_round_trips() {
        let root = NonNull::new(0x8040_0000 as *mut PageTable).unwrap();
        let tag = SpaceTag::new(root, 7);
        make_active(tag);
        assert_eq!(active_space(), tag);
    }
}
