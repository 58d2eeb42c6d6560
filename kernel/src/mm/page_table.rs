//! Sv39 page-table engine.
//!
//! Three-level tables of 512 entries. A *leaf* entry is valid with any of
//! R/W/X set; a *branch* entry is valid with none of them and points at the
//! next-level table. Global mappings (kernel image, MMIO, pool region) are
//! installed once at boot as root-level gigapage leaves and shared by every
//! memory space; user mappings are non-global and owned by their space.
//!
//! All table memory comes from the page pool, and physical addresses double
//! as kernel pointers (the kernel runs identity-mapped).

use core::ptr::NonNull;

use bitflags::bitflags;

use crate::{
    config::PAGE_SIZE,
    error::{KernelError, KernelResult},
    mm::{page_align_down, PagePool},
};

bitflags! {
    /// PTE flag bits (low ten bits of an Sv39 entry).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        const VALID    = 1 << 0;
        const READ     = 1 << 1;
        const WRITE    = 1 << 2;
        const EXEC     = 1 << 3;
        const USER     = 1 << 4;
        const GLOBAL   = 1 << 5;
        const ACCESSED = 1 << 6;
        const DIRTY    = 1 << 7;
    }
}

impl PteFlags {
    /// The access bits distinguishing a leaf from a branch.
    pub const RWX: Self = Self::READ.union(Self::WRITE).union(Self::EXEC);

    /// Bits preserved when a leaf is duplicated into a cloned space.
    const CLONE_MASK: Self = Self::RWX.union(Self::USER).union(Self::GLOBAL);
}

/// A single 64-bit page-table entry.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pte(u64);

impl Pte {
    pub const EMPTY: Self = Self(0);

    /// Build an entry pointing at `phys` with the given flags.
    pub fn new(phys: usize, flags: PteFlags) -> Self {
        debug_assert!(phys % PAGE_SIZE == 0);
        Self(((phys as u64 >> 12) << 10) | flags.bits())
    }

    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    /// Physical page number.
    pub fn ppn(self) -> u64 {
        (self.0 >> 10) & 0x0FFF_FFFF_FFFF
    }

    /// Physical address of the mapped frame or next-level table.
    pub fn phys(self) -> usize {
        (self.ppn() << 12) as usize
    }

    pub fn is_valid(self) -> bool {
        self.flags().contains(PteFlags::VALID)
    }

    /// Valid with any of R/W/X: an actual mapping.
    pub fn is_leaf(self) -> bool {
        self.is_valid() && self.flags().intersects(PteFlags::RWX)
    }

    /// Valid with none of R/W/X: a pointer to the next-level table.
    pub fn is_branch(self) -> bool {
        self.is_valid() && !self.flags().intersects(PteFlags::RWX)
    }

    pub fn is_global(self) -> bool {
        self.flags().contains(PteFlags::GLOBAL)
    }
}

/// Number of entries per table.
pub const PT_ENTRIES: usize = 512;

/// A page table: one page of 512 entries.
#[repr(C, align(4096))]
pub struct PageTable {
    pub entries: [Pte; PT_ENTRIES],
}

impl PageTable {
    pub fn zero(&mut self) {
        for entry in &mut self.entries {
            *entry = Pte::EMPTY;
        }
    }
}

/// Virtual page number for `vma` at `level` (2 = root).
fn vpn(vma: usize, level: usize) -> usize {
    (vma >> (12 + 9 * level)) & 0x1FF
}

/// A virtual address is well-formed when bits 63:38 are all zero or all one.
fn is_canonical(vma: usize) -> bool {
    let high = vma >> 38;
    high == 0 || high == (1 << 26) - 1
}

/// Page-table editor: a root table plus the pool intermediate tables and
/// backing frames come from.
pub struct Mapper<'p> {
    root: NonNull<PageTable>,
    pool: &'p mut PagePool,
}

impl<'p> Mapper<'p> {
    pub fn new(root: NonNull<PageTable>, pool: &'p mut PagePool) -> Self {
        Self { root, pool }
    }

    /// Allocate and zero a fresh root table.
    pub fn new_root(pool: &mut PagePool) -> NonNull<PageTable> {
        alloc_table(pool)
    }

    pub fn root(&self) -> NonNull<PageTable> {
        self.root
    }

    /// Walk from the root to the level-0 entry for `vma`, creating missing
    /// intermediate tables as non-global branches.
    ///
    /// Panics when a giant leaf blocks the walk: that means two callers
    /// disagree about the layout, which is a kernel bug.
    fn walk_create(&mut self, vma: usize) -> *mut Pte {
        let mut table = self.root.as_ptr();
        for level in [2, 1] {
            // SAFETY: `table` is the root (valid by construction) or a
            // branch target we just validated; tables are pool-owned pages.
            let entry = unsafe { &mut (*table).entries[vpn(vma, level)] };
            if entry.is_leaf() {
                panic!("map: giant leaf blocks walk to {:#x}", vma);
            }
            if !entry.is_valid() {
                let child = alloc_table(self.pool);
                *entry = Pte::new(child.as_ptr() as usize, PteFlags::VALID);
            }
            table = entry.phys() as *mut PageTable;
        }
        // SAFETY: as above; level-0 table reached through valid branches.
        unsafe { core::ptr::addr_of_mut!((*table).entries[vpn(vma, 0)]) }
    }

    /// Walk without creating. Returns the level-0 slot for `vma` when every
    /// branch on the way down exists (the slot itself may be empty).
    fn walk_slot(&self, vma: usize) -> Option<*mut Pte> {
        let mut table = self.root.as_ptr();
        for level in [2, 1] {
            // SAFETY: tables reached through valid branch entries only.
            let entry = unsafe { (*table).entries[vpn(vma, level)] };
            if !entry.is_valid() {
                return None;
            }
            if entry.is_leaf() {
                panic!("walk: giant leaf blocks level-0 access to {:#x}", vma);
            }
            table = entry.phys() as *mut PageTable;
        }
        // SAFETY: level-0 table reached through valid branches.
        Some(unsafe { core::ptr::addr_of_mut!((*table).entries[vpn(vma, 0)]) })
    }

    /// Walk without creating. Returns the entry holding the leaf that maps
    /// `vma`, at whatever level it is found.
    fn walk_lookup(&self, vma: usize) -> Option<Pte> {
        lookup_leaf(self.root, vma)
    }

    /// Install a 4 KiB leaf mapping `vma -> pa` with `flags | V | A | D`.
    ///
    /// A live non-global leaf already mapping this page has its backing
    /// frame freed before replacement; a branch at level 0 is a kernel bug.
    pub fn map_page(&mut self, vma: usize, pa: usize, flags: PteFlags) {
        assert!(vma % PAGE_SIZE == 0 && pa % PAGE_SIZE == 0);
        let entry_ptr = self.walk_create(vma);
        // SAFETY: walk_create returns a pointer into a live level-0 table.
        unsafe {
            let entry = *entry_ptr;
            if entry.is_valid() {
                if entry.is_branch() {
                    panic!("map: branch entry at leaf level for {:#x}", vma);
                }
                if !entry.is_global() {
                    let frame = NonNull::new_unchecked(entry.phys() as *mut u8);
                    self.pool.free_pages(frame, 1);
                }
            }
            *entry_ptr = Pte::new(
                pa,
                flags | PteFlags::VALID | PteFlags::ACCESSED | PteFlags::DIRTY,
            );
        }
        crate::arch::flush_tlb();
    }

    /// Map the range `[vma, vma + size)` onto `[pa, pa + size)`.
    pub fn map_range(&mut self, vma: usize, size: usize, pa: usize, flags: PteFlags) {
        let pages = size.div_ceil(PAGE_SIZE);
        for i in 0..pages {
            self.map_page(vma + i * PAGE_SIZE, pa + i * PAGE_SIZE, flags);
        }
    }

    /// Allocate contiguous frames for `[vma, vma + size)` and map them.
    /// Returns the first frame.
    pub fn alloc_and_map_range(&mut self, vma: usize, size: usize, flags: PteFlags) -> NonNull<u8> {
        let pages = size.div_ceil(PAGE_SIZE);
        let frames = self.pool.alloc_pages(pages);
        // SAFETY: freshly allocated frames are exclusively ours; zero them
        // so user mappings never leak prior contents.
        unsafe { core::ptr::write_bytes(frames.as_ptr(), 0, pages * PAGE_SIZE) };
        self.map_range(vma, size, frames.as_ptr() as usize, flags);
        frames
    }

    /// Install a root-level gigapage leaf (used for the boot-time global
    /// mappings of the kernel image, MMIO, and the pool region).
    pub fn map_gigapage(&mut self, vma: usize, pa: usize, flags: PteFlags) {
        const GIGA: usize = 1 << 30;
        assert!(vma % GIGA == 0 && pa % GIGA == 0);
        // SAFETY: the root table is valid by construction.
        let entry = unsafe { &mut (*self.root.as_ptr()).entries[vpn(vma, 2)] };
        assert!(!entry.is_valid(), "map_gigapage: slot occupied");
        *entry = Pte::new(
            pa,
            flags | PteFlags::VALID | PteFlags::ACCESSED | PteFlags::DIRTY,
        );
    }

    /// Rewrite the access flags of every mapped leaf in the range.
    pub fn set_range_flags(&mut self, vma: usize, size: usize, flags: PteFlags) {
        let pages = size.div_ceil(PAGE_SIZE);
        for i in 0..pages {
            let page = vma + i * PAGE_SIZE;
            let Some(entry_ptr) = self.walk_slot(page) else {
                continue;
            };
            // SAFETY: pointer into a live level-0 table.
            unsafe {
                let entry = *entry_ptr;
                if entry.is_leaf() {
                    *entry_ptr = Pte::new(
                        entry.phys(),
                        flags | PteFlags::VALID | PteFlags::ACCESSED | PteFlags::DIRTY,
                    );
                }
            }
        }
        crate::arch::flush_tlb();
    }

    /// Remove the leaf mappings of `[vma, vma + size)`, freeing each backing
    /// frame. Unmapped pages in the range are skipped.
    pub fn unmap_and_free_range(&mut self, vma: usize, size: usize) {
        let pages = size.div_ceil(PAGE_SIZE);
        for i in 0..pages {
            let page = vma + i * PAGE_SIZE;
            let Some(entry_ptr) = self.walk_slot(page) else {
                continue;
            };
            // SAFETY: entry_ptr addresses a live level-0 slot; if it holds a
            // leaf, the frame came from the pool when it was mapped.
            unsafe {
                let entry = *entry_ptr;
                if !entry.is_leaf() {
                    continue;
                }
                let frame = NonNull::new_unchecked(entry.phys() as *mut u8);
                *entry_ptr = Pte::EMPTY;
                self.pool.free_pages(frame, 1);
            }
        }
        crate::arch::flush_tlb();
    }

    /// Check that every page spanning `[vp, vp + len)` is mapped with all of
    /// `flags` set in its leaf.
    pub fn validate_vptr(&self, vp: usize, len: usize, flags: PteFlags) -> KernelResult<()> {
        validate_vptr(self.root, vp, len, flags)
    }

    /// Like [`validate_vptr`] but walks until a zero byte, checking each
    /// crossed page. Returns the string length (excluding the NUL).
    pub fn validate_vstr(&self, vs: usize, flags: PteFlags) -> KernelResult<usize> {
        validate_vstr(self.root, vs, flags)
    }

    /// Translate a virtual address to its mapped physical address.
    pub fn translate(&self, vma: usize) -> Option<usize> {
        translate(self.root, vma)
    }

    /// Deep-copy the tree into a fresh root: global entries are shared
    /// as-is, non-global branches recurse, and non-global leaves get a
    /// private copy of their backing frame.
    pub fn clone_tree(&mut self) -> NonNull<PageTable> {
        clone_table(self.root.as_ptr(), 2, self.pool)
    }

    /// Free every non-global leaf and every branch table left empty, but
    /// keep the root itself.
    pub fn reset_tree(&mut self) {
        reset_table(self.root.as_ptr(), 2, self.pool);
        crate::arch::flush_tlb();
    }

    /// Tear the tree down completely: [`reset_tree`] plus the root page.
    /// The caller must have switched to another space first.
    pub fn discard_tree(mut self) {
        self.reset_tree();
        // SAFETY: the root page came from the pool and no hardware or
        // software reference to it remains.
        unsafe {
            self.pool
                .free_pages(NonNull::new_unchecked(self.root.as_ptr() as *mut u8), 1);
        }
    }
}

/// Find the leaf entry mapping `vma` under `root`, at whatever level.
fn lookup_leaf(root: NonNull<PageTable>, vma: usize) -> Option<Pte> {
    let mut table = root.as_ptr();
    for level in [2, 1, 0] {
        // SAFETY: tables reached through valid branch entries only.
        let entry = unsafe { (*table).entries[vpn(vma, level)] };
        if !entry.is_valid() {
            return None;
        }
        if entry.is_leaf() {
            return Some(entry);
        }
        if level == 0 {
            return None;
        }
        table = entry.phys() as *mut PageTable;
    }
    None
}

/// Check that every page spanning `[vp, vp + len)` is mapped under `root`
/// with all of `flags` set in its leaf. Malformed or wrapping ranges fail
/// as invalid; anything else missing fails as no-access.
pub fn validate_vptr(
    root: NonNull<PageTable>,
    vp: usize,
    len: usize,
    flags: PteFlags,
) -> KernelResult<()> {
    if len == 0 {
        return Ok(());
    }
    let end = vp.checked_add(len - 1).ok_or(KernelError::InvalidArgument {
        what: "pointer range wraps",
    })?;
    if !is_canonical(vp) || !is_canonical(end) {
        return Err(KernelError::InvalidArgument {
            what: "malformed virtual address",
        });
    }
    let mut page = page_align_down(vp);
    loop {
        match lookup_leaf(root, page) {
            Some(leaf) if leaf.flags().contains(flags) => {}
            _ => return Err(KernelError::PermissionDenied),
        }
        if page + (PAGE_SIZE - 1) >= end {
            return Ok(());
        }
        page += PAGE_SIZE;
    }
}

/// Walk the string at `vs` until a zero byte, validating each crossed page.
/// Returns the string length (excluding the NUL).
pub fn validate_vstr(root: NonNull<PageTable>, vs: usize, flags: PteFlags) -> KernelResult<usize> {
    if !is_canonical(vs) {
        return Err(KernelError::InvalidArgument {
            what: "malformed virtual address",
        });
    }
    let mut len = 0usize;
    let mut addr = vs;
    loop {
        let leaf = match lookup_leaf(root, page_align_down(addr)) {
            Some(leaf) if leaf.flags().contains(flags) => leaf,
            _ => return Err(KernelError::PermissionDenied),
        };
        let frame = leaf.phys();
        let page_end = page_align_down(addr) + PAGE_SIZE;
        while addr < page_end {
            // SAFETY: the leaf maps this page, and physical addresses are
            // kernel-readable under the identity mapping.
            let byte = unsafe { core::ptr::read((frame + (addr % PAGE_SIZE)) as *const u8) };
            if byte == 0 {
                return Ok(len);
            }
            len += 1;
            addr += 1;
        }
        if !is_canonical(addr) {
            return Err(KernelError::InvalidArgument {
                what: "malformed virtual address",
            });
        }
    }
}

/// Translate `vma` to its mapped physical address under `root`.
pub fn translate(root: NonNull<PageTable>, vma: usize) -> Option<usize> {
    lookup_leaf(root, vma).map(|leaf| leaf.phys() + vma % PAGE_SIZE)
}

/// Allocate one zeroed page-table page.
fn alloc_table(pool: &mut PagePool) -> NonNull<PageTable> {
    let page = pool.alloc_pages(1);
    // SAFETY: freshly allocated page, exclusively ours.
    unsafe { core::ptr::write_bytes(page.as_ptr(), 0, PAGE_SIZE) };
    page.cast()
}

fn clone_table(src: *mut PageTable, level: usize, pool: &mut PagePool) -> NonNull<PageTable> {
    let dst = alloc_table(pool);
    for idx in 0..PT_ENTRIES {
        // SAFETY: src is a live table; dst was just allocated.
        let entry = unsafe { (*src).entries[idx] };
        if !entry.is_valid() {
            continue;
        }
        let new_entry = if entry.is_global() {
            // Shared: kernel image, MMIO, pool region.
            entry
        } else if entry.is_branch() {
            debug_assert!(level > 0, "branch entry at level 0");
            let child = clone_table(entry.phys() as *mut PageTable, level - 1, pool);
            Pte::new(child.as_ptr() as usize, PteFlags::VALID)
        } else {
            let frame = pool.alloc_pages(1);
            // SAFETY: both pages are live and page-sized; the source frame
            // is mapped by the entry being cloned.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    entry.phys() as *const u8,
                    frame.as_ptr(),
                    PAGE_SIZE,
                );
            }
            Pte::new(
                frame.as_ptr() as usize,
                (entry.flags() & PteFlags::CLONE_MASK)
                    | PteFlags::VALID
                    | PteFlags::ACCESSED
                    | PteFlags::DIRTY,
            )
        };
        // SAFETY: dst is exclusively ours.
        unsafe { (*dst.as_ptr()).entries[idx] = new_entry };
    }
    dst
}

/// Returns true when the table holds no valid entries afterwards.
fn reset_table(table: *mut PageTable, level: usize, pool: &mut PagePool) -> bool {
    let mut empty = true;
    for idx in 0..PT_ENTRIES {
        // SAFETY: table is live; entries are plain words.
        let entry = unsafe { (*table).entries[idx] };
        if !entry.is_valid() {
            continue;
        }
        if entry.is_global() {
            empty = false;
            continue;
        }
        if entry.is_branch() {
            let child = entry.phys() as *mut PageTable;
            if reset_table(child, level - 1, pool) {
                // SAFETY: the child table page is pool-owned and now empty.
                unsafe {
                    pool.free_pages(NonNull::new_unchecked(child as *mut u8), 1);
                    (*table).entries[idx] = Pte::EMPTY;
                }
            } else {
                empty = false;
            }
        } else {
            // SAFETY: non-global leaf; its frame is pool-owned.
            unsafe {
                pool.free_pages(NonNull::new_unchecked(entry.phys() as *mut u8), 1);
                (*table).entries[idx] = Pte::EMPTY;
            }
        }
    }
    empty
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use super::*;

    #[repr(align(4096))]
    struct PageBuf([u8; PAGE_SIZE]);

    fn backing(pages: usize) -> Vec<PageBuf> {
        (0..pages).map(|_| PageBuf([0; PAGE_SIZE])).collect()
    }

    fn pool_over(buf: &mut [PageBuf]) -> PagePool {
        let mut pool = PagePool::empty();
        // SAFETY: page-aligned test buffer, outlives the pool.
        unsafe { pool.init(buf.as_mut_ptr() as usize, buf.len() * PAGE_SIZE) };
        pool
    }

    const USER_RW: PteFlags = PteFlags::READ.union(PteFlags::WRITE).union(PteFlags::USER);
    const VMA: usize = 0x4000_0000;

    #[test]
    fn map_then_translate() {
        let mut buf = backing(32);
        let mut pool = pool_over(&mut buf);
        let root = Mapper::new_root(&mut pool);
        let mut m = Mapper::new(root, &mut pool);
        let frame = m.alloc_and_map_range(VMA, 2 * PAGE_SIZE, USER_RW);
        let base = frame.as_ptr() as usize;
        assert_eq!(m.translate(VMA + 5), Some(base + 5));
        assert_eq!(m.translate(VMA + PAGE_SIZE), Some(base + PAGE_SIZE));
        assert_eq!(m.translate(VMA + 2 * PAGE_SIZE), None);
    }

    #[test]
    fn remap_frees_previous_frame() {
        let mut buf = backing(32);
        let mut pool = pool_over(&mut buf);
        let root = Mapper::new_root(&mut pool);
        let mut m = Mapper::new(root, &mut pool);
        m.alloc_and_map_range(VMA, PAGE_SIZE, USER_RW);
        let free_before = m.pool.free_page_count();
        let other = m.pool.alloc_pages(1);
        m.map_page(VMA, other.as_ptr() as usize, USER_RW);
        // The frame the first mapping held went back to the pool, so the
        // count is unchanged net of the page we just allocated.
        assert_eq!(m.pool.free_page_count(), free_before - 1 + 1);
        assert_eq!(m.translate(VMA), Some(other.as_ptr() as usize));
    }

    #[test]
    fn unmap_returns_frames_to_pool() {
        let mut buf = backing(32);
        let mut pool = pool_over(&mut buf);
        let root = Mapper::new_root(&mut pool);
        let mut m = Mapper::new(root, &mut pool);
        let before = m.pool.free_page_count();
        m.alloc_and_map_range(VMA, 4 * PAGE_SIZE, USER_RW);
        m.unmap_and_free_range(VMA, 4 * PAGE_SIZE);
        for i in 0..4 {
            assert_eq!(m.translate(VMA + i * PAGE_SIZE), None);
        }
        // Backing frames returned; only intermediate tables remain in use.
        assert_eq!(m.pool.free_page_count(), before - 2);
    }

    #[test]
    fn validate_vptr_checks_flags_and_bounds() {
        let mut buf = backing(32);
        let mut pool = pool_over(&mut buf);
        let root = Mapper::new_root(&mut pool);
        let mut m = Mapper::new(root, &mut pool);
        m.alloc_and_map_range(VMA, 2 * PAGE_SIZE, USER_RW);

        assert!(m.validate_vptr(VMA, 2 * PAGE_SIZE, USER_RW).is_ok());
        assert!(m.validate_vptr(VMA + 100, 200, PteFlags::USER).is_ok());
        // Unmapped tail page.
        assert_eq!(
            m.validate_vptr(VMA, 3 * PAGE_SIZE, USER_RW),
            Err(KernelError::PermissionDenied)
        );
        // Flag not present in the leaf.
        assert_eq!(
            m.validate_vptr(VMA, 8, PteFlags::EXEC),
            Err(KernelError::PermissionDenied)
        );
        // Wrapping range.
        assert!(matches!(
            m.validate_vptr(usize::MAX - 4, 16, PteFlags::USER),
            Err(KernelError::InvalidArgument { .. })
        ));
        // Non-canonical address.
        assert!(matches!(
            m.validate_vptr(1 << 40, 8, PteFlags::USER),
            Err(KernelError::InvalidArgument { .. })
        ));
        // Empty range is trivially fine.
        assert!(m.validate_vptr(VMA, 0, USER_RW).is_ok());
    }

    #[test]
    fn validate_vstr_walks_to_nul() {
        let mut buf = backing(32);
        let mut pool = pool_over(&mut buf);
        let root = Mapper::new_root(&mut pool);
        let mut m = Mapper::new(root, &mut pool);
        let frame = m.alloc_and_map_range(VMA, 2 * PAGE_SIZE, USER_RW);
        // Place a string crossing the page boundary.
        let start = PAGE_SIZE - 3;
        // SAFETY: writing inside the two freshly mapped frames.
        unsafe {
            core::ptr::copy_nonoverlapping(
                b"hello\0".as_ptr(),
                frame.as_ptr().add(start),
                6,
            );
        }
        assert_eq!(m.validate_vstr(VMA + start, PteFlags::USER), Ok(5));
        assert_eq!(
            m.validate_vstr(VMA + 2 * PAGE_SIZE, PteFlags::USER),
            Err(KernelError::PermissionDenied)
        );
    }

    #[test]
    fn clone_copies_frames_and_shares_globals() {
        let mut buf = backing(64);
        let mut pool = pool_over(&mut buf);
        let root = Mapper::new_root(&mut pool);
        let mut m = Mapper::new(root, &mut pool);
        let frame = m.alloc_and_map_range(VMA, PAGE_SIZE, USER_RW);
        // SAFETY: frame is mapped and exclusively ours.
        unsafe { frame.as_ptr().write(0xAB) };

        let new_root = m.clone_tree();
        let mut c = Mapper::new(new_root, m.pool);
        let copy_pa = c.translate(VMA).unwrap();
        assert_ne!(copy_pa, frame.as_ptr() as usize, "leaf must be duplicated");
        // SAFETY: translate returned the clone's live frame.
        assert_eq!(unsafe { *(copy_pa as *const u8) }, 0xAB);

        // Writes to the copy do not show through the original.
        // SAFETY: same as above.
        unsafe { *(copy_pa as *mut u8) = 0xCD };
        // SAFETY: original frame still mapped in the source tree.
        assert_eq!(unsafe { *frame.as_ptr() }, 0xAB);
    }

    #[test]
    fn reset_keeps_root_and_frees_everything_else() {
        let mut buf = backing(64);
        let mut pool = pool_over(&mut buf);
        let root = Mapper::new_root(&mut pool);
        let baseline = pool.free_page_count();
        let mut m = Mapper::new(root, &mut pool);
        m.alloc_and_map_range(VMA, 3 * PAGE_SIZE, USER_RW);
        m.alloc_and_map_range(VMA + (1 << 21), PAGE_SIZE, USER_RW);
        m.reset_tree();
        assert_eq!(m.translate(VMA), None);
        // Every frame and intermediate table went back to the pool.
        assert_eq!(m.pool.free_page_count(), baseline);
    }

    #[test]
    fn discard_frees_the_root_too() {
        let mut buf = backing(64);
        let mut pool = pool_over(&mut buf);
        let baseline = pool.free_page_count();
        let root = Mapper::new_root(&mut pool);
        let mut m = Mapper::new(root, &mut pool);
        m.alloc_and_map_range(VMA, 2 * PAGE_SIZE, USER_RW);
        m.discard_tree();
        assert_eq!(pool.free_page_count(), baseline);
    }
}
