//! FlatFS: the on-disk file system.
//!
//! Layout, derived deterministically from the superblock counts:
//!
//! ```text
//! [ superblock | inode bitmap | data bitmap | inode table | data blocks ]
//!   block 0
//! ```
//!
//! Inodes are fixed 32-byte records with four direct pointers, one single
//! indirect, and two double indirect pointers; every stored index is
//! relative to the start of the data region and zero means "no block". The
//! single directory (the root) is an ordinary file holding a packed array
//! of 16-byte entries.
//!
//! Mutators (create, delete, write, grow) serialize on a mount-wide lock;
//! per-handle position state has its own lock, taken inside the mount lock
//! when both are needed. All block I/O goes through the cache.

use core::cell::Cell;

use alloc::sync::Arc;

use super::{blockdev::Storage, cache::BlockCache};
use crate::{
    config::{BLKSZ, NAME_MAX},
    error::{KernelError, KernelResult},
    sched::Lock,
    uio::{CntlOp, Uio, UioHandle},
};

/// Bits per bitmap block.
const BITS_PER_BLOCK: u32 = (BLKSZ * 8) as u32;

/// 32-byte inodes, sixteen per block.
pub const INODE_SIZE: usize = 32;
pub const INODES_PER_BLOCK: usize = BLKSZ / INODE_SIZE;

/// Data-block indices per indirect block.
pub const SLOTS_PER_BLOCK: u32 = (BLKSZ / 4) as u32;

/// Direct pointers per inode.
const N_DIRECT: u32 = 4;

/// First LBN of the single-indirect region.
const INDIRECT_BASE: u32 = N_DIRECT;
/// First LBN of the double-indirect region.
const DINDIRECT_BASE: u32 = N_DIRECT + SLOTS_PER_BLOCK;
/// LBNs covered by one double-indirect tree.
const DINDIRECT_SPAN: u32 = SLOTS_PER_BLOCK * SLOTS_PER_BLOCK;

/// Hard ceiling on file size: direct + indirect + two double-indirect
/// regions, in bytes.
pub const MAX_FILE_SIZE: u64 =
    (N_DIRECT as u64 + SLOTS_PER_BLOCK as u64 + 2 * DINDIRECT_SPAN as u64) * BLKSZ as u64;

pub const DIRENT_SIZE: usize = 16;

/// On-disk superblock (block 0, little-endian, packed).
#[derive(Debug, Clone, Copy)]
pub struct Superblock {
    pub total_blocks: u32,
    pub inode_bitmap_blocks: u32,
    pub data_bitmap_blocks: u32,
    pub inode_table_blocks: u32,
    pub root_inode: u16,
}

impl Superblock {
    fn to_bytes(self) -> [u8; 18] {
        let mut out = [0u8; 18];
        out[0..4].copy_from_slice(&self.total_blocks.to_le_bytes());
        out[4..8].copy_from_slice(&self.inode_bitmap_blocks.to_le_bytes());
        out[8..12].copy_from_slice(&self.data_bitmap_blocks.to_le_bytes());
        out[12..16].copy_from_slice(&self.inode_table_blocks.to_le_bytes());
        out[16..18].copy_from_slice(&self.root_inode.to_le_bytes());
        out
    }

    fn from_bytes(raw: &[u8]) -> Self {
        let word = |at: usize| u32::from_le_bytes(raw[at..at + 4].try_into().unwrap());
        Self {
            total_blocks: word(0),
            inode_bitmap_blocks: word(4),
            data_bitmap_blocks: word(8),
            inode_table_blocks: word(12),
            root_inode: u16::from_le_bytes(raw[16..18].try_into().unwrap()),
        }
    }
}

/// In-memory inode image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Inode {
    pub size: u32,
    pub direct: [u32; 4],
    pub indirect: u32,
    pub dindirect: [u32; 2],
}

impl Inode {
    fn to_bytes(self) -> [u8; INODE_SIZE] {
        let mut out = [0u8; INODE_SIZE];
        out[0..4].copy_from_slice(&self.size.to_le_bytes());
        for (i, d) in self.direct.iter().enumerate() {
            out[4 + 4 * i..8 + 4 * i].copy_from_slice(&d.to_le_bytes());
        }
        out[20..24].copy_from_slice(&self.indirect.to_le_bytes());
        out[24..28].copy_from_slice(&self.dindirect[0].to_le_bytes());
        out[28..32].copy_from_slice(&self.dindirect[1].to_le_bytes());
        out
    }

    fn from_bytes(raw: &[u8]) -> Self {
        let word = |at: usize| u32::from_le_bytes(raw[at..at + 4].try_into().unwrap());
        Self {
            size: word(0),
            direct: [word(4), word(8), word(12), word(16)],
            indirect: word(20),
            dindirect: [word(24), word(28)],
        }
    }
}

/// A 16-byte directory entry: inode number plus NUL-terminated name.
/// Entries with inode zero are holes and are skipped on scan.
#[derive(Debug, Clone, Copy)]
struct Dirent {
    inum: u16,
    name: [u8; 14],
}

impl Dirent {
    fn new(inum: u16, name: &str) -> Self {
        let mut bytes = [0u8; 14];
        bytes[..name.len()].copy_from_slice(name.as_bytes());
        Self { inum, name: bytes }
    }

    fn to_bytes(self) -> [u8; DIRENT_SIZE] {
        let mut out = [0u8; DIRENT_SIZE];
        out[0..2].copy_from_slice(&self.inum.to_le_bytes());
        out[2..16].copy_from_slice(&self.name);
        out
    }

    fn from_bytes(raw: &[u8]) -> Self {
        let mut name = [0u8; 14];
        name.copy_from_slice(&raw[2..16]);
        Self {
            inum: u16::from_le_bytes(raw[0..2].try_into().unwrap()),
            name,
        }
    }

    fn name_len(&self) -> usize {
        self.name.iter().position(|&b| b == 0).unwrap_or(NAME_MAX)
    }

    fn name_bytes(&self) -> &[u8] {
        &self.name[..self.name_len()]
    }
}

#[derive(Debug, Clone, Copy)]
struct Layout {
    inode_bitmap_start: u32,
    data_bitmap_start: u32,
    inode_table_start: u32,
    data_start: u32,
    /// Number of inode slots backed by the table.
    ninodes: u32,
}

impl Layout {
    fn derive(sb: &Superblock) -> Self {
        let inode_bitmap_start = 1;
        let data_bitmap_start = inode_bitmap_start + sb.inode_bitmap_blocks;
        let inode_table_start = data_bitmap_start + sb.data_bitmap_blocks;
        let data_start = inode_table_start + sb.inode_table_blocks;
        Self {
            inode_bitmap_start,
            data_bitmap_start,
            inode_table_start,
            data_start,
            ninodes: sb.inode_table_blocks * INODES_PER_BLOCK as u32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BitmapKind {
    Inode,
    Data,
}

/// A mounted FlatFS volume.
pub struct FlatFs {
    cache: Arc<BlockCache>,
    /// Mount-wide lock: directory namespace, bitmaps, inode allocation.
    lock: Lock,
    sb: Superblock,
    layout: Layout,
}

impl FlatFs {
    /// Write a fresh, empty file system onto the cached device.
    pub fn format(cache: &BlockCache, total_blocks: u32, ninodes: u32) -> KernelResult<()> {
        let sb = Superblock {
            total_blocks,
            inode_bitmap_blocks: ninodes.div_ceil(BITS_PER_BLOCK),
            data_bitmap_blocks: total_blocks.div_ceil(BITS_PER_BLOCK),
            inode_table_blocks: ninodes.div_ceil(INODES_PER_BLOCK as u32),
            root_inode: 1,
        };
        let layout = Layout::derive(&sb);
        if ninodes < 2 || layout.data_start + 2 >= total_blocks {
            return Err(KernelError::InvalidArgument {
                what: "image too small to format",
            });
        }

        // Zero every metadata block.
        for blk in 0..layout.data_start {
            with_block_mut(cache, blk, |buf| buf.fill(0))?;
        }

        // Superblock.
        with_block_mut(cache, 0, |buf| {
            buf[..18].copy_from_slice(&sb.to_bytes());
        })?;

        // Inode bitmap: inode 0 is reserved (directory holes carry inode
        // zero) and inode 1 is the root directory.
        with_block_mut(cache, layout.inode_bitmap_start, |buf| {
            buf[0] = 0b11;
        })?;

        // Data bitmap: every metadata block, plus the first data-region
        // block so that relative index 0 stays free to mean "no block".
        let reserved_bits = layout.data_start as usize + 1;
        let mut bit = 0usize;
        let mut blk = layout.data_bitmap_start;
        while bit < reserved_bits {
            let in_block = (reserved_bits - bit).min(BITS_PER_BLOCK as usize);
            with_block_mut(cache, blk, |buf| {
                for b in 0..in_block {
                    buf[b / 8] |= 1 << (b % 8);
                }
            })?;
            bit += in_block;
            blk += 1;
        }

        // The root inode is the zeroed record the table already holds.
        cache.flush()
    }

    /// Mount the volume: read and validate the superblock.
    pub fn mount(cache: Arc<BlockCache>) -> KernelResult<Arc<Self>> {
        let ptr = cache.get_block(0)?;
        // SAFETY: entry pinned by this thread.
        let sb = Superblock::from_bytes(unsafe { &(&*ptr.as_ptr())[..] });
        cache.release_block(ptr, false);

        let layout = Layout::derive(&sb);
        let plausible = sb.total_blocks > 0
            && sb.inode_bitmap_blocks > 0
            && sb.data_bitmap_blocks > 0
            && sb.inode_table_blocks > 0
            && layout.data_start < sb.total_blocks
            && sb.root_inode != 0
            && (sb.root_inode as u32) < layout.ninodes
            && sb.total_blocks as u64 * BLKSZ as u64 <= cache.device().capacity_bytes();
        if !plausible {
            return Err(KernelError::BadFormat {
                what: "superblock counts",
            });
        }
        log::info!(
            target: "flatfs",
            "mounted: {} blocks, {} inodes, data region at block {}",
            sb.total_blocks,
            layout.ninodes,
            layout.data_start
        );
        Ok(Arc::new(Self {
            cache,
            lock: Lock::new("flatfs-mount"),
            sb,
            layout,
        }))
    }

    pub fn cache(&self) -> &Arc<BlockCache> {
        &self.cache
    }

    /// Flush every dirty cache block to the device.
    pub fn sync(&self) -> KernelResult<()> {
        self.cache.flush()
    }

    // --- bitmaps ------------------------------------------------------

    fn bitmap_geometry(&self, kind: BitmapKind) -> (u32, u32, u32) {
        match kind {
            // (start block, first allowed bit, bit limit)
            BitmapKind::Inode => (self.layout.inode_bitmap_start, 1, self.layout.ninodes),
            BitmapKind::Data => (
                self.layout.data_bitmap_start,
                self.layout.data_start,
                self.sb.total_blocks,
            ),
        }
    }

    /// First-free-bit allocation. The leading partial byte is handled by
    /// starting the scan at the first allowed bit; the trailing one by the
    /// bit limit.
    fn bitmap_alloc(&self, kind: BitmapKind) -> KernelResult<u32> {
        let (start_block, first_allowed, limit) = self.bitmap_geometry(kind);
        let mut bit = first_allowed;
        while bit < limit {
            let blk = bit / BITS_PER_BLOCK;
            let block_end = ((blk + 1) * BITS_PER_BLOCK).min(limit);
            let ptr = self.cache.get_block((start_block + blk) as u64 * BLKSZ as u64)?;
            // SAFETY: entry pinned by this thread.
            let buf = unsafe { &mut *ptr.as_ptr() };
            let mut claimed = None;
            let mut b = bit;
            while b < block_end {
                let byte = &mut buf[((b % BITS_PER_BLOCK) / 8) as usize];
                if *byte == 0xFF {
                    // Whole byte allocated: skip to the next one.
                    b = (b / 8 + 1) * 8;
                    continue;
                }
                if *byte & (1 << (b % 8)) == 0 {
                    *byte |= 1 << (b % 8);
                    claimed = Some(b);
                    break;
                }
                b += 1;
            }
            match claimed {
                Some(won) => {
                    self.cache.release_block(ptr, true);
                    return Ok(won);
                }
                None => {
                    self.cache.release_block(ptr, false);
                    bit = block_end;
                }
            }
        }
        Err(match kind {
            BitmapKind::Inode => KernelError::TooManyFiles,
            BitmapKind::Data => KernelError::OutOfMemory { requested: BLKSZ },
        })
    }

    fn bitmap_clear(&self, kind: BitmapKind, bit: u32) -> KernelResult<()> {
        let (start_block, _, limit) = self.bitmap_geometry(kind);
        assert!(bit < limit, "bitmap bit out of range");
        let blk = bit / BITS_PER_BLOCK;
        with_block_mut(&self.cache, start_block + blk, |buf| {
            let byte = &mut buf[((bit % BITS_PER_BLOCK) / 8) as usize];
            debug_assert!(*byte & (1 << (bit % 8)) != 0, "freeing a free bit");
            *byte &= !(1 << (bit % 8));
        })
    }

    #[cfg(test)]
    fn bitmap_test(&self, kind: BitmapKind, bit: u32) -> bool {
        let (start_block, _, _) = self.bitmap_geometry(kind);
        let blk = bit / BITS_PER_BLOCK;
        let mut set = false;
        with_block(&self.cache, start_block + blk, |buf| {
            set = buf[((bit % BITS_PER_BLOCK) / 8) as usize] & (1 << (bit % 8)) != 0;
        })
        .unwrap();
        set
    }

    // --- data blocks --------------------------------------------------

    /// Absolute device block of a relative data index.
    fn data_abs(&self, rel: u32) -> u32 {
        debug_assert!(rel != 0, "relative index 0 is the hole marker");
        self.layout.data_start + rel
    }

    /// Allocate and zero a data block; returns its relative index (>= 1 by
    /// construction, since the first data-region bit is reserved at format
    /// time).
    fn alloc_data_block(&self) -> KernelResult<u32> {
        let abs = self.bitmap_alloc(BitmapKind::Data)?;
        let rel = abs - self.layout.data_start;
        debug_assert!(rel >= 1);
        with_block_mut(&self.cache, abs, |buf| buf.fill(0))?;
        Ok(rel)
    }

    fn free_data_block(&self, rel: u32) -> KernelResult<()> {
        self.bitmap_clear(BitmapKind::Data, self.data_abs(rel))
    }

    /// Read one u32 slot of an indirect block.
    fn read_slot(&self, rel_block: u32, idx: u32) -> KernelResult<u32> {
        let mut value = 0;
        with_block(&self.cache, self.data_abs(rel_block), |buf| {
            let at = idx as usize * 4;
            value = u32::from_le_bytes(buf[at..at + 4].try_into().unwrap());
        })?;
        Ok(value)
    }

    fn write_slot(&self, rel_block: u32, idx: u32, value: u32) -> KernelResult<()> {
        with_block_mut(&self.cache, self.data_abs(rel_block), |buf| {
            let at = idx as usize * 4;
            buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
        })
    }

    // --- inodes -------------------------------------------------------

    fn read_inode(&self, inum: u16) -> KernelResult<Inode> {
        assert!((inum as u32) < self.layout.ninodes);
        let blk = self.layout.inode_table_start + inum as u32 / INODES_PER_BLOCK as u32;
        let at = (inum as usize % INODES_PER_BLOCK) * INODE_SIZE;
        let mut ino = Inode::default();
        with_block(&self.cache, blk, |buf| {
            ino = Inode::from_bytes(&buf[at..at + INODE_SIZE]);
        })?;
        Ok(ino)
    }

    fn write_inode(&self, inum: u16, ino: &Inode) -> KernelResult<()> {
        assert!((inum as u32) < self.layout.ninodes);
        let blk = self.layout.inode_table_start + inum as u32 / INODES_PER_BLOCK as u32;
        let at = (inum as usize % INODES_PER_BLOCK) * INODE_SIZE;
        with_block_mut(&self.cache, blk, |buf| {
            buf[at..at + INODE_SIZE].copy_from_slice(&ino.to_bytes());
        })
    }

    // --- block mapping ------------------------------------------------

    /// Map a logical block number to its relative data block. With `alloc`
    /// false, holes come back as `None`; with `alloc` true, the data block
    /// and any missing indirection level are allocated and zeroed, and the
    /// caller must persist the (possibly modified) inode.
    fn bmap(&self, ino: &mut Inode, lbn: u32, alloc: bool) -> KernelResult<Option<u32>> {
        if lbn < INDIRECT_BASE {
            let slot = &mut ino.direct[lbn as usize];
            if *slot == 0 {
                if !alloc {
                    return Ok(None);
                }
                *slot = self.alloc_data_block()?;
            }
            return Ok(Some(*slot));
        }

        if lbn < DINDIRECT_BASE {
            if ino.indirect == 0 {
                if !alloc {
                    return Ok(None);
                }
                ino.indirect = self.alloc_data_block()?;
            }
            let idx = lbn - INDIRECT_BASE;
            let mut rel = self.read_slot(ino.indirect, idx)?;
            if rel == 0 {
                if !alloc {
                    return Ok(None);
                }
                rel = self.alloc_data_block()?;
                self.write_slot(ino.indirect, idx, rel)?;
            }
            return Ok(Some(rel));
        }

        let rest = lbn - DINDIRECT_BASE;
        let which = rest / DINDIRECT_SPAN;
        if which >= 2 {
            return Err(KernelError::InvalidArgument {
                what: "block number beyond maximum file size",
            });
        }
        let outer = (rest % DINDIRECT_SPAN) / SLOTS_PER_BLOCK;
        let inner = rest % SLOTS_PER_BLOCK;

        let top = &mut ino.dindirect[which as usize];
        if *top == 0 {
            if !alloc {
                return Ok(None);
            }
            *top = self.alloc_data_block()?;
        }
        let mut mid = self.read_slot(*top, outer)?;
        if mid == 0 {
            if !alloc {
                return Ok(None);
            }
            mid = self.alloc_data_block()?;
            self.write_slot(*top, outer, mid)?;
        }
        let mut rel = self.read_slot(mid, inner)?;
        if rel == 0 {
            if !alloc {
                return Ok(None);
            }
            rel = self.alloc_data_block()?;
            self.write_slot(mid, inner, rel)?;
        }
        Ok(Some(rel))
    }

    // --- byte-level file I/O ------------------------------------------

    /// Read file bytes at `pos`, clamped to the file size. Holes read as
    /// zeros without allocating.
    fn read_inode_data(&self, ino: &Inode, pos: u64, buf: &mut [u8]) -> KernelResult<usize> {
        let size = ino.size as u64;
        if pos >= size || buf.is_empty() {
            return Ok(0);
        }
        let len = buf.len().min((size - pos) as usize);
        let mut scratch = *ino;
        let mut done = 0;
        while done < len {
            let at = pos + done as u64;
            let lbn = (at / BLKSZ as u64) as u32;
            let offset = (at % BLKSZ as u64) as usize;
            let chunk = (BLKSZ - offset).min(len - done);
            match self.bmap(&mut scratch, lbn, false)? {
                Some(rel) => {
                    with_block(&self.cache, self.data_abs(rel), |blk| {
                        buf[done..done + chunk].copy_from_slice(&blk[offset..offset + chunk]);
                    })?;
                }
                None => buf[done..done + chunk].fill(0),
            }
            done += chunk;
        }
        Ok(done)
    }

    /// Write file bytes at `pos`, clamped to the maximum file size, growing
    /// the file (and allocating every touched block) as needed. The caller
    /// persists the inode.
    fn write_inode_data(&self, ino: &mut Inode, pos: u64, buf: &[u8]) -> KernelResult<usize> {
        if pos >= MAX_FILE_SIZE || buf.is_empty() {
            return Ok(0);
        }
        let len = buf.len().min((MAX_FILE_SIZE - pos) as usize);
        let mut done = 0;
        while done < len {
            let at = pos + done as u64;
            let lbn = (at / BLKSZ as u64) as u32;
            let offset = (at % BLKSZ as u64) as usize;
            let chunk = (BLKSZ - offset).min(len - done);
            let rel = self
                .bmap(ino, lbn, true)?
                .expect("allocating bmap returned a hole");
            with_block_mut(&self.cache, self.data_abs(rel), |blk| {
                blk[offset..offset + chunk].copy_from_slice(&buf[done..done + chunk]);
            })?;
            done += chunk;
        }
        let end = pos + done as u64;
        if end > ino.size as u64 {
            ino.size = end as u32;
        }
        Ok(done)
    }

    // --- directory ----------------------------------------------------

    fn dir_entry(&self, root: &Inode, idx: u32) -> KernelResult<Dirent> {
        let mut raw = [0u8; DIRENT_SIZE];
        let n = self.read_inode_data(root, idx as u64 * DIRENT_SIZE as u64, &mut raw)?;
        if n != DIRENT_SIZE {
            return Err(KernelError::BadFormat {
                what: "truncated directory entry",
            });
        }
        Ok(Dirent::from_bytes(&raw))
    }

    /// Case-sensitive linear scan; holes (inode 0) are skipped.
    fn dir_find(&self, root: &Inode, name: &str) -> KernelResult<Option<(u32, u16)>> {
        let count = root.size / DIRENT_SIZE as u32;
        for idx in 0..count {
            let entry = self.dir_entry(root, idx)?;
            if entry.inum != 0 && entry.name_bytes() == name.as_bytes() {
                return Ok(Some((idx, entry.inum)));
            }
        }
        Ok(None)
    }

    fn check_name(name: &str) -> KernelResult<()> {
        if name.is_empty() || name.len() > NAME_MAX || name.bytes().any(|b| b == 0 || b == b'/') {
            return Err(KernelError::InvalidArgument {
                what: "file name",
            });
        }
        Ok(())
    }

    // --- public file API ----------------------------------------------

    /// Create an empty file. Serialized by the mount lock; duplicate names
    /// are rejected.
    pub fn create(&self, name: &str) -> KernelResult<()> {
        Self::check_name(name)?;
        self.lock.acquire();
        let result = self.create_locked(name);
        self.lock.release();
        result
    }

    fn create_locked(&self, name: &str) -> KernelResult<()> {
        let mut root = self.read_inode(self.sb.root_inode)?;
        if self.dir_find(&root, name)?.is_some() {
            return Err(KernelError::AlreadyExists);
        }
        let inum = self.bitmap_alloc(BitmapKind::Inode)? as u16;
        self.write_inode(inum, &Inode::default())?;

        // Append the entry; a full directory block grows the root file.
        let entry = Dirent::new(inum, name);
        let at = root.size as u64;
        let written = self.write_inode_data(&mut root, at, &entry.to_bytes())?;
        if written != DIRENT_SIZE {
            // Roll the inode bit back; the directory is unchanged.
            self.bitmap_clear(BitmapKind::Inode, inum as u32)?;
            return Err(KernelError::Io {
                device: "directory append",
            });
        }
        self.write_inode(self.sb.root_inode, &root)?;
        log::debug!(target: "flatfs", "created '{}' as inode {}", name, inum);
        Ok(())
    }

    /// Delete a file: free every data block it references, clear its inode,
    /// and compact the directory by swapping the last entry into the hole.
    pub fn delete(&self, name: &str) -> KernelResult<()> {
        Self::check_name(name)?;
        self.lock.acquire();
        let result = self.delete_locked(name);
        self.lock.release();
        result
    }

    fn delete_locked(&self, name: &str) -> KernelResult<()> {
        let mut root = self.read_inode(self.sb.root_inode)?;
        let Some((idx, inum)) = self.dir_find(&root, name)? else {
            return Err(KernelError::NoEntry);
        };

        let ino = self.read_inode(inum)?;
        self.free_inode_blocks(&ino)?;
        self.write_inode(inum, &Inode::default())?;
        self.bitmap_clear(BitmapKind::Inode, inum as u32)?;

        // Swap the last entry into the victim's slot and shrink.
        let count = root.size / DIRENT_SIZE as u32;
        let last = count - 1;
        if idx != last {
            let tail = self.dir_entry(&root, last)?;
            self.write_inode_data(&mut root, idx as u64 * DIRENT_SIZE as u64, &tail.to_bytes())?;
        }
        root.size -= DIRENT_SIZE as u32;
        self.write_inode(self.sb.root_inode, &root)?;
        log::debug!(target: "flatfs", "deleted '{}' (inode {})", name, inum);
        Ok(())
    }

    fn free_inode_blocks(&self, ino: &Inode) -> KernelResult<()> {
        for &rel in &ino.direct {
            if rel != 0 {
                self.free_data_block(rel)?;
            }
        }
        if ino.indirect != 0 {
            self.free_tree(ino.indirect, 1)?;
        }
        for &top in &ino.dindirect {
            if top != 0 {
                self.free_tree(top, 2)?;
            }
        }
        Ok(())
    }

    /// Free an indirection tree of the given depth (1 = table of data
    /// blocks, 2 = table of tables), then the table block itself.
    fn free_tree(&self, rel: u32, depth: u8) -> KernelResult<()> {
        for idx in 0..SLOTS_PER_BLOCK {
            let slot = self.read_slot(rel, idx)?;
            if slot == 0 {
                continue;
            }
            if depth > 1 {
                self.free_tree(slot, depth - 1)?;
            } else {
                self.free_data_block(slot)?;
            }
        }
        self.free_data_block(rel)
    }

    /// Open a handle. The empty name (or "/") opens a listing handle over
    /// the root directory; anything else is a case-sensitive file lookup.
    pub fn open(self: &Arc<Self>, name: &str) -> KernelResult<UioHandle> {
        if name.is_empty() || name == "/" {
            return Ok(Arc::new(DirListHandle {
                fs: self.clone(),
                lock: Lock::new("flatfs-listing"),
                cursor: Cell::new(0),
            }));
        }
        Self::check_name(name)?;
        self.lock.acquire();
        let root = match self.read_inode(self.sb.root_inode) {
            Ok(root) => root,
            Err(e) => {
                self.lock.release();
                return Err(e);
            }
        };
        let found = self.dir_find(&root, name);
        self.lock.release();
        match found? {
            Some((_, inum)) => Ok(Arc::new(FileHandle {
                fs: self.clone(),
                inum,
                lock: Lock::new("flatfs-handle"),
                pos: Cell::new(0),
            })),
            None => Err(KernelError::NoEntry),
        }
    }

    #[cfg(test)]
    fn free_data_bits(&self) -> u32 {
        let (_, first, limit) = self.bitmap_geometry(BitmapKind::Data);
        (first..limit)
            .filter(|&b| !self.bitmap_test(BitmapKind::Data, b))
            .count() as u32
    }
}

/// Run `f` over a pinned cache block, releasing it clean.
fn with_block(cache: &BlockCache, block: u32, f: impl FnOnce(&[u8; BLKSZ])) -> KernelResult<()> {
    let ptr = cache.get_block(block as u64 * BLKSZ as u64)?;
    // SAFETY: entry pinned by this thread until the release below.
    f(unsafe { &*ptr.as_ptr() });
    cache.release_block(ptr, false);
    Ok(())
}

/// Run `f` over a pinned cache block, releasing it dirty.
fn with_block_mut(
    cache: &BlockCache,
    block: u32,
    f: impl FnOnce(&mut [u8; BLKSZ]),
) -> KernelResult<()> {
    let ptr = cache.get_block(block as u64 * BLKSZ as u64)?;
    // SAFETY: entry pinned by this thread until the release below.
    f(unsafe { &mut *ptr.as_ptr() });
    cache.release_block(ptr, true);
    Ok(())
}

/// An open file: shared volume, inode number, and a position under its own
/// lock (taken inside the mount lock when both are involved).
struct FileHandle {
    fs: Arc<FlatFs>,
    inum: u16,
    lock: Lock,
    pos: Cell<u64>,
}

// SAFETY: the position cell is only touched under the handle lock.
unsafe impl Send for FileHandle {}
// SAFETY: as above.
unsafe impl Sync for FileHandle {}

impl Uio for FileHandle {
    fn read(&self, buf: &mut [u8]) -> KernelResult<usize> {
        self.lock.acquire();
        let result = (|| {
            let ino = self.fs.read_inode(self.inum)?;
            let n = self.fs.read_inode_data(&ino, self.pos.get(), buf)?;
            self.pos.set(self.pos.get() + n as u64);
            Ok(n)
        })();
        self.lock.release();
        result
    }

    fn write(&self, buf: &[u8]) -> KernelResult<usize> {
        self.fs.lock.acquire();
        self.lock.acquire();
        let result = (|| {
            let mut ino = self.fs.read_inode(self.inum)?;
            let n = self.fs.write_inode_data(&mut ino, self.pos.get(), buf)?;
            self.fs.write_inode(self.inum, &ino)?;
            self.pos.set(self.pos.get() + n as u64);
            Ok(n)
        })();
        self.lock.release();
        self.fs.lock.release();
        result
    }

    fn cntl(&self, op: CntlOp) -> KernelResult<u64> {
        match op {
            CntlOp::GetEnd => {
                self.lock.acquire();
                let size = self.fs.read_inode(self.inum).map(|ino| ino.size as u64);
                self.lock.release();
                size
            }
            CntlOp::SetEnd(new_size) => {
                self.fs.lock.acquire();
                self.lock.acquire();
                let result = self.grow_to(new_size);
                self.lock.release();
                self.fs.lock.release();
                result
            }
            CntlOp::GetPos => Ok(self.with_pos(|pos| pos)),
            CntlOp::SetPos(new_pos) => {
                if new_pos > MAX_FILE_SIZE {
                    return Err(KernelError::InvalidArgument {
                        what: "position beyond maximum file size",
                    });
                }
                self.lock.acquire();
                self.pos.set(new_pos);
                self.lock.release();
                Ok(new_pos)
            }
        }
    }
}

impl FileHandle {
    fn with_pos<R>(&self, f: impl FnOnce(u64) -> R) -> R {
        self.lock.acquire();
        let r = f(self.pos.get());
        self.lock.release();
        r
    }

    /// set-end: grow only, allocating (zeroed) intermediate blocks.
    fn grow_to(&self, new_size: u64) -> KernelResult<u64> {
        if new_size > MAX_FILE_SIZE {
            return Err(KernelError::InvalidArgument {
                what: "size beyond maximum file size",
            });
        }
        let mut ino = self.fs.read_inode(self.inum)?;
        if new_size < ino.size as u64 {
            return Err(KernelError::InvalidArgument {
                what: "set-end cannot shrink a file",
            });
        }
        if new_size > ino.size as u64 {
            let first = ino.size as u64 / BLKSZ as u64;
            let last = (new_size - 1) / BLKSZ as u64;
            for lbn in first..=last {
                self.fs.bmap(&mut ino, lbn as u32, true)?;
            }
            ino.size = new_size as u32;
            self.fs.write_inode(self.inum, &ino)?;
        }
        Ok(new_size)
    }
}

/// Listing handle returned for the empty name: each read yields the next
/// entry name as a NUL-terminated string, and 0 signals the end.
struct DirListHandle {
    fs: Arc<FlatFs>,
    lock: Lock,
    cursor: Cell<u32>,
}

// SAFETY: the cursor cell is only touched under the handle lock.
unsafe impl Send for DirListHandle {}
// SAFETY: as above.
unsafe impl Sync for DirListHandle {}

impl Uio for DirListHandle {
    fn read(&self, buf: &mut [u8]) -> KernelResult<usize> {
        self.lock.acquire();
        let result = (|| {
            let root = self.fs.read_inode(self.fs.sb.root_inode)?;
            let count = root.size / DIRENT_SIZE as u32;
            loop {
                let idx = self.cursor.get();
                if idx >= count {
                    return Ok(0);
                }
                self.cursor.set(idx + 1);
                let entry = self.fs.dir_entry(&root, idx)?;
                if entry.inum == 0 {
                    continue;
                }
                let name = entry.name_bytes();
                if buf.len() < name.len() + 1 {
                    return Err(KernelError::InvalidArgument {
                        what: "listing buffer too small",
                    });
                }
                buf[..name.len()].copy_from_slice(name);
                buf[name.len()] = 0;
                return Ok(name.len() + 1);
            }
        })();
        self.lock.release();
        result
    }

    fn write(&self, _buf: &[u8]) -> KernelResult<usize> {
        Err(KernelError::NotSupported {
            operation: "write on a directory listing",
        })
    }

    fn cntl(&self, op: CntlOp) -> KernelResult<u64> {
        match op {
            CntlOp::GetPos => Ok(self.cursor.get() as u64),
            CntlOp::SetPos(pos) => {
                self.cursor.set(pos as u32);
                Ok(pos)
            }
            CntlOp::GetEnd | CntlOp::SetEnd(_) => Err(KernelError::NotSupported {
                operation: "set-end on a directory listing",
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::borrow::ToOwned;
    use alloc::vec::Vec;

    use super::*;
    use crate::fs::blockdev::RamDisk;

    fn fresh_fs(blocks: u32, ninodes: u32) -> (Arc<RamDisk>, Arc<FlatFs>) {
        let disk = Arc::new(RamDisk::new(blocks as usize));
        let cache = Arc::new(BlockCache::new(disk.clone() as Arc<dyn Storage>));
        FlatFs::format(&cache, blocks, ninodes).unwrap();
        let fs = FlatFs::mount(cache).unwrap();
        (disk, fs)
    }

    /// Drop all cached state and mount again from the device.
    fn remount(disk: &Arc<RamDisk>, fs: &Arc<FlatFs>) -> Arc<FlatFs> {
        fs.sync().unwrap();
        let cache = Arc::new(BlockCache::new(disk.clone() as Arc<dyn Storage>));
        FlatFs::mount(cache).unwrap()
    }

    #[test]
    fn mounting_an_unformatted_disk_fails() {
        let disk = Arc::new(RamDisk::new(64));
        let cache = Arc::new(BlockCache::new(disk as Arc<dyn Storage>));
        assert!(matches!(
            FlatFs::mount(cache),
            Err(KernelError::BadFormat { .. })
        ));
    }

    #[test]
    fn create_exists_delete_create() {
        let (_disk, fs) = fresh_fs(256, 32);
        fs.create("f").unwrap();
        assert!(fs.open("f").is_ok());
        assert_eq!(fs.create("f"), Err(KernelError::AlreadyExists));
        fs.delete("f").unwrap();
        assert_eq!(fs.open("f").err(), Some(KernelError::NoEntry));
        fs.create("f").unwrap();
    }

    #[test]
    fn name_rules() {
        let (_disk, fs) = fresh_fs(256, 32);
        assert!(matches!(
            fs.create("name-that-is-far-too-long"),
            Err(KernelError::InvalidArgument { .. })
        ));
        assert!(matches!(
            fs.create("a/b"),
            Err(KernelError::InvalidArgument { .. })
        ));
        fs.create("exactly13char").unwrap();
        assert_eq!(fs.delete("missing"), Err(KernelError::NoEntry));
    }

    #[test]
    fn write_read_back_3000_bytes() {
        let (_disk, fs) = fresh_fs(512, 32);
        fs.create("a").unwrap();
        let h = fs.open("a").unwrap();

        let data: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(h.write(&data).unwrap(), 3000);
        assert_eq!(h.cntl(CntlOp::GetEnd).unwrap(), 3000);

        h.cntl(CntlOp::SetPos(0)).unwrap();
        let mut back = alloc::vec![0u8; 3000];
        assert_eq!(h.read(&mut back).unwrap(), 3000);
        assert_eq!(back, data);

        // Reads at EOF return zero.
        assert_eq!(h.read(&mut back).unwrap(), 0);

        fs.delete("a").unwrap();
        assert_eq!(fs.open("a").err(), Some(KernelError::NoEntry));
    }

    #[test]
    fn grow_across_the_indirect_boundary_and_remount() {
        let (disk, fs) = fresh_fs(512, 32);
        fs.create("b").unwrap();
        let h = fs.open("b").unwrap();

        let target = 4 * BLKSZ as u64 + 3;
        assert_eq!(h.cntl(CntlOp::SetEnd(target)).unwrap(), 2051);
        assert_eq!(h.cntl(CntlOp::GetEnd).unwrap(), 2051);

        // Fresh blocks read back zeroed.
        h.cntl(CntlOp::SetPos(4 * BLKSZ as u64)).unwrap();
        let mut three = [0xFFu8; 3];
        assert_eq!(h.read(&mut three).unwrap(), 3);
        assert_eq!(three, [0, 0, 0]);

        h.cntl(CntlOp::SetPos(4 * BLKSZ as u64)).unwrap();
        assert_eq!(h.write(b"XYZ").unwrap(), 3);
        drop(h);

        let fs2 = remount(&disk, &fs);
        let h2 = fs2.open("b").unwrap();
        assert_eq!(h2.cntl(CntlOp::GetEnd).unwrap(), 2051);
        h2.cntl(CntlOp::SetPos(4 * BLKSZ as u64)).unwrap();
        let mut back = [0u8; 3];
        assert_eq!(h2.read(&mut back).unwrap(), 3);
        assert_eq!(&back, b"XYZ");
    }

    #[test]
    fn set_end_never_shrinks_and_positions_are_bounded() {
        let (_disk, fs) = fresh_fs(512, 32);
        fs.create("c").unwrap();
        let h = fs.open("c").unwrap();
        h.cntl(CntlOp::SetEnd(1000)).unwrap();
        assert!(matches!(
            h.cntl(CntlOp::SetEnd(10)),
            Err(KernelError::InvalidArgument { .. })
        ));

        assert_eq!(h.cntl(CntlOp::SetPos(777)).unwrap(), 777);
        assert_eq!(h.cntl(CntlOp::GetPos).unwrap(), 777);
        assert_eq!(h.cntl(CntlOp::SetPos(MAX_FILE_SIZE)).unwrap(), MAX_FILE_SIZE);
        assert!(matches!(
            h.cntl(CntlOp::SetPos(MAX_FILE_SIZE + 1)),
            Err(KernelError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn sparse_writes_leave_zero_filled_holes() {
        let (_disk, fs) = fresh_fs(1024, 32);
        fs.create("sparse").unwrap();
        let h = fs.open("sparse").unwrap();

        // Write into the double-indirect region, leaving everything below
        // as holes.
        let far = DINDIRECT_BASE as u64 * BLKSZ as u64;
        h.cntl(CntlOp::SetPos(far)).unwrap();
        assert_eq!(h.write(b"deep").unwrap(), 4);
        assert_eq!(h.cntl(CntlOp::GetEnd).unwrap(), far + 4);

        h.cntl(CntlOp::SetPos(10 * BLKSZ as u64)).unwrap();
        let mut hole = [0xFFu8; 16];
        assert_eq!(h.read(&mut hole).unwrap(), 16);
        assert_eq!(hole, [0u8; 16]);

        h.cntl(CntlOp::SetPos(far)).unwrap();
        let mut back = [0u8; 4];
        assert_eq!(h.read(&mut back).unwrap(), 4);
        assert_eq!(&back, b"deep");
    }

    #[test]
    fn delete_returns_every_data_block() {
        let (_disk, fs) = fresh_fs(1024, 32);
        // Create first: the directory's own block stays allocated either way.
        fs.create("bulk").unwrap();
        let before = fs.free_data_bits();

        let h = fs.open("bulk").unwrap();
        let data = alloc::vec![9u8; 6 * BLKSZ]; // direct + indirect blocks
        assert_eq!(h.write(&data).unwrap(), data.len());
        drop(h);
        assert!(fs.free_data_bits() < before);

        fs.delete("bulk").unwrap();
        assert_eq!(fs.free_data_bits(), before, "all blocks back in the bitmap");
    }

    #[test]
    fn data_bitmap_marks_every_reachable_block() {
        let (_disk, fs) = fresh_fs(1024, 32);
        fs.create("x").unwrap();
        let h = fs.open("x").unwrap();
        h.write(&alloc::vec![1u8; 5 * BLKSZ]).unwrap();
        drop(h);

        fs.lock.acquire();
        let root = fs.read_inode(fs.sb.root_inode).unwrap();
        let (_, inum) = fs.dir_find(&root, "x").unwrap().unwrap();
        let ino = fs.read_inode(inum).unwrap();
        fs.lock.release();

        for &rel in ino.direct.iter().filter(|&&r| r != 0) {
            assert!(fs.bitmap_test(BitmapKind::Data, fs.data_abs(rel)));
        }
        assert!(ino.indirect != 0);
        assert!(fs.bitmap_test(BitmapKind::Data, fs.data_abs(ino.indirect)));
    }

    #[test]
    fn listing_walks_names_and_compacts_after_delete() {
        let (_disk, fs) = fresh_fs(512, 32);
        for name in ["one", "two", "three"] {
            fs.create(name).unwrap();
        }

        let names = |fs: &Arc<FlatFs>| {
            let listing = fs.open("").unwrap();
            let mut out = Vec::new();
            let mut buf = [0u8; 16];
            loop {
                let n = listing.read(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                out.push(core::str::from_utf8(&buf[..n - 1]).unwrap().to_owned());
            }
            out
        };
        assert_eq!(names(&fs), ["one", "two", "three"]);

        // Deleting the middle entry swaps the tail into its slot.
        fs.delete("two").unwrap();
        assert_eq!(names(&fs), ["one", "three"]);

        // The "/" spelling opens the same listing.
        let slash = fs.open("/").unwrap();
        let mut buf = [0u8; 16];
        assert!(slash.read(&mut buf).unwrap() > 0);
    }

    #[test]
    fn inode_exhaustion_reports_too_many_files() {
        // 1 inode-table block = 16 inodes, minus reserved 0 and root 1.
        let (_disk, fs) = fresh_fs(256, 16);
        let mut made = 0;
        loop {
            let name = alloc::format!("f{}", made);
            match fs.create(&name) {
                Ok(()) => made += 1,
                Err(KernelError::TooManyFiles) => break,
                Err(e) => panic!("unexpected error: {:?}", e),
            }
        }
        assert_eq!(made, 14);
    }

    #[test]
    fn inode_round_trips_as_32_bytes() {
        let ino = Inode {
            size: 0x0102_0304,
            direct: [1, 2, 3, 4],
            indirect: 5,
            dindirect: [6, 7],
        };
        assert_eq!(Inode::from_bytes(&ino.to_bytes()), ino);
        assert_eq!(core::mem::size_of::<[u8; INODE_SIZE]>(), 32);
    }
}
