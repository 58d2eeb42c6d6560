//! Reference-counted byte-stream handles.
//!
//! Everything a process can hold in its handle table (an open file, a
//! directory listing, a pipe end) is a [`Uio`] object behind an [`Arc`].
//! `dup` and fork-time table inheritance clone the handle; the object's
//! `Drop` runs when the last reference disappears, which is where pipe ends
//! signal their peers. Reference counts are the `Arc` strong counts.

pub mod pipe;

use alloc::sync::Arc;

use crate::error::KernelResult;

/// Control operations on a handle, named rather than numbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CntlOp {
    /// File size or device capacity in bytes.
    GetEnd,
    /// Grow the object to the given size (shrinking is rejected).
    SetEnd(u64),
    /// Current byte position.
    GetPos,
    /// Move the byte position.
    SetPos(u64),
}

/// A byte-stream object.
pub trait Uio: Send + Sync {
    fn read(&self, buf: &mut [u8]) -> KernelResult<usize>;
    fn write(&self, buf: &[u8]) -> KernelResult<usize>;
    fn cntl(&self, op: CntlOp) -> KernelResult<u64>;
}

/// A shared handle to a byte-stream object.
pub type UioHandle = Arc<dyn Uio>;
