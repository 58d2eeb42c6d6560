//! Pipes.
//!
//! A unidirectional byte ring of one page with independent read and write
//! endpoints. Dropping an endpoint wakes the other side; when both ends are
//! gone the ring itself is freed with the shared object.

use core::cell::UnsafeCell;

use alloc::{collections::VecDeque, sync::Arc};

use super::{CntlOp, Uio, UioHandle};
use crate::{
    config::PIPE_CAPACITY,
    error::{KernelError, KernelResult},
    sched::{Condition, Lock},
};

struct PipeInner {
    buf: VecDeque<u8>,
    reader_alive: bool,
    writer_alive: bool,
}

struct Pipe {
    lock: Lock,
    readable: Condition,
    writable: Condition,
    inner: UnsafeCell<PipeInner>,
}

// SAFETY: the ring state is mutated only while the pipe lock is held; wait
// predicates perform read-only peeks with interrupts disabled on the single
// hart.
unsafe impl Send for Pipe {}
// SAFETY: as above.
unsafe impl Sync for Pipe {}

/// The read endpoint of a pipe.
pub struct ReadEnd {
    pipe: Arc<Pipe>,
}

/// The write endpoint of a pipe.
pub struct WriteEnd {
    pipe: Arc<Pipe>,
}

/// Create a pipe, returning `(read end, write end)`.
pub fn pipe() -> (UioHandle, UioHandle) {
    let shared = Arc::new(Pipe {
        lock: Lock::new("pipe"),
        readable: Condition::new("pipe-readable"),
        writable: Condition::new("pipe-writable"),
        inner: UnsafeCell::new(PipeInner {
            buf: VecDeque::with_capacity(PIPE_CAPACITY),
            reader_alive: true,
            writer_alive: true,
        }),
    });
    (
        Arc::new(ReadEnd {
            pipe: shared.clone(),
        }),
        Arc::new(WriteEnd { pipe: shared }),
    )
}

impl Uio for ReadEnd {
    /// Return what is buffered, block while empty and the writer lives, and
    /// report EOF (0) once the writer is gone and the ring is drained.
    fn read(&self, buf: &mut [u8]) -> KernelResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let p = &*self.pipe;
        loop {
            p.lock.acquire();
            // SAFETY: pipe lock held.
            let inner = unsafe { &mut *p.inner.get() };
            if !inner.buf.is_empty() {
                let n = buf.len().min(inner.buf.len());
                for slot in buf[..n].iter_mut() {
                    *slot = inner.buf.pop_front().unwrap_or(0);
                }
                p.lock.release();
                p.writable.broadcast();
                return Ok(n);
            }
            if !inner.writer_alive {
                p.lock.release();
                return Ok(0);
            }
            p.lock.release();
            let inner_ptr = p.inner.get();
            p.readable.wait_if(|| {
                // SAFETY: read-only peek with interrupts disabled.
                let inner = unsafe { &*inner_ptr };
                inner.buf.is_empty() && inner.writer_alive
            });
        }
    }

    fn write(&self, _buf: &[u8]) -> KernelResult<usize> {
        Err(KernelError::NotSupported {
            operation: "write on a pipe read end",
        })
    }

    fn cntl(&self, _op: CntlOp) -> KernelResult<u64> {
        Err(KernelError::NotSupported {
            operation: "cntl on a pipe",
        })
    }
}

impl Drop for ReadEnd {
    fn drop(&mut self) {
        let p = &*self.pipe;
        p.lock.acquire();
        // SAFETY: pipe lock held.
        unsafe { &mut *p.inner.get() }.reader_alive = false;
        p.lock.release();
        p.writable.broadcast();
    }
}

impl Uio for WriteEnd {
    /// Copy into the ring, blocking while it is full. A dead reader yields
    /// a broken-pipe error, or a short count if some bytes already landed.
    fn write(&self, data: &[u8]) -> KernelResult<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let p = &*self.pipe;
        let mut written = 0;
        loop {
            p.lock.acquire();
            // SAFETY: pipe lock held.
            let inner = unsafe { &mut *p.inner.get() };
            if !inner.reader_alive {
                p.lock.release();
                return if written > 0 {
                    Ok(written)
                } else {
                    Err(KernelError::BrokenPipe)
                };
            }
            let space = PIPE_CAPACITY - inner.buf.len();
            let n = space.min(data.len() - written);
            inner.buf.extend(data[written..written + n].iter().copied());
            written += n;
            let done = written == data.len();
            p.lock.release();
            if n > 0 {
                p.readable.broadcast();
            }
            if done {
                return Ok(written);
            }
            let inner_ptr = p.inner.get();
            p.writable.wait_if(|| {
                // SAFETY: read-only peek with interrupts disabled.
                let inner = unsafe { &*inner_ptr };
                inner.buf.len() == PIPE_CAPACITY && inner.reader_alive
            });
        }
    }

    fn read(&self, _buf: &mut [u8]) -> KernelResult<usize> {
        Err(KernelError::NotSupported {
            operation: "read on a pipe write end",
        })
    }

    fn cntl(&self, _op: CntlOp) -> KernelResult<u64> {
        Err(KernelError::NotSupported {
            operation: "cntl on a pipe",
        })
    }
}

impl Drop for WriteEnd {
    fn drop(&mut self) {
        let p = &*self.pipe;
        p.lock.acquire();
        // SAFETY: pipe lock held.
        unsafe { &mut *p.inner.get() }.writer_alive = false;
        p.lock.release();
        p.readable.broadcast();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_returns_buffered_data_then_eof() {
        let (reader, writer) = pipe();
        assert_eq!(writer.write(b"hello").unwrap(), 5);
        drop(writer);

        let mut buf = [0u8; 100];
        assert_eq!(reader.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(reader.read(&mut buf).unwrap(), 0, "EOF after writer close");
    }

    #[test]
    fn write_to_dead_reader_is_broken_pipe() {
        let (reader, writer) = pipe();
        drop(reader);
        assert_eq!(writer.write(b"data"), Err(KernelError::BrokenPipe));
    }

    #[test]
    fn ring_holds_a_full_page() {
        let (reader, writer) = pipe();
        let payload = alloc::vec![7u8; PIPE_CAPACITY];
        assert_eq!(writer.write(&payload).unwrap(), PIPE_CAPACITY);
        let mut back = alloc::vec![0u8; PIPE_CAPACITY];
        assert_eq!(reader.read(&mut back).unwrap(), PIPE_CAPACITY);
        assert_eq!(back, payload);
    }

    #[test]
    fn zero_length_transfers() {
        let (reader, writer) = pipe();
        assert_eq!(writer.write(&[]).unwrap(), 0);
        let mut empty = [0u8; 0];
        assert_eq!(reader.read(&mut empty).unwrap(), 0);
    }

    #[test]
    fn endpoints_reject_wrong_direction() {
        let (reader, writer) = pipe();
        let mut buf = [0u8; 4];
        assert!(matches!(
            writer.read(&mut buf),
            Err(KernelError::NotSupported { .. })
        ));
        assert!(matches!(
            reader.write(b"x"),
            Err(KernelError::NotSupported { .. })
        ));
        assert!(matches!(
            reader.cntl(CntlOp::GetPos),
            Err(KernelError::NotSupported { .. })
        ));
    }
}
