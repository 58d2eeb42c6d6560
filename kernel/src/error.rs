//! Kernel error types.
//!
//! One central error enum for every subsystem, plus the stable negative
//! integer codes the syscall ABI exposes to user processes.

use core::fmt;

/// Main kernel error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Malformed argument (bad pointer range, unaligned position, name too
    /// long, unknown operation).
    InvalidArgument { what: &'static str },
    /// A bounded resource is transiently unavailable (cache full of pinned
    /// entries, no free descriptors).
    Busy { resource: &'static str },
    /// The operation is not supported by this object or device.
    NotSupported { operation: &'static str },
    /// The device reported an error, or a transport transferred fewer bytes
    /// than it promised.
    Io { device: &'static str },
    /// On-disk structure failed validation.
    BadFormat { what: &'static str },
    /// No directory entry with the requested name.
    NoEntry,
    /// Access not permitted by the mapping flags.
    PermissionDenied,
    /// Handle index out of range or slot empty.
    BadHandle,
    /// Inode table, handle table, or directory is full.
    TooManyFiles,
    /// Process table is full.
    TooManyProcesses,
    /// Thread table is full.
    TooManyThreads,
    /// `wait` with no live children.
    NoChild,
    /// Out of physical or heap memory.
    OutOfMemory { requested: usize },
    /// Write to a pipe whose read end is gone.
    BrokenPipe,
    /// Name already present in the directory.
    AlreadyExists,
}

/// Result type alias for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument { what } => write!(f, "invalid argument: {}", what),
            Self::Busy { resource } => write!(f, "busy: {}", resource),
            Self::NotSupported { operation } => write!(f, "not supported: {}", operation),
            Self::Io { device } => write!(f, "I/O error on {}", device),
            Self::BadFormat { what } => write!(f, "bad on-disk format: {}", what),
            Self::NoEntry => write!(f, "no such entry"),
            Self::PermissionDenied => write!(f, "permission denied"),
            Self::BadHandle => write!(f, "bad handle"),
            Self::TooManyFiles => write!(f, "too many files"),
            Self::TooManyProcesses => write!(f, "too many processes"),
            Self::TooManyThreads => write!(f, "too many threads"),
            Self::NoChild => write!(f, "no child to wait for"),
            Self::OutOfMemory { requested } => {
                write!(f, "out of memory: requested {} bytes", requested)
            }
            Self::BrokenPipe => write!(f, "broken pipe"),
            Self::AlreadyExists => write!(f, "already exists"),
        }
    }
}

/// Error identifiers stable at the syscall ABI. Syscalls return these as
/// negative values in the conventional first-argument register.
pub mod abi {
    pub const EINVAL: isize = -1;
    pub const EBUSY: isize = -2;
    pub const ENOTSUP: isize = -3;
    pub const EIO: isize = -4;
    pub const EBADFMT: isize = -5;
    pub const ENOENT: isize = -6;
    pub const EPERM: isize = -7;
    pub const EBADH: isize = -8;
    pub const EMFILE: isize = -9;
    pub const ENPROC: isize = -10;
    pub const ENTHR: isize = -11;
    pub const ECHILD: isize = -12;
    pub const ENOMEM: isize = -13;
    pub const EPIPE: isize = -14;
    pub const EEXIST: isize = -15;
}

impl KernelError {
    /// Map to the stable ABI code returned to user processes.
    pub fn to_abi(self) -> isize {
        match self {
            Self::InvalidArgument { .. } => abi::EINVAL,
            Self::Busy { .. } => abi::EBUSY,
            Self::NotSupported { .. } => abi::ENOTSUP,
            Self::Io { .. } => abi::EIO,
            Self::BadFormat { .. } => abi::EBADFMT,
            Self::NoEntry => abi::ENOENT,
            Self::PermissionDenied => abi::EPERM,
            Self::BadHandle => abi::EBADH,
            Self::TooManyFiles => abi::EMFILE,
            Self::TooManyProcesses => abi::ENPROC,
            Self::TooManyThreads => abi::ENTHR,
            Self::NoChild => abi::ECHILD,
            Self::OutOfMemory { .. } => abi::ENOMEM,
            Self::BrokenPipe => abi::EPIPE,
            Self::AlreadyExists => abi::EEXIST,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abi_codes_are_negative_and_distinct() {
        let all = [
            KernelError::InvalidArgument { what: "x" },
            KernelError::Busy { resource: "x" },
            KernelError::NotSupported { operation: "x" },
            KernelError::Io { device: "x" },
            KernelError::BadFormat { what: "x" },
            KernelError::NoEntry,
            KernelError::PermissionDenied,
            KernelError::BadHandle,
            KernelError::TooManyFiles,
            KernelError::TooManyProcesses,
            KernelError::TooManyThreads,
            KernelError::NoChild,
            KernelError::OutOfMemory { requested: 1 },
            KernelError::BrokenPipe,
            KernelError::AlreadyExists,
        ];
        for (i, a) in all.iter().enumerate() {
            assert!(a.to_abi() < 0);
            for b in &all[i + 1..] {
                assert_ne!(a.to_abi(), b.to_abi());
            }
        }
    }
}
