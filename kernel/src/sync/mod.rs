//! Kernel-internal synchronization helpers.
//!
//! The blocking primitives (conditions, ownership locks) live in
//! [`crate::sched`]; this module only carries the non-blocking pieces.

pub mod once_lock;

pub use once_lock::OnceLock;
