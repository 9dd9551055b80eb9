//! Synchronization primitives for a uniprocessor kernel.

mod up;

pub use up::UPSafeCell;
