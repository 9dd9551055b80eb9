//! The error taxonomy shared by every subsystem.
//!
//! All fallible operations in this crate return [`KernelResult`]. Failures
//! are reported to the immediate caller and are never fatal by themselves;
//! only a caller may decide that a particular failure (say, allocating the
//! first kernel stack at boot) is unrecoverable.

use thiserror::Error;

/// Everything that can go wrong inside the memory and scheduling core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KernelError {
    /// No physical frame or heap block satisfies the request.
    #[error("out of memory")]
    OutOfMemory,
    /// The target address is not mapped, already mapped, or otherwise not
    /// usable for the requested translation. "Not found", not corruption.
    #[error("invalid address")]
    InvalidAddress,
    /// A heap header failed validation (bad magic, double free). The
    /// offending state is left untouched.
    #[error("corruption detected")]
    Corruption,
    /// The destination mailbox is full; the send was refused without
    /// blocking the sender.
    #[error("mailbox full")]
    MailboxFull,
    /// No live process carries the requested pid.
    #[error("process not found")]
    ProcessNotFound,
    /// A fixed-capacity resource (process table slots, contiguous frame
    /// runs) is exhausted even though memory may remain.
    #[error("resource exhausted")]
    ResourceExhausted,
}

/// Result alias used throughout the crate.
pub type KernelResult<T> = Result<T, KernelError>;

/// Syscall return-code mapping: each variant gets a distinct negative
/// value, so user processes see ordinary error returns, never a panic.
impl From<KernelError> for isize {
    fn from(err: KernelError) -> isize {
        match err {
            KernelError::OutOfMemory => -1,
            KernelError::InvalidAddress => -2,
            KernelError::Corruption => -3,
            KernelError::MailboxFull => -4,
            KernelError::ProcessNotFound => -5,
            KernelError::ResourceExhausted => -6,
        }
    }
}
