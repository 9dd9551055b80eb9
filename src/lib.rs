//! The memory management and process scheduling core of a single-CPU
//! x86-64 kernel.
//!
//! This crate owns physical frames, the kernel heap, 4-level page tables,
//! process control blocks, the round-robin scheduler and per-process IPC
//! mailboxes. Everything around it — boot protocol parsing, interrupt
//! controller programming, device drivers, the loader and the shell — lives
//! outside and reaches in through a narrow surface:
//!
//! - the boot layer feeds the physical memory map to [`mm::init`];
//! - the timer interrupt calls [`task::tick`] once per tick;
//! - the loader places code and data with [`mm::AddressSpace::map_page`];
//! - the syscall dispatcher consumes [`syscall::syscall`].
//!
//! The kernel is non-reentrant and single-core: globals are guarded by
//! [`sync::UPSafeCell`], which is sound because the trap layer enters this
//! crate with interrupts disabled. Each subsystem is an owned value type
//! (`BitmapFrameAllocator`, `HeapAllocator`, `AddressSpace`, `TaskManager`,
//! ...) so the same code paths run under the host test harness; the
//! bare-metal glue (serial console, CR3 and TLB writes, the context switch
//! and the global allocator hook) is gated on `target_os = "none"`.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]

extern crate alloc;

#[macro_use]
extern crate log;

#[cfg(target_os = "none")]
#[macro_use]
pub mod console;
pub mod config;
pub mod error;
pub mod ipc;
#[cfg(target_os = "none")]
pub mod logging;
pub mod mm;
pub mod sync;
pub mod syscall;
pub mod task;

pub use error::{KernelError, KernelResult};
