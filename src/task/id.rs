//! Process identifiers and kernel stacks.
//!
//! Pids are unique and strictly monotonic: an exited process's pid is
//! never observed on a later process, so a stale pid can only miss in the
//! process table, never alias a new process. Kernel stacks are plain heap
//! allocations — the PCB owns its stack storage and both return to the
//! heap together when the PCB is reaped.

use crate::config::KERNEL_STACK_SIZE;
use crate::error::{KernelError, KernelResult};
use alloc::boxed::Box;
use alloc::vec::Vec;
use spin::Mutex;

/// Hands out pids in ascending order, never reusing one.
pub struct PidAllocator {
    current: usize,
}

impl PidAllocator {
    pub const fn new() -> Self {
        PidAllocator { current: 1 }
    }
    pub fn alloc(&mut self) -> PidHandle {
        self.current += 1;
        PidHandle(self.current - 1)
    }
}

impl Default for PidAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Abstract structure of PID
pub struct PidHandle(pub usize);

/// The kernel's pid allocator. Like the heap lock, this sits behind a
/// spin mutex rather than the trap-discipline cell: process creation is
/// reachable from contexts that are not kernel entry points.
static PID_ALLOCATOR: Mutex<PidAllocator> = Mutex::new(PidAllocator::new());

/// Allocate the next pid.
pub fn pid_alloc() -> PidHandle {
    PID_ALLOCATOR.lock().alloc()
}

/// One process kernel stack, a 16-byte-aligned [`KERNEL_STACK_SIZE`]
/// allocation from the kernel heap.
pub struct KernelStack {
    buf: Box<[u128]>,
}

/// Allocate a kernel stack. Heap exhaustion is reported, not fatal: the
/// failed `create` is an ordinary outcome for the caller.
pub fn kstack_alloc() -> KernelResult<KernelStack> {
    let words = KERNEL_STACK_SIZE / core::mem::size_of::<u128>();
    let mut buf = Vec::new();
    buf.try_reserve_exact(words)
        .map_err(|_| KernelError::OutOfMemory)?;
    buf.resize(words, 0);
    Ok(KernelStack {
        buf: buf.into_boxed_slice(),
    })
}

impl KernelStack {
    /// Highest address of the stack, where execution starts.
    pub fn get_top(&self) -> usize {
        self.buf.as_ptr() as usize + KERNEL_STACK_SIZE
    }
}
