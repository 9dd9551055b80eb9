//! Implementation of [`TaskContext`].

/// Callee-saved register state of a suspended task, the only state the
/// context switch preserves. Everything else is caller-saved and already
/// on the task's kernel stack when `__switch` runs.
#[repr(C)]
pub struct TaskContext {
    /// kernel stack pointer; `[rsp]` holds the address `__switch` returns to
    rsp: usize,
    rbp: usize,
    rbx: usize,
    r12: usize,
    r13: usize,
    r14: usize,
    r15: usize,
}

impl TaskContext {
    /// An all-zero context, the placeholder before a task first runs.
    pub fn zero_init() -> Self {
        Self {
            rsp: 0,
            rbp: 0,
            rbx: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }

    /// A context whose first `__switch` "returns" into `entry` on the
    /// fresh stack ending at `kstack_top`.
    ///
    /// The entry address is parked where `ret` will pop it; a null word
    /// above it traps an entry function that returns instead of exiting.
    /// `kstack_top` is 16-byte aligned, so `entry` starts with the stack
    /// alignment the SysV ABI gives any called function.
    pub fn goto_entry(kstack_top: usize, entry: usize) -> Self {
        debug_assert_eq!(kstack_top % 16, 0);
        unsafe {
            *((kstack_top - 8) as *mut usize) = 0;
            *((kstack_top - 16) as *mut usize) = entry;
        }
        Self {
            rsp: kstack_top - 16,
            rbp: 0,
            rbx: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }
}
