//! Wrap `switch.S` as a Rust function.
//!
//! The scheduler is platform neutral; this shim is the whole
//! architecture-specific surface of a context switch. Host builds get a
//! stub with the same signature so the scheduler's decision logic links
//! and runs under the test harness, where no real switch ever happens.

use super::TaskContext;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
core::arch::global_asm!(include_str!("switch.S"));

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
extern "C" {
    /// Switch to the context of `next_task_cx_ptr`, saving the current
    /// context in `current_task_cx_ptr`.
    pub fn __switch(current_task_cx_ptr: *mut TaskContext, next_task_cx_ptr: *const TaskContext);
}

/// Host stub: records nothing, switches nothing.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub unsafe extern "C" fn __switch(
    _current_task_cx_ptr: *mut TaskContext,
    _next_task_cx_ptr: *const TaskContext,
) {
}
