//! Implementation of [`Processor`] and the intersection of control flows.
//!
//! The processor keeps the kernel's idle control flow and the currently
//! running process. Scheduling is two half-switches: a suspending process
//! switches into the idle context, and the idle loop switches out into
//! whatever `fetch_task` hands it next. The idle loop is the designated
//! idle "process": when the ready queue is empty it halts the CPU until
//! the next interrupt, so the system always has a selected execution
//! context.

use super::__switch;
use super::{fetch_task, ProcessStatus};
use super::{ProcessControlBlock, TaskContext};
use crate::config::TIME_SLICE_TICKS;
use crate::sync::UPSafeCell;
use alloc::sync::Arc;
use lazy_static::*;

/// Processor management structure.
pub struct Processor {
    /// the process currently on the CPU
    current: Option<Arc<ProcessControlBlock>>,
    /// the idle control flow, target of every suspending switch
    idle_task_cx: TaskContext,
    /// root table currently loaded; spaces are swapped only on change
    active_token: usize,
}

impl Processor {
    pub fn new() -> Self {
        Self {
            current: None,
            idle_task_cx: TaskContext::zero_init(),
            active_token: 0,
        }
    }

    /// Pointer to the idle context for `__switch`.
    fn get_idle_task_cx_ptr(&mut self) -> *mut TaskContext {
        &mut self.idle_task_cx as *mut _
    }

    /// Take the current process out of the processor.
    pub fn take_current(&mut self) -> Option<Arc<ProcessControlBlock>> {
        self.current.take()
    }

    /// Clone of the current process.
    pub fn current(&self) -> Option<Arc<ProcessControlBlock>> {
        self.current.as_ref().map(Arc::clone)
    }
}

impl Default for Processor {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static! {
    /// The processor of this single-CPU kernel.
    pub static ref PROCESSOR: UPSafeCell<Processor> = unsafe { UPSafeCell::new(Processor::new()) };
}

/// The idle loop: fetch the next ready process, hand it a fresh time
/// slice, swap in its address space if it differs from the active one, and
/// switch to it. Runs forever on the boot stack.
pub fn run_tasks() -> ! {
    loop {
        let mut processor = PROCESSOR.exclusive_access();
        if let Some(task) = fetch_task() {
            let idle_task_cx_ptr = processor.get_idle_task_cx_ptr();
            let mut task_inner = task.inner_exclusive_access();
            let next_task_cx_ptr = &task_inner.task_cx as *const TaskContext;
            task_inner.status = ProcessStatus::Running;
            task_inner.time_slice = TIME_SLICE_TICKS;
            let token = task_inner.address_space.token();
            if processor.active_token != token {
                task_inner.address_space.activate();
                processor.active_token = token;
            }
            drop(task_inner);
            processor.current = Some(task);
            drop(processor);
            unsafe {
                __switch(idle_task_cx_ptr, next_task_cx_ptr);
            }
        } else {
            drop(processor);
            // nothing ready: halt until the next interrupt can change that
            wait_for_interrupt();
        }
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn wait_for_interrupt() {
    x86_64::instructions::hlt();
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn wait_for_interrupt() {
    core::hint::spin_loop();
}

/// Take the current process out of the processor.
pub fn take_current_task() -> Option<Arc<ProcessControlBlock>> {
    PROCESSOR.exclusive_access().take_current()
}

/// The process currently on the CPU.
pub fn current_task() -> Option<Arc<ProcessControlBlock>> {
    PROCESSOR.exclusive_access().current()
}

/// Pid of the process currently on the CPU.
pub fn current_pid() -> Option<usize> {
    current_task().map(|task| task.getpid())
}

/// Switch from a suspending process back to the idle control flow, which
/// picks the next process. Callers have already stored the right status
/// and queue position for the outgoing process.
pub fn schedule(switched_task_cx_ptr: *mut TaskContext) {
    let mut processor = PROCESSOR.exclusive_access();
    let idle_task_cx_ptr = processor.get_idle_task_cx_ptr();
    drop(processor);
    unsafe {
        __switch(switched_task_cx_ptr, idle_task_cx_ptr);
    }
}
