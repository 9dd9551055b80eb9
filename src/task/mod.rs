//! Process management and scheduling.
//!
//! Everything about starting, suspending, blocking and ending processes
//! lives here. A single global [`TaskManager`] queues ready processes, the
//! pid → PCB table owns them, and one [`Processor`] tracks whatever is on
//! the CPU. Preemption is driven from outside: the timer interrupt calls
//! [`tick`] once per tick, and a process whose slice runs out is moved to
//! the tail of the queue. Be careful around `switch.S`'s `__switch` — the
//! control flow near it is not what it looks like.

mod context;
mod id;
mod manager;
pub(crate) mod processor;
mod switch;
#[allow(clippy::module_inception)]
mod task;

use crate::error::{KernelError, KernelResult};
use crate::mm::FRAME_ALLOCATOR;
#[cfg(target_os = "none")]
use alloc::sync::Arc;
pub use context::TaskContext;
use switch::__switch;

pub use id::{kstack_alloc, pid_alloc, KernelStack, PidAllocator, PidHandle};
pub use manager::{
    add_task, fetch_task, insert_into_pid2process, pid2process, pid_is_live, process_count,
    remove_from_pid2process, wakeup_task, TaskManager, PID2PCB, TASK_MANAGER,
};
pub use processor::{
    current_pid, current_task, run_tasks, schedule, take_current_task, Processor, PROCESSOR,
};
pub use task::{BlockedReason, ProcessControlBlock, ProcessControlBlockInner, ProcessStatus};

/// Create a process and hand it to the scheduler.
///
/// Allocation failures (no pid-table slot, no stack, no frames for the
/// address space) are returned to the caller; none of them is fatal to the
/// kernel by itself.
#[cfg(target_os = "none")]
pub fn spawn_process(name: &str, entry: usize) -> KernelResult<Arc<ProcessControlBlock>> {
    use crate::mm::KERNEL_SPACE;
    let parent = current_task().map(|task| Arc::downgrade(&task));
    let pcb = ProcessControlBlock::new(
        name,
        entry,
        parent,
        &mut FRAME_ALLOCATOR.exclusive_access(),
        &KERNEL_SPACE.exclusive_access(),
    )?;
    insert_into_pid2process(pcb.getpid(), Arc::clone(&pcb))?;
    add_task(Arc::clone(&pcb));
    Ok(pcb)
}

/// One timer tick: burn a tick of the running process's slice and preempt
/// it when the slice is gone. Called from the timer interrupt with
/// interrupts disabled; a tick before the first process is scheduled does
/// nothing.
pub fn tick() {
    let Some(task) = current_task() else {
        return;
    };
    let expired = task.inner_exclusive_access().tick_slice();
    drop(task);
    if expired {
        suspend_current_and_run_next();
    }
}

/// Give up the rest of the current slice and reschedule synchronously.
pub fn yield_now() {
    let Some(task) = current_task() else {
        return;
    };
    task.inner_exclusive_access().time_slice = 0;
    drop(task);
    suspend_current_and_run_next();
}

/// Suspend the current `Running` process and run the next one: the
/// outgoing process goes Ready onto the tail of the queue, so with N
/// runnable processes each runs exactly once per N selections.
pub fn suspend_current_and_run_next() {
    // there must be a process running
    let task = take_current_task().unwrap();
    let mut task_inner = task.inner_exclusive_access();
    let task_cx_ptr = &mut task_inner.task_cx as *mut TaskContext;
    task_inner.status = ProcessStatus::Ready;
    drop(task_inner);
    add_task(task);
    schedule(task_cx_ptr);
}

/// Block the current process for `reason` and run the next one. The
/// process is not queued anywhere; the matching event source wakes it
/// through [`wakeup_task`].
pub fn block_current_and_run_next(reason: BlockedReason) {
    let task = take_current_task().unwrap();
    let mut task_inner = task.inner_exclusive_access();
    let task_cx_ptr = &mut task_inner.task_cx as *mut TaskContext;
    task_inner.status = ProcessStatus::Blocked(reason);
    drop(task_inner);
    schedule(task_cx_ptr);
}

/// End the current process: mark it Zombie, record the exit code, and
/// never run it again.
///
/// Nothing is freed here — the process is still executing on the kernel
/// stack it would be freeing. The pid table keeps the Zombie until a
/// reaper calls [`reap`]; the scheduler drops its reference now, so the
/// zombie is never reselected.
pub fn exit_current_and_run_next(exit_code: i32) {
    let task = take_current_task().unwrap();
    let mut inner = task.inner_exclusive_access();
    info!(
        "process {} ({}) exited with code {}",
        task.getpid(),
        task.name,
        exit_code
    );
    inner.status = ProcessStatus::Zombie;
    inner.exit_code = exit_code;
    drop(inner);
    drop(task);
    // no saved context to keep: this process never resumes
    let mut _unused = TaskContext::zero_init();
    schedule(&mut _unused as *mut _);
}

/// Reclaim a Zombie: destroy its address space into the frame allocator,
/// drop it from the pid table, and return its exit code. The PCB, its
/// kernel stack and its pid die with the last reference.
///
/// Only a Zombie can be reaped; `ProcessNotFound` covers both an unknown
/// pid and a process that has not exited yet. The current process is never
/// a Zombie (exit takes it off the processor before the final switch), so
/// a process cannot reap itself.
pub fn reap(pid: usize) -> KernelResult<i32> {
    let task = pid2process(pid).ok_or(KernelError::ProcessNotFound)?;
    let mut inner = task.inner_exclusive_access();
    if !inner.is_zombie() {
        return Err(KernelError::ProcessNotFound);
    }
    inner
        .address_space
        .destroy(&mut FRAME_ALLOCATOR.exclusive_access());
    let exit_code = inner.exit_code;
    drop(inner);
    drop(task);
    remove_from_pid2process(pid);
    Ok(exit_code)
}
