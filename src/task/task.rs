//! Types related to process management & the functions that assemble a
//! whole [`ProcessControlBlock`].

use super::TaskContext;
use super::{kstack_alloc, pid_alloc, KernelStack, PidHandle};
use crate::config::TIME_SLICE_TICKS;
use crate::error::KernelResult;
use crate::ipc::Mailbox;
use crate::mm::{AddressSpace, FrameAllocatorImpl};
use crate::sync::UPSafeCell;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use core::cell::RefMut;

/// Process control block structure.
///
/// The immutable parts live directly in the struct; everything the
/// scheduler and IPC mutate sits behind the `UPSafeCell`.
pub struct ProcessControlBlock {
    /// process id, unique and monotonic
    pub pid: PidHandle,
    /// human-readable name, for diagnostics
    pub name: String,
    /// kernel stack owned by this process, freed with the PCB
    kernel_stack: KernelStack,
    /// mutable state
    inner: UPSafeCell<ProcessControlBlockInner>,
}

pub struct ProcessControlBlockInner {
    /// scheduler lifecycle state
    pub status: ProcessStatus,
    /// saved callee-saved register context
    pub task_cx: TaskContext,
    /// the address space this process runs in, destroyed only on reap
    pub address_space: AddressSpace,
    /// remaining timer ticks of the current slice
    pub time_slice: usize,
    /// incoming messages
    pub mailbox: Mailbox,
    /// the process that created this one
    pub parent: Option<Weak<ProcessControlBlock>>,
    /// set once on exit
    pub exit_code: i32,
}

impl ProcessControlBlockInner {
    /// Burn one timer tick; true when the slice is exhausted and the
    /// process must be preempted.
    pub fn tick_slice(&mut self) -> bool {
        if self.time_slice > 0 {
            self.time_slice -= 1;
        }
        self.time_slice == 0
    }

    pub fn is_zombie(&self) -> bool {
        self.status == ProcessStatus::Zombie
    }
}

impl ProcessControlBlock {
    /// Assemble a new process: pid, kernel stack, a fresh address space
    /// cloned from the kernel template, and an initial context that enters
    /// `entry` on the new stack. The PCB leaves here `Ready`; any
    /// allocation failure is the caller's ordinary error, not a panic.
    pub fn new(
        name: &str,
        entry: usize,
        parent: Option<Weak<ProcessControlBlock>>,
        alloc: &mut FrameAllocatorImpl,
        template: &AddressSpace,
    ) -> KernelResult<Arc<Self>> {
        let pid = pid_alloc();
        let kernel_stack = kstack_alloc()?;
        let address_space = AddressSpace::new_user(template, alloc)?;
        let kstack_top = kernel_stack.get_top();
        let pcb = Arc::new(Self {
            pid,
            name: String::from(name),
            kernel_stack,
            inner: unsafe {
                UPSafeCell::new(ProcessControlBlockInner {
                    status: ProcessStatus::Created,
                    task_cx: TaskContext::goto_entry(kstack_top, entry),
                    address_space,
                    time_slice: TIME_SLICE_TICKS,
                    mailbox: Mailbox::new(),
                    parent,
                    exit_code: 0,
                })
            },
        });
        // context and stack are in place, the process may be scheduled
        pcb.inner_exclusive_access().status = ProcessStatus::Ready;
        Ok(pcb)
    }

    /// Exclusive access to the mutable state.
    pub fn inner_exclusive_access(&self) -> RefMut<'_, ProcessControlBlockInner> {
        self.inner.exclusive_access()
    }

    /// This process's pid.
    pub fn getpid(&self) -> usize {
        self.pid.0
    }

    /// Top of the owned kernel stack.
    pub fn kernel_stack_top(&self) -> usize {
        self.kernel_stack.get_top()
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
/// Why a blocked process is blocked, so the matching wake path is
/// auditable.
pub enum BlockedReason {
    /// waiting in `receive()` on an empty mailbox
    Receive,
    /// waiting for a device event; the driver's ISR wakes the pid
    Device,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
/// Process lifecycle state.
pub enum ProcessStatus {
    /// allocated, context not yet initialized
    Created,
    /// runnable, waiting in the ready queue
    Ready,
    /// the one process currently on the CPU
    Running,
    /// off the ready queue until an event wakes it
    Blocked(BlockedReason),
    /// exited; resources reclaimed on reap, never scheduled again
    Zombie,
}
