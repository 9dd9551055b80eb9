//! Implementation of [`TaskManager`] and the pid → PCB table.
//!
//! The manager is a plain FIFO: round robin falls out of fetching from the
//! head and re-enqueueing preempted processes at the tail. The pid table
//! is the exclusive owner of every PCB; the queue and the processor hold
//! non-owning clones whose lifetime the table bounds.

use super::{ProcessControlBlock, ProcessStatus};
use crate::config::MAX_PROCESSES;
use crate::error::{KernelError, KernelResult};
use crate::sync::UPSafeCell;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use lazy_static::*;

/// FIFO queue of ready processes.
pub struct TaskManager {
    ready_queue: VecDeque<Arc<ProcessControlBlock>>,
}

/// A simple FIFO scheduler queue.
impl TaskManager {
    pub fn new() -> Self {
        Self {
            ready_queue: VecDeque::new(),
        }
    }
    /// Add a process to the tail of the queue.
    pub fn add(&mut self, task: Arc<ProcessControlBlock>) {
        self.ready_queue.push_back(task);
    }
    /// Take the process at the head of the queue.
    pub fn fetch(&mut self) -> Option<Arc<ProcessControlBlock>> {
        self.ready_queue.pop_front()
    }
    /// Number of queued processes.
    pub fn len(&self) -> usize {
        self.ready_queue.len()
    }
    /// Whether no process is queued.
    pub fn is_empty(&self) -> bool {
        self.ready_queue.is_empty()
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static! {
    /// The kernel's ready queue.
    pub static ref TASK_MANAGER: UPSafeCell<TaskManager> =
        unsafe { UPSafeCell::new(TaskManager::new()) };
    /// The kernel's pid → PCB table, owner of every live PCB.
    pub static ref PID2PCB: UPSafeCell<BTreeMap<usize, Arc<ProcessControlBlock>>> =
        unsafe { UPSafeCell::new(BTreeMap::new()) };
}

/// Enqueue a ready process.
pub fn add_task(task: Arc<ProcessControlBlock>) {
    TASK_MANAGER.exclusive_access().add(task);
}

/// Dequeue the next process to run.
pub fn fetch_task() -> Option<Arc<ProcessControlBlock>> {
    TASK_MANAGER.exclusive_access().fetch()
}

/// Look a live process up by pid.
pub fn pid2process(pid: usize) -> Option<Arc<ProcessControlBlock>> {
    PID2PCB.exclusive_access().get(&pid).cloned()
}

/// Put a new process into the table; fails when every slot is taken.
pub fn insert_into_pid2process(
    pid: usize,
    process: Arc<ProcessControlBlock>,
) -> KernelResult<()> {
    let mut map = PID2PCB.exclusive_access();
    if map.len() >= MAX_PROCESSES {
        warn!("process table full ({} slots)", MAX_PROCESSES);
        return Err(KernelError::ResourceExhausted);
    }
    map.insert(pid, process);
    Ok(())
}

/// Drop a process from the table (reap path).
pub fn remove_from_pid2process(pid: usize) {
    let mut map = PID2PCB.exclusive_access();
    if map.remove(&pid).is_none() {
        warn!("cannot find pid {} in pid2process", pid);
    }
}

/// Number of live (unreaped) processes.
pub fn process_count() -> usize {
    PID2PCB.exclusive_access().len()
}

/// Whether `pid` refers to a live process.
pub fn pid_is_live(pid: usize) -> bool {
    PID2PCB.exclusive_access().contains_key(&pid)
}

/// The single Blocked → Ready transition point. Every wake source — IPC
/// delivery, device ISRs — funnels through here, so the transition logic
/// exists exactly once. Waking a process that is not blocked is a no-op.
pub fn wakeup_task(pid: usize) -> KernelResult<()> {
    let task = pid2process(pid).ok_or(KernelError::ProcessNotFound)?;
    let mut inner = task.inner_exclusive_access();
    if let ProcessStatus::Blocked(_) = inner.status {
        inner.status = ProcessStatus::Ready;
        drop(inner);
        add_task(task);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::test_util::arena_allocator;
    use crate::mm::AddressSpace;

    extern "C" fn dummy_entry() -> ! {
        unreachable!()
    }

    fn spawn_locally(n: usize) -> (TaskManager, Vec<Arc<ProcessControlBlock>>) {
        let mut fa = arena_allocator(1024);
        let template = AddressSpace::new_kernel_template(&mut fa).unwrap();
        let mut manager = TaskManager::new();
        let mut pcbs = Vec::new();
        for i in 0..n {
            let pcb = ProcessControlBlock::new(
                &format!("p{}", i),
                dummy_entry as usize,
                None,
                &mut fa,
                &template,
            )
            .unwrap();
            manager.add(pcb.clone());
            pcbs.push(pcb);
        }
        (manager, pcbs)
    }

    #[test]
    fn fifo_rotation_is_strict_round_robin() {
        let (mut manager, pcbs) = spawn_locally(4);
        let expected: Vec<usize> = pcbs.iter().map(|p| p.getpid()).collect();
        // three full rotations: every process runs once per period, in the
        // same order each period
        for _ in 0..3 {
            for want in &expected {
                let task = manager.fetch().unwrap();
                assert_eq!(task.getpid(), *want);
                manager.add(task);
            }
        }
        assert_eq!(manager.len(), 4);
    }

    #[test]
    fn a_lone_process_rotates_back_to_itself() {
        let (mut manager, pcbs) = spawn_locally(1);
        // yield with nobody else ready: re-enqueue then fetch hands the
        // same process straight back, no deadlock and no empty pick
        for _ in 0..5 {
            let task = manager.fetch().unwrap();
            assert_eq!(task.getpid(), pcbs[0].getpid());
            manager.add(task);
        }
    }

    #[test]
    fn exited_process_leaves_the_rotation() {
        let (mut manager, pcbs) = spawn_locally(3);
        let dead = pcbs[1].getpid();
        // rotate once; the middle process exits instead of re-enqueueing
        for _ in 0..3 {
            let task = manager.fetch().unwrap();
            if task.getpid() == dead {
                task.inner_exclusive_access().status = ProcessStatus::Zombie;
            } else {
                manager.add(task);
            }
        }
        // the zombie is never fetched again
        for _ in 0..6 {
            let task = manager.fetch().unwrap();
            assert_ne!(task.getpid(), dead);
            manager.add(task);
        }
    }

    #[test]
    fn blocked_process_rejoins_at_the_tail() {
        let (mut manager, pcbs) = spawn_locally(3);
        let blocked = pcbs[0].clone();
        // head process blocks: fetched but not re-enqueued
        let task = manager.fetch().unwrap();
        assert_eq!(task.getpid(), blocked.getpid());
        task.inner_exclusive_access().status =
            ProcessStatus::Blocked(crate::task::BlockedReason::Receive);
        drop(task);
        // the event arrives: ready again, enqueued behind the others
        blocked.inner_exclusive_access().status = ProcessStatus::Ready;
        manager.add(blocked.clone());
        let order: Vec<usize> = (0..3)
            .map(|_| {
                let t = manager.fetch().unwrap();
                let pid = t.getpid();
                manager.add(t);
                pid
            })
            .collect();
        assert_eq!(
            order,
            vec![pcbs[1].getpid(), pcbs[2].getpid(), blocked.getpid()]
        );
    }
}
