//! Scenario tests driving the kernel-facing glue: the global frame
//! allocator, the pid table, the ready queue and the IPC paths, wired
//! together the way the running kernel wires them.
//!
//! The globals are shared by every test in this binary, so each test takes
//! the file-wide lock and cleans up what it registered. "Physical" frames
//! are leased once from the host allocator; the direct map is the identity
//! on the host, so the kernel code paths run unchanged.

use osmium::config::{MAILBOX_CAPACITY, MAX_PROCESSES, PAGE_SIZE};
use osmium::ipc::{self, Message, MSG_PING};
use osmium::mm::{
    init_frame_allocator, AddressSpace, MemoryRegion, PhysAddr, FRAME_ALLOCATOR,
};
use osmium::task::{
    fetch_task, insert_into_pid2process, pid_is_live, reap, remove_from_pid2process,
    BlockedReason, ProcessControlBlock, ProcessStatus,
};
use osmium::KernelError;
use std::alloc::Layout;
use std::sync::{Arc, Mutex, MutexGuard, Once};

const ARENA_FRAMES: usize = 4096;

static GLOBALS: Mutex<()> = Mutex::new(());
static ARENA: Once = Once::new();

/// Serialize access to the kernel globals and make sure the frame
/// allocator has its arena.
fn lock_globals() -> MutexGuard<'static, ()> {
    let guard = GLOBALS.lock().unwrap_or_else(|e| e.into_inner());
    ARENA.call_once(|| {
        let layout = Layout::from_size_align(ARENA_FRAMES * PAGE_SIZE, PAGE_SIZE).unwrap();
        let base = unsafe { std::alloc::alloc_zeroed(layout) } as usize;
        assert!(base != 0);
        let regions = [MemoryRegion {
            base: PhysAddr(base),
            len: ARENA_FRAMES * PAGE_SIZE,
            available: true,
        }];
        init_frame_allocator(&regions, PhysAddr(0), PhysAddr(0));
    });
    guard
}

extern "C" fn dummy_entry() -> ! {
    unreachable!()
}

fn kernel_template() -> AddressSpace {
    let mut fa = FRAME_ALLOCATOR.exclusive_access();
    AddressSpace::new_kernel_template(&mut fa).unwrap()
}

fn spawn_registered(name: &str, template: &AddressSpace) -> Arc<ProcessControlBlock> {
    let pcb = {
        let mut fa = FRAME_ALLOCATOR.exclusive_access();
        ProcessControlBlock::new(name, dummy_entry as usize, None, &mut fa, template).unwrap()
    };
    insert_into_pid2process(pcb.getpid(), Arc::clone(&pcb)).unwrap();
    pcb
}

fn unregister(pcb: &Arc<ProcessControlBlock>) {
    remove_from_pid2process(pcb.getpid());
}

fn drain_ready_queue() {
    while fetch_task().is_some() {}
}

#[test]
fn blocked_receiver_wakes_on_send() {
    let _guard = lock_globals();
    let template = kernel_template();
    let a = spawn_registered("ping-sender", &template);
    let b = spawn_registered("ping-receiver", &template);

    // B finds its mailbox empty and blocks in receive()
    assert!(ipc::try_receive(&b).is_none());
    b.inner_exclusive_access().status = ProcessStatus::Blocked(BlockedReason::Receive);

    // A sends while B is blocked; the call returns success immediately
    ipc::send_from(a.getpid(), b.getpid(), Message::new(MSG_PING, b"x")).unwrap();

    // B became Ready and was enqueued, within this one scheduling pass
    assert_eq!(b.inner_exclusive_access().status, ProcessStatus::Ready);
    let woken = fetch_task().expect("receiver must be queued after the send");
    assert_eq!(woken.getpid(), b.getpid());

    // and receive() now completes with the message, correctly stamped
    let msg = ipc::try_receive(&b).unwrap();
    assert_eq!(msg.sender, a.getpid());
    assert_eq!(msg.kind, MSG_PING);
    assert_eq!(msg.bytes(), b"x");

    drain_ready_queue();
    unregister(&a);
    unregister(&b);
}

#[test]
fn full_mailbox_refuses_the_sender_without_side_effects() {
    let _guard = lock_globals();
    let template = kernel_template();
    let a = spawn_registered("flooder", &template);
    let b = spawn_registered("flooded", &template);

    for i in 0..MAILBOX_CAPACITY {
        ipc::send_from(a.getpid(), b.getpid(), Message::new(MSG_PING, &[i as u8])).unwrap();
    }
    let status_before = b.inner_exclusive_access().status;
    assert_eq!(
        ipc::send_from(a.getpid(), b.getpid(), Message::new(MSG_PING, b"overflow")),
        Err(KernelError::MailboxFull)
    );
    // the refused send changed nothing: same status, same queue, same
    // messages in the same order
    assert_eq!(b.inner_exclusive_access().status, status_before);
    assert!(fetch_task().is_none());
    for i in 0..MAILBOX_CAPACITY {
        assert_eq!(ipc::try_receive(&b).unwrap().bytes(), &[i as u8]);
    }
    assert!(ipc::try_receive(&b).is_none());

    unregister(&a);
    unregister(&b);
}

#[test]
fn messages_from_one_sender_arrive_in_send_order() {
    let _guard = lock_globals();
    let template = kernel_template();
    let a = spawn_registered("ordered-sender", &template);
    let b = spawn_registered("ordered-receiver", &template);

    for word in [b"one".as_slice(), b"two", b"three"] {
        ipc::send_from(a.getpid(), b.getpid(), Message::new(MSG_PING, word)).unwrap();
    }
    assert_eq!(ipc::try_receive(&b).unwrap().bytes(), b"one");
    assert_eq!(ipc::try_receive(&b).unwrap().bytes(), b"two");
    assert_eq!(ipc::try_receive(&b).unwrap().bytes(), b"three");

    drain_ready_queue();
    unregister(&a);
    unregister(&b);
}

#[test]
fn sending_to_an_unknown_pid_fails() {
    let _guard = lock_globals();
    assert_eq!(
        ipc::send_from(1, 0xdead, Message::new(MSG_PING, b"?")),
        Err(KernelError::ProcessNotFound)
    );
}

#[test]
fn sender_pid_cannot_be_forged() {
    let _guard = lock_globals();
    let template = kernel_template();
    let a = spawn_registered("honest", &template);
    let b = spawn_registered("target", &template);

    let mut forged = Message::new(MSG_PING, b"spoof");
    forged.sender = 0x7777; // claimed identity is discarded at the boundary
    ipc::send_from(a.getpid(), b.getpid(), forged).unwrap();
    assert_eq!(ipc::try_receive(&b).unwrap().sender, a.getpid());

    drain_ready_queue();
    unregister(&a);
    unregister(&b);
}

#[test]
fn reaping_a_zombie_returns_its_frames_and_slot() {
    let _guard = lock_globals();
    let template = kernel_template();
    let free_before = FRAME_ALLOCATOR.exclusive_access().free_frames();

    let c = spawn_registered("short-lived", &template);
    let pid = c.getpid();
    assert!(FRAME_ALLOCATOR.exclusive_access().free_frames() < free_before);

    // a running process cannot be reaped
    assert_eq!(reap(pid), Err(KernelError::ProcessNotFound));

    // it exits; the zombie keeps its slot and exit code until reaped
    {
        let mut inner = c.inner_exclusive_access();
        inner.status = ProcessStatus::Zombie;
        inner.exit_code = 42;
    }
    drop(c);
    assert!(pid_is_live(pid));
    assert_eq!(reap(pid), Ok(42));
    assert!(!pid_is_live(pid));
    assert_eq!(
        FRAME_ALLOCATOR.exclusive_access().free_frames(),
        free_before
    );
    // the pid is gone for good
    assert_eq!(reap(pid), Err(KernelError::ProcessNotFound));
}

#[test]
fn process_table_capacity_is_bounded() {
    let _guard = lock_globals();
    let template = kernel_template();
    let pcb = spawn_registered("slot-filler", &template);

    // occupy every remaining slot with aliases under unused pids
    let fake_base = 1_000_000;
    let mut inserted = Vec::new();
    for i in 0..MAX_PROCESSES {
        let pid = fake_base + i;
        match insert_into_pid2process(pid, Arc::clone(&pcb)) {
            Ok(()) => inserted.push(pid),
            Err(err) => {
                assert_eq!(err, KernelError::ResourceExhausted);
                break;
            }
        }
    }
    assert!(inserted.len() < MAX_PROCESSES);
    assert_eq!(
        insert_into_pid2process(fake_base + MAX_PROCESSES, Arc::clone(&pcb)),
        Err(KernelError::ResourceExhausted)
    );

    for pid in inserted {
        remove_from_pid2process(pid);
    }
    unregister(&pcb);
}
