//! Inter-process messaging: one fixed-capacity mailbox per process.
//!
//! A send copies the message into the destination's ring and never blocks;
//! a full mailbox refuses the message outright. A receive drains the
//! caller's own ring and blocks (through the scheduler) while it is empty.
//! The sender pid is stamped by the kernel at the send boundary, so a
//! receiver can trust it regardless of what the sender put in the struct.

use crate::config::{MAILBOX_CAPACITY, MESSAGE_PAYLOAD_LIMIT};
use crate::error::{KernelError, KernelResult};
use crate::task::{
    block_current_and_run_next, current_task, pid2process, wakeup_task, BlockedReason,
    ProcessControlBlock, ProcessStatus,
};
use alloc::sync::Arc;

/// Well-known message kinds used by the system processes; anything else
/// is between the peers.
pub const MSG_PING: u32 = 1;
/// reply to [`MSG_PING`]
pub const MSG_PONG: u32 = 2;

/// One message. Fixed size, `Copy`, no pointers: this layout is the only
/// binary contract that crosses a process boundary.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Message {
    /// pid of the sender, stamped by the kernel on send
    pub sender: usize,
    /// application-defined tag
    pub kind: u32,
    /// valid bytes in `payload`
    pub len: usize,
    /// inline payload, `len` bytes used
    pub payload: [u8; MESSAGE_PAYLOAD_LIMIT],
}

impl Message {
    /// Build a message carrying `bytes`, truncated to the payload limit.
    pub fn new(kind: u32, bytes: &[u8]) -> Self {
        let len = bytes.len().min(MESSAGE_PAYLOAD_LIMIT);
        let mut payload = [0u8; MESSAGE_PAYLOAD_LIMIT];
        payload[..len].copy_from_slice(&bytes[..len]);
        Self {
            sender: 0,
            kind,
            len,
            payload,
        }
    }

    /// The valid prefix of the payload.
    pub fn bytes(&self) -> &[u8] {
        &self.payload[..self.len.min(MESSAGE_PAYLOAD_LIMIT)]
    }

    const fn zeroed() -> Self {
        Self {
            sender: 0,
            kind: 0,
            len: 0,
            payload: [0; MESSAGE_PAYLOAD_LIMIT],
        }
    }
}

/// Fixed-capacity message ring. `head` is the next slot to read; the next
/// slot to write is `head + count`, both mod capacity; `count` never
/// exceeds the capacity.
pub struct Mailbox {
    slots: [Message; MAILBOX_CAPACITY],
    head: usize,
    count: usize,
}

impl Mailbox {
    pub const fn new() -> Self {
        Self {
            slots: [Message::zeroed(); MAILBOX_CAPACITY],
            head: 0,
            count: 0,
        }
    }

    /// Copy a message into the tail slot. A full ring refuses the message
    /// and is left exactly as it was.
    pub fn push(&mut self, msg: Message) -> KernelResult<()> {
        if self.count == MAILBOX_CAPACITY {
            return Err(KernelError::MailboxFull);
        }
        self.slots[(self.head + self.count) % MAILBOX_CAPACITY] = msg;
        self.count += 1;
        Ok(())
    }

    /// Copy the head message out and advance.
    pub fn pop(&mut self) -> Option<Message> {
        if self.count == 0 {
            return None;
        }
        let msg = self.slots[self.head];
        self.head = (self.head + 1) % MAILBOX_CAPACITY;
        self.count -= 1;
        Some(msg)
    }

    /// Messages currently queued.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Whether the ring holds no messages.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

/// Place `msg` in `dest`'s mailbox, reporting whether `dest` was blocked
/// waiting to receive (the caller then owes it a wake). Fails fast on a
/// full mailbox; nothing about `dest` changes on failure.
pub fn deliver(dest: &Arc<ProcessControlBlock>, msg: Message) -> KernelResult<bool> {
    let mut inner = dest.inner_exclusive_access();
    inner.mailbox.push(msg)?;
    Ok(matches!(
        inner.status,
        ProcessStatus::Blocked(BlockedReason::Receive)
    ))
}

/// Send `msg` to `dest_pid` on behalf of `sender_pid`.
///
/// The sender pid is written into the message here, overwriting whatever
/// the caller put there — a process cannot impersonate another. The send
/// never blocks: an unknown destination or a full mailbox is an error
/// returned to the sender.
pub fn send_from(sender_pid: usize, dest_pid: usize, mut msg: Message) -> KernelResult<()> {
    let dest = pid2process(dest_pid).ok_or(KernelError::ProcessNotFound)?;
    msg.sender = sender_pid;
    if deliver(&dest, msg)? {
        wakeup_task(dest_pid)?;
    }
    Ok(())
}

/// Send `msg` from the running process to `dest_pid`.
pub fn send(dest_pid: usize, msg: Message) -> KernelResult<()> {
    let sender_pid = current_task().map(|t| t.getpid()).unwrap_or(0);
    send_from(sender_pid, dest_pid, msg)
}

/// Take the next message from `task`'s mailbox, if any.
pub fn try_receive(task: &Arc<ProcessControlBlock>) -> Option<Message> {
    task.inner_exclusive_access().mailbox.pop()
}

/// Receive the next message for the running process, blocking while its
/// mailbox is empty.
///
/// Blocking means marking the process Blocked-on-receive and entering the
/// scheduler; the matching `send` makes it Ready again. The loop re-checks
/// the mailbox after every wake, so a wake that raced an earlier consumer
/// of the message simply blocks again.
pub fn receive() -> Message {
    loop {
        let task = current_task().expect("receive() requires a running process");
        if let Some(msg) = try_receive(&task) {
            return msg;
        }
        drop(task);
        block_current_and_run_next(BlockedReason::Receive);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(kind: u32, byte: u8) -> Message {
        Message::new(kind, &[byte])
    }

    #[test]
    fn ring_preserves_send_order() {
        let mut mb = Mailbox::new();
        for i in 0..5u8 {
            mb.push(msg(MSG_PING, i)).unwrap();
        }
        for i in 0..5u8 {
            let m = mb.pop().unwrap();
            assert_eq!(m.kind, MSG_PING);
            assert_eq!(m.bytes(), &[i]);
        }
        assert!(mb.pop().is_none());
    }

    #[test]
    fn full_ring_refuses_without_losing_anything() {
        let mut mb = Mailbox::new();
        for i in 0..MAILBOX_CAPACITY {
            mb.push(msg(MSG_PING, i as u8)).unwrap();
        }
        assert_eq!(mb.push(msg(MSG_PING, 0xff)), Err(KernelError::MailboxFull));
        assert_eq!(mb.len(), MAILBOX_CAPACITY);
        // contents are exactly the original messages, in order
        for i in 0..MAILBOX_CAPACITY {
            assert_eq!(mb.pop().unwrap().bytes(), &[i as u8]);
        }
    }

    #[test]
    fn ring_wraps_around() {
        let mut mb = Mailbox::new();
        for round in 0..3 {
            for i in 0..MAILBOX_CAPACITY {
                mb.push(msg(MSG_PONG, (round * 31 + i) as u8)).unwrap();
            }
            for i in 0..MAILBOX_CAPACITY {
                assert_eq!(mb.pop().unwrap().bytes(), &[(round * 31 + i) as u8]);
            }
        }
        assert!(mb.is_empty());
    }

    #[test]
    fn oversized_payloads_are_truncated() {
        let big = [0x5au8; MESSAGE_PAYLOAD_LIMIT + 32];
        let m = Message::new(MSG_PING, &big);
        assert_eq!(m.len, MESSAGE_PAYLOAD_LIMIT);
        assert_eq!(m.bytes().len(), MESSAGE_PAYLOAD_LIMIT);
    }
}
