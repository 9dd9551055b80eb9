//! IPC syscalls.

use crate::ipc::{receive, send, Message};

/// Send `msg` to `dest_pid`. The kernel stamps the true sender pid; a
/// full mailbox or an unknown destination is an immediate error return,
/// the sender is never blocked.
pub fn sys_ipc_send(dest_pid: usize, msg: &Message) -> isize {
    match send(dest_pid, *msg) {
        Ok(()) => 0,
        Err(err) => err.into(),
    }
}

/// Receive the next message for the calling process, blocking while its
/// mailbox is empty. Sender pid and message are written through the given
/// references.
pub fn sys_ipc_receive(sender: &mut usize, msg: &mut Message) -> isize {
    let received = receive();
    *sender = received.sender;
    *msg = received;
    0
}
