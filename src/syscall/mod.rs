//! System-call surface of the core.
//!
//! The dispatcher below is what the (external) trap layer calls once it
//! has validated and translated user pointers; the typed `sys_*` functions
//! are the real entry points and take kernel-valid references. Failures
//! come back as distinct negative codes via `From<KernelError> for isize`
//! — a process sees its own resource problems as error returns, never as a
//! kernel panic.

mod ipc;
mod process;

pub use ipc::{sys_ipc_receive, sys_ipc_send};
pub use process::{sys_exit, sys_yield};

use crate::ipc::Message;

/// exit syscall number
pub const SYSCALL_EXIT: usize = 93;
/// yield syscall number
pub const SYSCALL_YIELD: usize = 124;
/// ipc send syscall number
pub const SYSCALL_IPC_SEND: usize = 401;
/// ipc receive syscall number
pub const SYSCALL_IPC_RECEIVE: usize = 402;

/// Route a validated syscall to its handler.
///
/// # Safety
///
/// Pointer-carrying arguments must already be translated into kernel-valid
/// pointers by the dispatching trap layer.
pub unsafe fn syscall(syscall_id: usize, args: [usize; 3]) -> isize {
    match syscall_id {
        SYSCALL_EXIT => sys_exit(args[0] as i32),
        SYSCALL_YIELD => sys_yield(),
        SYSCALL_IPC_SEND => sys_ipc_send(args[0], &*(args[1] as *const Message)),
        SYSCALL_IPC_RECEIVE => sys_ipc_receive(
            &mut *(args[0] as *mut usize),
            &mut *(args[1] as *mut Message),
        ),
        _ => {
            warn!("unsupported syscall id {}", syscall_id);
            -1
        }
    }
}
