//! Process syscalls.

use crate::task::{exit_current_and_run_next, yield_now};

/// End the calling process with `exit_code`. Does not return.
pub fn sys_exit(exit_code: i32) -> ! {
    exit_current_and_run_next(exit_code);
    panic!("unreachable after exit_current_and_run_next");
}

/// Give up the rest of the current time slice.
pub fn sys_yield() -> isize {
    yield_now();
    0
}
