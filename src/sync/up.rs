//! Uniprocessor interior mutability cell.

use core::cell::{RefCell, RefMut};

/// Wrap a static data structure inside it so that we are able to access it
/// without any `unsafe` at the use site.
///
/// We should only use it on a single-CPU kernel, and the trap layer must
/// enter this crate with interrupts disabled: under those two conditions a
/// `RefCell` borrow is equivalent to holding a lock, which is exactly the
/// discipline the scheduler and the allocators require around their shared
/// state. A nested borrow means the discipline was violated and panics
/// immediately instead of corrupting the structure.
pub struct UPSafeCell<T> {
    /// inner data
    inner: RefCell<T>,
}

unsafe impl<T> Sync for UPSafeCell<T> {}

impl<T> UPSafeCell<T> {
    /// User is responsible to guarantee that inner struct is only used in
    /// uniprocessor.
    pub unsafe fn new(value: T) -> Self {
        Self {
            inner: RefCell::new(value),
        }
    }

    /// Exclusive access to the inner data. Panics if the data has been
    /// borrowed already.
    pub fn exclusive_access(&self) -> RefMut<'_, T> {
        self.inner.borrow_mut()
    }
}
