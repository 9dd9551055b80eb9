//! Constants used across the kernel core.

/// Size of one page / physical frame in bytes.
pub const PAGE_SIZE: usize = 0x1000;
/// log2 of [`PAGE_SIZE`].
pub const PAGE_SIZE_BITS: usize = 0xc;

/// Size of the kernel heap arena handed to the heap allocator at boot.
pub const KERNEL_HEAP_SIZE: usize = 0x30_0000;

/// Size of each process kernel stack, carved from the kernel heap.
pub const KERNEL_STACK_SIZE: usize = 4096 * 4;

/// Timer ticks a process may run before it is preempted.
pub const TIME_SLICE_TICKS: usize = 5;

/// Upper bound on simultaneously live (unreaped) processes.
pub const MAX_PROCESSES: usize = 64;

/// Messages a mailbox can hold before senders are refused.
pub const MAILBOX_CAPACITY: usize = 16;

/// Largest message payload carried inline in a [`crate::ipc::Message`].
pub const MESSAGE_PAYLOAD_LIMIT: usize = 64;

/// Offset of the kernel's direct mapping of physical memory. Physical
/// frames are only ever dereferenced through this mapping. The kernel
/// image itself is linked inside the direct map, so every kernel mapping
/// lives in the upper half.
#[cfg(target_os = "none")]
pub const PHYS_VIRT_OFFSET: usize = 0xffff_8000_0000_0000;

/// On the host test harness physical frames are leased from the host
/// allocator, so the direct map is the identity.
#[cfg(not(target_os = "none"))]
pub const PHYS_VIRT_OFFSET: usize = 0;

/// End of physical memory on the reference machine, used by the bare-metal
/// boot path when the boot layer reports no better bound.
pub const MEMORY_END: usize = 0x800_0000;
