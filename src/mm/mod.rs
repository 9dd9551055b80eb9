//! Memory management: physical frames, the kernel heap, 4-level page
//! tables and address spaces.
//!
//! Every subsystem here is an owned value type; the statics at the bottom
//! of `frame_allocator` and `address_space` wire single instances together
//! for the running kernel, while tests construct their own instances over
//! host-provided arenas.

pub mod address;
pub mod frame_allocator;
pub mod heap_allocator;
pub mod page_table;
pub(crate) mod address_space;

pub use address::{PhysAddr, PhysPageNum, StepByOne, VirtAddr, VirtPageNum, VPNRange};
pub use address_space::{AddressSpace, AddressSpaceKind, MapPermission, MapType};
#[cfg(target_os = "none")]
pub use address_space::{kernel_token, KERNEL_SPACE};
pub use frame_allocator::{
    frame_alloc, frame_dealloc, init_frame_allocator, BitmapFrameAllocator, FrameAllocator,
    FrameAllocatorImpl, MemoryRegion, FRAME_ALLOCATOR,
};
pub use heap_allocator::{HeapAllocator, LockedHeap};
pub use page_table::{PTEFlags, PageTable, PageTableEntry};

/// Bring up the memory subsystems in dependency order: the heap first
/// (the frame allocator's bitmap lives there), then the frame bitmap from
/// the boot memory map, then the kernel address space.
#[cfg(target_os = "none")]
pub fn init(regions: &[MemoryRegion], kernel_start: PhysAddr, kernel_end: PhysAddr) {
    heap_allocator::init_heap();
    init_frame_allocator(regions, kernel_start, kernel_end);
    KERNEL_SPACE.exclusive_access().activate();
}
