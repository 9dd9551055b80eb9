//! Implementation of the kernel heap allocator.
//!
//! One statically sized arena, carved into blocks by in-place headers that
//! form a doubly linked list spanning the whole arena with no gaps.
//! Allocation is first fit with in-place splitting; freeing validates the
//! header magic and immediately coalesces with both neighbors, so two
//! adjacent free blocks never survive a call. Bad frees (foreign pointer,
//! trashed header, double free) are detected, logged and refused — the
//! offending state is left untouched rather than guessed at.

#[cfg(target_os = "none")]
use crate::config::KERNEL_HEAP_SIZE;
use crate::error::{KernelError, KernelResult};
use core::alloc::{GlobalAlloc, Layout};
use core::mem::size_of;
use core::ptr::{self, NonNull};
use spin::Mutex;

/// Stamp written into every live header; a mismatch on free means the
/// caller's pointer never came from this allocator or the header was
/// overwritten.
const HEAP_BLOCK_MAGIC: u32 = 0x8ead_b10c;

/// Payload alignment guaranteed by plain `alloc`; also the size quantum.
const MIN_ALIGN: usize = 16;

/// Smallest payload worth keeping as a separate block after a split.
const MIN_BLOCK_SIZE: usize = 16;

const HEADER_SIZE: usize = size_of::<BlockHeader>();

/// Header preceding every block, free or used.
#[repr(C)]
struct BlockHeader {
    /// payload bytes following this header
    size: usize,
    /// whether the payload is currently free
    is_free: bool,
    /// validation stamp, [`HEAP_BLOCK_MAGIC`]
    magic: u32,
    /// previous block in the arena, null for the first
    prev: *mut BlockHeader,
    /// next block in the arena, null for the last
    next: *mut BlockHeader,
}

#[inline]
const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// First-fit heap allocator over one contiguous arena.
pub struct HeapAllocator {
    /// first block header, null before `init`
    head: *mut BlockHeader,
    arena_start: usize,
    arena_size: usize,
}

unsafe impl Send for HeapAllocator {}

impl HeapAllocator {
    /// An allocator with no arena; every request fails until `init`.
    pub const fn empty() -> Self {
        Self {
            head: ptr::null_mut(),
            arena_start: 0,
            arena_size: 0,
        }
    }

    /// Adopt `[start, start + size)` as the arena, writing the single free
    /// block that spans it.
    ///
    /// # Safety
    ///
    /// The range must be valid, writable, 16-byte aligned and exclusively
    /// owned by this allocator; `init` must be called at most once.
    pub unsafe fn init(&mut self, start: usize, size: usize) {
        assert_eq!(start % MIN_ALIGN, 0);
        assert!(size > HEADER_SIZE + MIN_BLOCK_SIZE);
        let head = start as *mut BlockHeader;
        ptr::write(
            head,
            BlockHeader {
                size: size - HEADER_SIZE,
                is_free: true,
                magic: HEAP_BLOCK_MAGIC,
                prev: ptr::null_mut(),
                next: ptr::null_mut(),
            },
        );
        self.head = head;
        self.arena_start = start;
        self.arena_size = size;
    }

    /// Allocate `size` bytes with the default 16-byte alignment.
    pub fn alloc(&mut self, size: usize) -> KernelResult<NonNull<u8>> {
        self.alloc_aligned(size, MIN_ALIGN)
    }

    /// Allocate `size` bytes aligned to `align` (a power of two).
    ///
    /// First fit: the arena is walked front to back and the first free
    /// block that can hold the request is used. When the chosen block can
    /// donate an aligned payload only past its own start, a leading free
    /// block is split off; when it is larger than needed, the tail is split
    /// off. Either way headers stay gapless across the arena.
    pub fn alloc_aligned(&mut self, size: usize, align: usize) -> KernelResult<NonNull<u8>> {
        let req = align_up(size.max(1), MIN_ALIGN);
        let align = align.max(MIN_ALIGN);
        let mut cur = self.head;
        while !cur.is_null() {
            unsafe {
                if (*cur).is_free && (*cur).size >= req {
                    let data = cur as usize + HEADER_SIZE;
                    if data % align == 0 {
                        self.carve(cur, req);
                        return Ok(NonNull::new_unchecked(data as *mut u8));
                    } else if let Some(inner) = self.carve_aligned(cur, req, align) {
                        return Ok(inner);
                    }
                }
                cur = (*cur).next;
            }
        }
        Err(KernelError::OutOfMemory)
    }

    /// `alloc` plus zero fill.
    pub fn zalloc(&mut self, size: usize) -> KernelResult<NonNull<u8>> {
        let data = self.alloc(size)?;
        unsafe {
            ptr::write_bytes(data.as_ptr(), 0, align_up(size.max(1), MIN_ALIGN));
        }
        Ok(data)
    }

    /// Return a block to the arena.
    ///
    /// The header is recovered from the pointer and validated before
    /// anything is modified; a foreign pointer, a trashed magic or a block
    /// that is already free aborts the operation with
    /// [`KernelError::Corruption`]. A valid free coalesces with the next
    /// and previous neighbors unconditionally before returning.
    pub fn free(&mut self, data: *mut u8) -> KernelResult<()> {
        let addr = data as usize;
        if addr % MIN_ALIGN != 0
            || addr < self.arena_start + HEADER_SIZE
            || addr >= self.arena_start + self.arena_size
        {
            error!("heap free: pointer {:#x} is not from this arena", addr);
            return Err(KernelError::Corruption);
        }
        let hdr = (addr - HEADER_SIZE) as *mut BlockHeader;
        unsafe {
            if (*hdr).magic != HEAP_BLOCK_MAGIC {
                error!(
                    "heap free: bad magic {:#x} at {:#x}, header overwritten?",
                    (*hdr).magic,
                    addr
                );
                return Err(KernelError::Corruption);
            }
            if (*hdr).is_free {
                error!("heap free: double free of {:#x}", addr);
                return Err(KernelError::Corruption);
            }
            (*hdr).is_free = true;
            let next = (*hdr).next;
            if !next.is_null() && (*next).is_free {
                Self::absorb(hdr, next);
            }
            let prev = (*hdr).prev;
            if !prev.is_null() && (*prev).is_free {
                Self::absorb(prev, hdr);
            }
        }
        Ok(())
    }

    /// Total free payload bytes in the arena.
    pub fn free_bytes(&self) -> usize {
        let mut total = 0;
        let mut cur = self.head;
        while !cur.is_null() {
            unsafe {
                if (*cur).is_free {
                    total += (*cur).size;
                }
                cur = (*cur).next;
            }
        }
        total
    }

    /// Payload size of the largest free block.
    pub fn largest_free_block(&self) -> usize {
        let mut largest = 0;
        let mut cur = self.head;
        while !cur.is_null() {
            unsafe {
                if (*cur).is_free {
                    largest = largest.max((*cur).size);
                }
                cur = (*cur).next;
            }
        }
        largest
    }

    /// Number of blocks, free and used, spanning the arena.
    pub fn block_count(&self) -> usize {
        let mut count = 0;
        let mut cur = self.head;
        while !cur.is_null() {
            count += 1;
            cur = unsafe { (*cur).next };
        }
        count
    }

    /// Mark `block` used for a `req`-byte payload, splitting off the tail
    /// when the remainder can stand on its own.
    ///
    /// `block` must be free with `size >= req`.
    unsafe fn carve(&mut self, block: *mut BlockHeader, req: usize) {
        let spare = (*block).size - req;
        if spare >= HEADER_SIZE + MIN_BLOCK_SIZE {
            let tail = (block as usize + HEADER_SIZE + req) as *mut BlockHeader;
            ptr::write(
                tail,
                BlockHeader {
                    size: spare - HEADER_SIZE,
                    is_free: true,
                    magic: HEAP_BLOCK_MAGIC,
                    prev: block,
                    next: (*block).next,
                },
            );
            if !(*tail).next.is_null() {
                (*(*tail).next).prev = tail;
            }
            (*block).next = tail;
            (*block).size = req;
        }
        (*block).is_free = false;
    }

    /// Split `block` so a `req`-byte payload lands on an `align` boundary,
    /// keeping the leading remainder as a free block. Returns the payload
    /// pointer, or `None` when the block cannot fit the shifted request.
    unsafe fn carve_aligned(
        &mut self,
        block: *mut BlockHeader,
        req: usize,
        align: usize,
    ) -> Option<NonNull<u8>> {
        let data = block as usize + HEADER_SIZE;
        // the leading remainder must itself be a whole block
        let shifted = align_up(data + MIN_BLOCK_SIZE + HEADER_SIZE, align);
        if shifted + req > data + (*block).size {
            return None;
        }
        let inner = (shifted - HEADER_SIZE) as *mut BlockHeader;
        ptr::write(
            inner,
            BlockHeader {
                size: data + (*block).size - shifted,
                is_free: true,
                magic: HEAP_BLOCK_MAGIC,
                prev: block,
                next: (*block).next,
            },
        );
        if !(*inner).next.is_null() {
            (*(*inner).next).prev = inner;
        }
        (*block).next = inner;
        (*block).size = (inner as usize) - data;
        self.carve(inner, req);
        Some(NonNull::new_unchecked(shifted as *mut u8))
    }

    /// Merge the free block `right` into the free block `left`; the two
    /// must be physically adjacent.
    unsafe fn absorb(left: *mut BlockHeader, right: *mut BlockHeader) {
        (*left).size += HEADER_SIZE + (*right).size;
        (*left).next = (*right).next;
        if !(*right).next.is_null() {
            (*(*right).next).prev = left;
        }
    }
}

/// The kernel heap: the first-fit allocator behind a spin lock, suitable
/// for registration as the global allocator.
pub struct LockedHeap(Mutex<HeapAllocator>);

impl LockedHeap {
    pub const fn empty() -> Self {
        Self(Mutex::new(HeapAllocator::empty()))
    }

    pub fn lock(&self) -> spin::MutexGuard<'_, HeapAllocator> {
        self.0.lock()
    }
}

unsafe impl GlobalAlloc for LockedHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.0
            .lock()
            .alloc_aligned(layout.size(), layout.align())
            .map(|p| p.as_ptr())
            .unwrap_or(ptr::null_mut())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let _ = self.0.lock().free(ptr);
    }
}

#[cfg(target_os = "none")]
#[global_allocator]
/// heap allocator instance
static HEAP_ALLOCATOR: LockedHeap = LockedHeap::empty();

#[cfg(target_os = "none")]
#[alloc_error_handler]
/// panic when heap allocation error occurs
pub fn handle_alloc_error(layout: Layout) -> ! {
    panic!("heap allocation error, layout = {:?}", layout);
}

/// heap space, a [`KERNEL_HEAP_SIZE`]-byte array in kernel bss
#[cfg(target_os = "none")]
#[repr(C, align(16))]
struct HeapSpace([u8; KERNEL_HEAP_SIZE]);

#[cfg(target_os = "none")]
static mut HEAP_SPACE: HeapSpace = HeapSpace([0; KERNEL_HEAP_SIZE]);

/// Hand the static arena to the kernel heap.
#[cfg(target_os = "none")]
pub fn init_heap() {
    unsafe {
        HEAP_ALLOCATOR.lock().init(
            ptr::addr_of_mut!(HEAP_SPACE) as usize,
            KERNEL_HEAP_SIZE,
        );
    }
}
