//! Implementation of the physical frame allocator.
//!
//! Every 4 KiB frame of physical memory is tracked by a single bitmap bit;
//! the bitmap is the ground truth for free versus used physical memory.
//! Frames carry no metadata once allocated, so the allocator never hands
//! out a frame twice before it is freed, provided callers only free frames
//! they own.

use super::{PhysAddr, PhysPageNum};
use crate::error::{KernelError, KernelResult};
use crate::sync::UPSafeCell;
use alloc::vec::Vec;
use lazy_static::*;

const BITS_PER_WORD: usize = 64;

/// One range of the boot-supplied physical memory map.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    /// First byte of the range.
    pub base: PhysAddr,
    /// Length in bytes.
    pub len: usize,
    /// Whether the range is usable RAM.
    pub available: bool,
}

/// Interface of the physical frame allocator.
pub trait FrameAllocator {
    fn new() -> Self;
    fn alloc(&mut self) -> KernelResult<PhysPageNum>;
    fn dealloc(&mut self, ppn: PhysPageNum);
}

/// Bitmap frame allocator: one bit per frame, set means used.
///
/// Storage is base-relative to the lowest tracked frame so that machines
/// whose RAM starts high do not pay for the hole below it.
pub struct BitmapFrameAllocator {
    /// bitmap words, 1 = used
    bitmap: Vec<u64>,
    /// first tracked frame
    base: usize,
    /// number of tracked frames
    frames: usize,
    /// current number of free frames
    free: usize,
}

impl BitmapFrameAllocator {
    /// Consume the boot memory map plus the kernel's own range.
    ///
    /// Every tracked frame starts used; frames fully inside an available
    /// region are then freed, and the kernel range is re-reserved on top so
    /// the kernel image never gets handed out as a free frame.
    pub fn init(
        &mut self,
        regions: &[MemoryRegion],
        kernel_start: PhysAddr,
        kernel_end: PhysAddr,
    ) {
        let mut lo = usize::MAX;
        let mut hi = 0;
        for region in regions.iter().filter(|r| r.available) {
            lo = lo.min(region.base.ceil().0);
            hi = hi.max(PhysAddr(region.base.0 + region.len).floor().0);
        }
        if lo >= hi {
            warn!("frame allocator: boot map contains no available frames");
            return;
        }
        self.base = lo;
        self.frames = hi - lo;
        self.free = 0;
        self.bitmap.clear();
        self.bitmap
            .resize(self.frames.div_ceil(BITS_PER_WORD), !0u64);
        for region in regions.iter().filter(|r| r.available) {
            let start = region.base.ceil().0;
            let end = PhysAddr(region.base.0 + region.len).floor().0;
            for ppn in start..end {
                if self.test(ppn) {
                    self.clear(ppn);
                    self.free += 1;
                }
            }
        }
        // the kernel image and its boot structures are never allocatable
        let kstart = kernel_start.floor().0;
        let kend = kernel_end.ceil().0;
        for ppn in kstart..kend {
            if self.in_range(ppn) && !self.test(ppn) {
                self.set(ppn);
                self.free -= 1;
            }
        }
        info!(
            "frame allocator: tracking frames {:#x}..{:#x}, {} free",
            self.base,
            self.base + self.frames,
            self.free
        );
    }

    /// Allocate the first run of `count` physically contiguous frames.
    ///
    /// A plain linear scan: O(total frames), restarting after every
    /// collision. External fragmentation is accepted for that simplicity.
    pub fn alloc_contiguous(&mut self, count: usize) -> KernelResult<PhysPageNum> {
        if count == 0 || count > self.frames {
            return Err(KernelError::ResourceExhausted);
        }
        let mut run_start = 0;
        let mut run_len = 0;
        for ppn in self.base..self.base + self.frames {
            if self.test(ppn) {
                run_len = 0;
                continue;
            }
            if run_len == 0 {
                run_start = ppn;
            }
            run_len += 1;
            if run_len == count {
                for p in run_start..run_start + count {
                    self.set(p);
                }
                self.free -= count;
                return Ok(PhysPageNum(run_start));
            }
        }
        Err(KernelError::ResourceExhausted)
    }

    /// Number of frames currently free.
    pub fn free_frames(&self) -> usize {
        self.free
    }

    /// Number of frames tracked in total.
    pub fn total_frames(&self) -> usize {
        self.frames
    }

    fn in_range(&self, ppn: usize) -> bool {
        ppn >= self.base && ppn < self.base + self.frames
    }

    fn test(&self, ppn: usize) -> bool {
        let idx = ppn - self.base;
        self.bitmap[idx / BITS_PER_WORD] & (1 << (idx % BITS_PER_WORD)) != 0
    }

    fn set(&mut self, ppn: usize) {
        let idx = ppn - self.base;
        self.bitmap[idx / BITS_PER_WORD] |= 1 << (idx % BITS_PER_WORD);
    }

    fn clear(&mut self, ppn: usize) {
        let idx = ppn - self.base;
        self.bitmap[idx / BITS_PER_WORD] &= !(1 << (idx % BITS_PER_WORD));
    }
}

impl FrameAllocator for BitmapFrameAllocator {
    fn new() -> Self {
        Self {
            bitmap: Vec::new(),
            base: 0,
            frames: 0,
            free: 0,
        }
    }

    /// Allocate the lowest-numbered free frame.
    fn alloc(&mut self) -> KernelResult<PhysPageNum> {
        for (word_idx, word) in self.bitmap.iter().enumerate() {
            if *word == !0u64 {
                continue;
            }
            let bit = word.trailing_ones() as usize;
            let idx = word_idx * BITS_PER_WORD + bit;
            if idx >= self.frames {
                break;
            }
            let ppn = self.base + idx;
            self.set(ppn);
            self.free -= 1;
            return Ok(PhysPageNum(ppn));
        }
        Err(KernelError::OutOfMemory)
    }

    /// Return a frame to the allocator.
    ///
    /// An out-of-range or already-free target is reported and ignored:
    /// frames carry no ownership metadata to validate against, so the
    /// bitmap is left exactly as it was.
    fn dealloc(&mut self, ppn: PhysPageNum) {
        if !self.in_range(ppn.0) {
            warn!("frame dealloc: {:?} outside tracked range, ignored", ppn);
            return;
        }
        if !self.test(ppn.0) {
            warn!("frame dealloc: {:?} is already free, ignored", ppn);
            return;
        }
        self.clear(ppn.0);
        self.free += 1;
    }
}

/// The frame allocator implementation used by the kernel.
pub type FrameAllocatorImpl = BitmapFrameAllocator;

lazy_static! {
    /// The kernel's frame allocator instance.
    pub static ref FRAME_ALLOCATOR: UPSafeCell<FrameAllocatorImpl> =
        unsafe { UPSafeCell::new(FrameAllocatorImpl::new()) };
}

/// Feed the boot memory map to the kernel's frame allocator.
pub fn init_frame_allocator(
    regions: &[MemoryRegion],
    kernel_start: PhysAddr,
    kernel_end: PhysAddr,
) {
    FRAME_ALLOCATOR
        .exclusive_access()
        .init(regions, kernel_start, kernel_end);
}

/// Allocate one frame from the kernel's allocator.
pub fn frame_alloc() -> KernelResult<PhysPageNum> {
    FRAME_ALLOCATOR.exclusive_access().alloc()
}

/// Return one frame to the kernel's allocator.
pub fn frame_dealloc(ppn: PhysPageNum) {
    FRAME_ALLOCATOR.exclusive_access().dealloc(ppn);
}
