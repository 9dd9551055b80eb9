//! Implementation of [`PageTableEntry`] and [`PageTable`].
//!
//! Four levels of 512-entry tables, indexed by the 9-bit slices of a
//! 48-bit virtual address. Tables live in physical frames and are only
//! ever touched through the direct map; entries are plain integers
//! (`physical address | flags`), never language-level pointers. A
//! `PageTable` keeps a ledger of every table frame it allocated so that
//! releasing an address space returns exactly those frames and nothing
//! else — the kernel half, reached through entries copied from the kernel
//! root, is never in the ledger and never freed here.

use super::frame_allocator::FrameAllocatorImpl;
use super::{FrameAllocator, PhysAddr, PhysPageNum, VirtAddr, VirtPageNum};
use crate::error::{KernelError, KernelResult};
use crate::mm::address::{KERNEL_HALF_START, PAGE_TABLE_LEVELS};
use alloc::vec;
use alloc::vec::Vec;
use bitflags::*;

bitflags! {
    /// Page-table entry flags, x86-64 bit layout.
    pub struct PTEFlags: u64 {
        /// entry is valid
        const PRESENT = 1 << 0;
        /// page may be written
        const WRITABLE = 1 << 1;
        /// page is reachable from user mode
        const USER = 1 << 2;
        /// entry maps a 2 MiB / 1 GiB page instead of a further table
        const HUGE = 1 << 7;
        /// page must not be executed
        const NO_EXECUTE = 1 << 63;
    }
}

#[derive(Copy, Clone)]
#[repr(C)]
/// page table entry structure
pub struct PageTableEntry {
    /// physical address and flags
    pub bits: usize,
}

impl PageTableEntry {
    /// Build an entry from a frame number and flags.
    pub fn new(ppn: PhysPageNum, flags: PTEFlags) -> Self {
        PageTableEntry {
            bits: ppn.0 << 12 | flags.bits() as usize,
        }
    }
    /// An empty (non-present) entry.
    pub fn empty() -> Self {
        PageTableEntry { bits: 0 }
    }
    /// Frame number stored in the entry.
    pub fn ppn(&self) -> PhysPageNum {
        (self.bits >> 12 & ((1usize << 40) - 1)).into()
    }
    /// Flags stored in the entry.
    pub fn flags(&self) -> PTEFlags {
        PTEFlags::from_bits_truncate(self.bits as u64)
    }
    /// Whether the entry is present.
    pub fn is_valid(&self) -> bool {
        self.flags().contains(PTEFlags::PRESENT)
    }
    /// Whether the entry maps a huge page.
    pub fn is_huge(&self) -> bool {
        self.flags().contains(PTEFlags::HUGE)
    }
    /// Whether the mapped page is writable.
    pub fn writable(&self) -> bool {
        self.flags().contains(PTEFlags::WRITABLE)
    }
    /// Whether the mapped page is user accessible.
    pub fn user(&self) -> bool {
        self.flags().contains(PTEFlags::USER)
    }
}

/// One 4-level page-table tree.
pub struct PageTable {
    root_ppn: PhysPageNum,
    /// root and intermediate table frames allocated by this instance
    table_frames: Vec<PhysPageNum>,
}

impl PageTable {
    /// Allocate and zero a fresh root table.
    pub fn new(alloc: &mut FrameAllocatorImpl) -> KernelResult<Self> {
        let frame = alloc.alloc()?;
        frame.bytes_array().fill(0);
        Ok(PageTable {
            root_ppn: frame,
            table_frames: vec![frame],
        })
    }

    /// Allocate a fresh root and copy the kernel-half entries from
    /// `kernel`'s root, so the new table shares the kernel's upper-half
    /// table tree.
    pub fn from_kernel_root(
        kernel: &PageTable,
        alloc: &mut FrameAllocatorImpl,
    ) -> KernelResult<Self> {
        let table = Self::new(alloc)?;
        let src = kernel.root_ppn.pte_array();
        let dst = table.root_ppn.pte_array();
        dst[KERNEL_HALF_START..].copy_from_slice(&src[KERNEL_HALF_START..]);
        Ok(table)
    }

    /// Walk to the leaf entry for `vpn`, allocating any absent
    /// intermediate table zero-filled and `PRESENT | WRITABLE`.
    fn find_pte_create(
        &mut self,
        vpn: VirtPageNum,
        alloc: &mut FrameAllocatorImpl,
    ) -> KernelResult<&mut PageTableEntry> {
        let idxs = vpn.indexes();
        let mut ppn = self.root_ppn;
        for (i, idx) in idxs.iter().enumerate() {
            let pte = &mut ppn.pte_array()[*idx];
            if i == PAGE_TABLE_LEVELS - 1 {
                return Ok(pte);
            }
            if pte.is_valid() && pte.is_huge() {
                // a huge mapping occupies this slice; no 4 KiB leaf exists
                warn!("page table: huge entry blocks 4 KiB walk at {:?}", vpn);
                return Err(KernelError::InvalidAddress);
            }
            if !pte.is_valid() {
                let frame = alloc.alloc()?;
                frame.bytes_array().fill(0);
                *pte = PageTableEntry::new(frame, PTEFlags::PRESENT | PTEFlags::WRITABLE);
                self.table_frames.push(frame);
            }
            ppn = pte.ppn();
        }
        unreachable!()
    }

    /// Walk to the leaf entry for `vpn` without modifying the tree;
    /// `None` when any level on the way is absent or huge.
    fn find_pte(&self, vpn: VirtPageNum) -> Option<&mut PageTableEntry> {
        let idxs = vpn.indexes();
        let mut ppn = self.root_ppn;
        for (i, idx) in idxs.iter().enumerate() {
            let pte = &mut ppn.pte_array()[*idx];
            if i == PAGE_TABLE_LEVELS - 1 {
                return Some(pte);
            }
            if !pte.is_valid() || pte.is_huge() {
                return None;
            }
            ppn = pte.ppn();
        }
        unreachable!()
    }

    /// Install a 4 KiB mapping `vpn -> ppn`.
    ///
    /// Mapping over a present leaf is refused: the caller asked to alias a
    /// translation that already exists, which is its bug to resolve.
    pub fn map(
        &mut self,
        vpn: VirtPageNum,
        ppn: PhysPageNum,
        flags: PTEFlags,
        alloc: &mut FrameAllocatorImpl,
    ) -> KernelResult<()> {
        let pte = self.find_pte_create(vpn, alloc)?;
        if pte.is_valid() {
            warn!("page table: {:?} is mapped before mapping", vpn);
            return Err(KernelError::InvalidAddress);
        }
        *pte = PageTableEntry::new(ppn, flags | PTEFlags::PRESENT);
        Ok(())
    }

    /// Remove the 4 KiB mapping of `vpn` and invalidate that single
    /// translation. Intermediate tables are not reclaimed.
    ///
    /// An absent mapping is "not found", reported as `InvalidAddress`;
    /// callers are free to treat it as benign.
    pub fn unmap(&mut self, vpn: VirtPageNum) -> KernelResult<()> {
        match self.find_pte(vpn) {
            Some(pte) if pte.is_valid() => {
                *pte = PageTableEntry::empty();
                invalidate_translation(vpn);
                Ok(())
            }
            _ => {
                debug!("page table: {:?} is not mapped", vpn);
                Err(KernelError::InvalidAddress)
            }
        }
    }

    /// Read-only walk: the present leaf entry for `vpn`, if any.
    pub fn translate(&self, vpn: VirtPageNum) -> Option<PageTableEntry> {
        self.find_pte(vpn)
            .map(|pte| *pte)
            .filter(|pte| pte.is_valid())
    }

    /// Read-only walk from a virtual address to the physical address with
    /// the same page offset.
    pub fn translate_va(&self, va: VirtAddr) -> Option<PhysAddr> {
        self.translate(va.floor()).map(|pte| {
            let aligned_pa: PhysAddr = pte.ppn().into();
            PhysAddr(aligned_pa.0 + va.page_offset())
        })
    }

    /// Root table physical address; the value loaded into CR3 when this
    /// table is activated.
    pub fn token(&self) -> usize {
        PhysAddr::from(self.root_ppn).0
    }

    /// Return every ledgered table frame to the allocator, the root last.
    pub fn release(&mut self, alloc: &mut FrameAllocatorImpl) {
        for frame in self.table_frames.drain(..).rev() {
            alloc.dealloc(frame);
        }
    }

    /// Root table frame number.
    pub fn root_ppn(&self) -> PhysPageNum {
        self.root_ppn
    }
}

/// Invalidate the cached translation of a single page on the running CPU.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn invalidate_translation(vpn: VirtPageNum) {
    let va: VirtAddr = vpn.into();
    x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(usize::from(va) as u64));
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn invalidate_translation(_vpn: VirtPageNum) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::test_util::arena_allocator;

    #[test]
    fn map_then_translate_round_trips() {
        let mut alloc = arena_allocator(64);
        let mut pt = PageTable::new(&mut alloc).unwrap();
        let frame = alloc.alloc().unwrap();
        let va = VirtAddr::from(0x4000_2345usize);
        pt.map(va.floor(), frame, PTEFlags::WRITABLE, &mut alloc)
            .unwrap();
        let pa = pt.translate_va(va).unwrap();
        assert_eq!(pa.0 & 0xfff, 0x345);
        assert_eq!(pa.floor(), frame);
        let pte = pt.translate(va.floor()).unwrap();
        assert!(pte.is_valid() && pte.writable() && !pte.user());
    }

    #[test]
    fn unmap_removes_the_translation() {
        let mut alloc = arena_allocator(64);
        let mut pt = PageTable::new(&mut alloc).unwrap();
        let frame = alloc.alloc().unwrap();
        let vpn = VirtAddr::from(0x1000_0000usize).floor();
        pt.map(vpn, frame, PTEFlags::empty(), &mut alloc).unwrap();
        assert!(pt.translate(vpn).is_some());
        pt.unmap(vpn).unwrap();
        assert!(pt.translate(vpn).is_none());
        // a second unmap is "not found"
        assert_eq!(pt.unmap(vpn), Err(KernelError::InvalidAddress));
    }

    #[test]
    fn double_map_is_refused() {
        let mut alloc = arena_allocator(64);
        let mut pt = PageTable::new(&mut alloc).unwrap();
        let f1 = alloc.alloc().unwrap();
        let f2 = alloc.alloc().unwrap();
        let vpn = VirtAddr::from(0x2000_0000usize).floor();
        pt.map(vpn, f1, PTEFlags::empty(), &mut alloc).unwrap();
        assert_eq!(
            pt.map(vpn, f2, PTEFlags::empty(), &mut alloc),
            Err(KernelError::InvalidAddress)
        );
        // the original mapping survived
        assert_eq!(pt.translate(vpn).unwrap().ppn(), f1);
    }

    #[test]
    fn huge_entry_stops_a_4k_walk() {
        let mut alloc = arena_allocator(64);
        let mut pt = PageTable::new(&mut alloc).unwrap();
        let va = VirtAddr::from(0x4020_3000usize);
        // plant a huge entry at the second level of the walk
        let idxs = va.floor().indexes();
        let l1 = alloc.alloc().unwrap();
        l1.bytes_array().fill(0);
        pt.root_ppn.pte_array()[idxs[0]] =
            PageTableEntry::new(l1, PTEFlags::PRESENT | PTEFlags::WRITABLE);
        l1.pte_array()[idxs[1]] = PageTableEntry::new(
            alloc.alloc().unwrap(),
            PTEFlags::PRESENT | PTEFlags::HUGE,
        );
        let frame = alloc.alloc().unwrap();
        assert_eq!(
            pt.map(va.floor(), frame, PTEFlags::empty(), &mut alloc),
            Err(KernelError::InvalidAddress)
        );
        assert!(pt.translate(va.floor()).is_none());
    }

    #[test]
    fn release_returns_every_table_frame() {
        let mut alloc = arena_allocator(64);
        let free_before = alloc.free_frames();
        let mut pt = PageTable::new(&mut alloc).unwrap();
        let frame = alloc.alloc().unwrap();
        // one mapping materializes three intermediate tables
        pt.map(
            VirtAddr::from(0x7000_0000usize).floor(),
            frame,
            PTEFlags::empty(),
            &mut alloc,
        )
        .unwrap();
        assert_eq!(alloc.free_frames(), free_before - 5);
        pt.release(&mut alloc);
        alloc.dealloc(frame);
        assert_eq!(alloc.free_frames(), free_before);
    }
}
