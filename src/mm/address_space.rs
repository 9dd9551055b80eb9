//! Implementation of [`MapArea`] and [`AddressSpace`].
//!
//! An address space wraps one page-table tree plus the list of mapped
//! areas it owns. The upper (kernel) half of every space is physically
//! shared: user spaces copy the kernel root's upper entries at creation,
//! and the kernel template pre-allocates all of its upper-half root slots,
//! so later kernel mappings become visible in every space without further
//! bookkeeping. The lower half is process private and is the only part
//! `destroy` ever frees.

use super::frame_allocator::FrameAllocatorImpl;
use super::{FrameAllocator, PTEFlags, PageTable, PageTableEntry};
use super::{PhysAddr, PhysPageNum, VirtAddr, VirtPageNum};
use super::VPNRange;
use crate::config::PHYS_VIRT_OFFSET;
use crate::error::{KernelError, KernelResult};
use crate::mm::address::{KERNEL_HALF_START, PAGE_TABLE_LEVELS};
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use bitflags::*;
use core::mem;

/// Who an address space belongs to; user spaces may only shape their
/// lower half.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum AddressSpaceKind {
    Kernel,
    User,
}

/// address space
pub struct AddressSpace {
    page_table: PageTable,
    areas: Vec<MapArea>,
    kind: AddressSpaceKind,
}

impl AddressSpace {
    /// An empty kernel-kind space with nothing mapped.
    pub fn new_bare(alloc: &mut FrameAllocatorImpl) -> KernelResult<Self> {
        Ok(Self {
            page_table: PageTable::new(alloc)?,
            areas: Vec::new(),
            kind: AddressSpaceKind::Kernel,
        })
    }

    /// The kernel template: an empty space whose upper-half root slots are
    /// all populated with zeroed tables. Copies of the root made later
    /// share those tables, which is what keeps the kernel half identical
    /// across every address space from then on.
    pub fn new_kernel_template(alloc: &mut FrameAllocatorImpl) -> KernelResult<Self> {
        let space = Self::new_bare(alloc)?;
        let root = space.page_table.root_ppn().pte_array();
        for slot in root.iter_mut().skip(KERNEL_HALF_START) {
            let frame = alloc.alloc()?;
            frame.bytes_array().fill(0);
            *slot = PageTableEntry::new(frame, PTEFlags::PRESENT | PTEFlags::WRITABLE);
        }
        Ok(space)
    }

    /// A fresh user space: new zeroed root, kernel half copied from the
    /// template, empty lower half.
    pub fn new_user(
        template: &AddressSpace,
        alloc: &mut FrameAllocatorImpl,
    ) -> KernelResult<Self> {
        Ok(Self {
            page_table: PageTable::from_kernel_root(&template.page_table, alloc)?,
            areas: Vec::new(),
            kind: AddressSpaceKind::User,
        })
    }

    /// Root table physical address, the value this space loads into CR3.
    pub fn token(&self) -> usize {
        self.page_table.token()
    }

    /// Which half(s) this space may shape.
    pub fn kind(&self) -> AddressSpaceKind {
        self.kind
    }

    /// Map a range of fresh, zero-filled frames at `[start_va, end_va)`.
    ///
    /// On any failure the partially built area is unwound before the error
    /// is returned, so no frame leaks out of a failed insertion.
    pub fn insert_framed_area(
        &mut self,
        start_va: VirtAddr,
        end_va: VirtAddr,
        permission: MapPermission,
        alloc: &mut FrameAllocatorImpl,
    ) -> KernelResult<()> {
        self.push_area(
            MapArea::new(start_va, end_va, MapType::Framed, permission),
            alloc,
        )
    }

    /// Map `[start_va, end_va)` onto the physical range it shadows in the
    /// direct map (kernel sections, the physical-memory window).
    pub fn insert_direct_area(
        &mut self,
        start_va: VirtAddr,
        end_va: VirtAddr,
        permission: MapPermission,
        alloc: &mut FrameAllocatorImpl,
    ) -> KernelResult<()> {
        self.push_area(
            MapArea::new(start_va, end_va, MapType::Direct, permission),
            alloc,
        )
    }

    fn push_area(&mut self, mut area: MapArea, alloc: &mut FrameAllocatorImpl) -> KernelResult<()> {
        self.check_half(area.vpn_range.get_start())?;
        if let Err(e) = area.map(&mut self.page_table, alloc) {
            area.unmap(&mut self.page_table, alloc);
            return Err(e);
        }
        self.areas.push(area);
        Ok(())
    }

    /// Unmap the area starting at `start_vpn` and return its frames.
    pub fn remove_area_with_start_vpn(
        &mut self,
        start_vpn: VirtPageNum,
        alloc: &mut FrameAllocatorImpl,
    ) {
        if let Some((idx, area)) = self
            .areas
            .iter_mut()
            .enumerate()
            .find(|(_, area)| area.vpn_range.get_start() == start_vpn)
        {
            area.unmap(&mut self.page_table, alloc);
            self.areas.remove(idx);
        }
    }

    /// Install a single page mapping. This is the loader's surface for
    /// placing code, data and stacks into a new process image; the frames
    /// are the loader's to account for.
    pub fn map_page(
        &mut self,
        virt: VirtAddr,
        phys: PhysAddr,
        flags: MapPermission,
        alloc: &mut FrameAllocatorImpl,
    ) -> KernelResult<()> {
        self.check_half(virt.floor())?;
        self.page_table
            .map(virt.floor(), phys.floor(), flags.pte_flags(), alloc)
    }

    /// Remove a single page mapping and invalidate its translation.
    pub fn unmap_page(&mut self, virt: VirtAddr) -> KernelResult<()> {
        self.page_table.unmap(virt.floor())
    }

    /// Leaf entry for a page, if mapped.
    pub fn translate(&self, vpn: VirtPageNum) -> Option<PageTableEntry> {
        self.page_table.translate(vpn)
    }

    /// Physical address carrying the same page offset, if mapped.
    pub fn translate_va(&self, va: VirtAddr) -> Option<PhysAddr> {
        self.page_table.translate_va(va)
    }

    /// Tear the space down: return every owned data frame, every leaf
    /// frame the loader placed in the lower half, and finally the table
    /// frames themselves, root last. Kernel-half frames are shared and are
    /// never freed here. The space must not be used afterwards.
    pub fn destroy(&mut self, alloc: &mut FrameAllocatorImpl) {
        let mut areas = mem::take(&mut self.areas);
        for area in areas.iter_mut() {
            area.unmap(&mut self.page_table, alloc);
        }
        self.free_lower_half_leaves(alloc);
        self.page_table.release(alloc);
    }

    /// Free every still-present leaf frame reachable through lower-half
    /// root entries (mappings installed page-by-page via `map_page`).
    fn free_lower_half_leaves(&mut self, alloc: &mut FrameAllocatorImpl) {
        fn walk(table: PhysPageNum, level: usize, alloc: &mut FrameAllocatorImpl) {
            for pte in table.pte_array().iter_mut() {
                if !pte.is_valid() || pte.is_huge() {
                    continue;
                }
                if level == PAGE_TABLE_LEVELS - 1 {
                    alloc.dealloc(pte.ppn());
                } else {
                    walk(pte.ppn(), level + 1, alloc);
                }
                *pte = PageTableEntry::empty();
            }
        }
        let root = self.page_table.root_ppn().pte_array();
        for pte in root.iter_mut().take(KERNEL_HALF_START) {
            if pte.is_valid() && !pte.is_huge() {
                walk(pte.ppn(), 1, alloc);
            }
        }
    }

    /// A user space shapes only its lower half; the upper half belongs to
    /// the kernel template.
    fn check_half(&self, vpn: VirtPageNum) -> KernelResult<()> {
        if self.kind == AddressSpaceKind::User && vpn.is_higher_half() {
            warn!("address space: user mapping into the kernel half refused");
            return Err(KernelError::InvalidAddress);
        }
        Ok(())
    }

    /// Load this space's root into CR3. Callers hold the single-core lock
    /// (interrupts disabled); the switch drops every cached lower-half
    /// translation of the previous space.
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    pub fn activate(&self) {
        use x86_64::registers::control::{Cr3, Cr3Flags};
        use x86_64::structures::paging::PhysFrame;
        let frame =
            PhysFrame::containing_address(x86_64::PhysAddr::new(self.token() as u64));
        unsafe {
            Cr3::write(frame, Cr3Flags::empty());
        }
    }

    /// Host builds never own the hardware translation root.
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    pub fn activate(&self) {}
}

/// map area structure, controls a contiguous piece of virtual memory
pub struct MapArea {
    vpn_range: VPNRange,
    data_frames: BTreeMap<VirtPageNum, PhysPageNum>,
    map_type: MapType,
    map_perm: MapPermission,
}

impl MapArea {
    pub fn new(
        start_va: VirtAddr,
        end_va: VirtAddr,
        map_type: MapType,
        map_perm: MapPermission,
    ) -> Self {
        let start_vpn: VirtPageNum = start_va.floor();
        let end_vpn: VirtPageNum = end_va.ceil();
        Self {
            vpn_range: VPNRange::new(start_vpn, end_vpn),
            data_frames: BTreeMap::new(),
            map_type,
            map_perm,
        }
    }

    /// Map one page of the area.
    fn map_one(
        &mut self,
        page_table: &mut PageTable,
        vpn: VirtPageNum,
        alloc: &mut FrameAllocatorImpl,
    ) -> KernelResult<()> {
        let ppn: PhysPageNum = match self.map_type {
            MapType::Direct => {
                let va: VirtAddr = vpn.into();
                PhysAddr::from(usize::from(va) - PHYS_VIRT_OFFSET).floor()
            }
            MapType::Framed => {
                let frame = alloc.alloc()?;
                frame.bytes_array().fill(0);
                self.data_frames.insert(vpn, frame);
                frame
            }
        };
        page_table.map(vpn, ppn, self.map_perm.pte_flags(), alloc)
    }

    /// Unmap one page and, for framed areas, return its frame.
    fn unmap_one(
        &mut self,
        page_table: &mut PageTable,
        vpn: VirtPageNum,
        alloc: &mut FrameAllocatorImpl,
    ) {
        if self.map_type == MapType::Framed {
            match self.data_frames.remove(&vpn) {
                Some(frame) => alloc.dealloc(frame),
                // never mapped (unwound half-built area)
                None => return,
            }
        }
        let _ = page_table.unmap(vpn);
    }

    /// Map the whole range; stops at the first failure, leaving the
    /// already-mapped prefix recorded for the caller to unwind.
    pub fn map(
        &mut self,
        page_table: &mut PageTable,
        alloc: &mut FrameAllocatorImpl,
    ) -> KernelResult<()> {
        for vpn in self.vpn_range {
            self.map_one(page_table, vpn, alloc)?;
        }
        Ok(())
    }

    /// Unmap whatever part of the range is mapped.
    pub fn unmap(&mut self, page_table: &mut PageTable, alloc: &mut FrameAllocatorImpl) {
        for vpn in self.vpn_range {
            self.unmap_one(page_table, vpn, alloc);
        }
    }
}

#[derive(Copy, Clone, PartialEq, Debug)]
/// how a range of pages gets its frames
pub enum MapType {
    /// the pages shadow the physical range under the direct map
    Direct,
    /// each page owns a frame taken from the frame allocator
    Framed,
}

bitflags! {
    /// map permission corresponding to that in pte: `W U X`
    pub struct MapPermission: u8 {
        /// Writable
        const W = 1 << 1;
        /// Accessible in user mode
        const U = 1 << 2;
        /// Executable
        const X = 1 << 3;
    }
}

impl MapPermission {
    /// Lower to page-table entry flags; x86-64 expresses "may execute" as
    /// the absence of `NO_EXECUTE`.
    pub fn pte_flags(self) -> PTEFlags {
        let mut flags = PTEFlags::PRESENT;
        if self.contains(MapPermission::W) {
            flags |= PTEFlags::WRITABLE;
        }
        if self.contains(MapPermission::U) {
            flags |= PTEFlags::USER;
        }
        if !self.contains(MapPermission::X) {
            flags |= PTEFlags::NO_EXECUTE;
        }
        flags
    }
}

#[cfg(target_os = "none")]
mod kernel_space {
    use super::*;
    use crate::config::MEMORY_END;
    use crate::sync::UPSafeCell;
    use alloc::sync::Arc;
    use lazy_static::*;

    extern "C" {
        fn stext();
        fn etext();
        fn srodata();
        fn erodata();
        fn sdata();
        fn edata();
        fn sbss_with_stack();
        fn ebss();
        fn ekernel();
    }

    lazy_static! {
        /// The kernel address space, template for every user space.
        pub static ref KERNEL_SPACE: Arc<UPSafeCell<AddressSpace>> = Arc::new(unsafe {
            UPSafeCell::new(new_kernel().expect("building the kernel address space is boot-fatal"))
        });
    }

    /// Kernel token
    pub fn kernel_token() -> usize {
        KERNEL_SPACE.exclusive_access().token()
    }

    /// Build the kernel space: pre-populated upper-half root, the kernel's
    /// own sections, then the rest of physical memory, all inside the
    /// direct map.
    fn new_kernel() -> KernelResult<AddressSpace> {
        use crate::mm::frame_allocator::FRAME_ALLOCATOR;
        let alloc = &mut *FRAME_ALLOCATOR.exclusive_access();
        let mut space = AddressSpace::new_kernel_template(alloc)?;
        info!(".text [{:#x}, {:#x})", stext as usize, etext as usize);
        info!(".rodata [{:#x}, {:#x})", srodata as usize, erodata as usize);
        info!(".data [{:#x}, {:#x})", sdata as usize, edata as usize);
        info!(".bss [{:#x}, {:#x})", sbss_with_stack as usize, ebss as usize);
        space.insert_direct_area(
            (stext as usize).into(),
            (etext as usize).into(),
            MapPermission::X,
            alloc,
        )?;
        space.insert_direct_area(
            (srodata as usize).into(),
            (erodata as usize).into(),
            MapPermission::empty(),
            alloc,
        )?;
        space.insert_direct_area(
            (sdata as usize).into(),
            (edata as usize).into(),
            MapPermission::W,
            alloc,
        )?;
        space.insert_direct_area(
            (sbss_with_stack as usize).into(),
            (ebss as usize).into(),
            MapPermission::W,
            alloc,
        )?;
        space.insert_direct_area(
            (ekernel as usize).into(),
            (PHYS_VIRT_OFFSET + MEMORY_END).into(),
            MapPermission::W,
            alloc,
        )?;
        Ok(space)
    }
}

#[cfg(target_os = "none")]
pub use kernel_space::{kernel_token, KERNEL_SPACE};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::test_util::arena_allocator;

    fn lower(addr: usize) -> VirtAddr {
        VirtAddr::from(addr)
    }

    #[test]
    fn framed_area_maps_zeroed_frames() {
        let mut alloc = arena_allocator(512);
        let mut space = AddressSpace::new_bare(&mut alloc).unwrap();
        space
            .insert_framed_area(
                lower(0x40_0000),
                lower(0x40_3000),
                MapPermission::W | MapPermission::U,
                &mut alloc,
            )
            .unwrap();
        for page in 0..3 {
            let pte = space.translate(lower(0x40_0000 + page * 0x1000).floor()).unwrap();
            assert!(pte.is_valid() && pte.writable() && pte.user());
            assert!(pte.ppn().bytes_array().iter().all(|b| *b == 0));
        }
        assert!(space.translate(lower(0x40_3000).floor()).is_none());
    }

    #[test]
    fn user_spaces_share_the_kernel_half() {
        let mut alloc = arena_allocator(512);
        let mut template = AddressSpace::new_kernel_template(&mut alloc).unwrap();
        let u1 = AddressSpace::new_user(&template, &mut alloc).unwrap();
        let u2 = AddressSpace::new_user(&template, &mut alloc).unwrap();
        // a kernel mapping installed after the user spaces were created is
        // visible through both of them: the upper-half tables are shared,
        // not copied
        let frame = alloc.alloc().unwrap();
        let kva = VirtAddr::from(0xffff_9000_0000_0000usize);
        template
            .map_page(kva, frame.into(), MapPermission::W, &mut alloc)
            .unwrap();
        assert_eq!(u1.translate(kva.floor()).unwrap().ppn(), frame);
        assert_eq!(u2.translate(kva.floor()).unwrap().ppn(), frame);
    }

    #[test]
    fn lower_halves_are_private() {
        let mut alloc = arena_allocator(512);
        let template = AddressSpace::new_kernel_template(&mut alloc).unwrap();
        let mut u1 = AddressSpace::new_user(&template, &mut alloc).unwrap();
        let mut u2 = AddressSpace::new_user(&template, &mut alloc).unwrap();
        let f1 = alloc.alloc().unwrap();
        let f2 = alloc.alloc().unwrap();
        let va = lower(0x10_0000);
        u1.map_page(va, f1.into(), MapPermission::W, &mut alloc).unwrap();
        u2.map_page(va, f2.into(), MapPermission::W, &mut alloc).unwrap();
        assert_eq!(u1.translate(va.floor()).unwrap().ppn(), f1);
        assert_eq!(u2.translate(va.floor()).unwrap().ppn(), f2);
        // and neither mapping leaks into a space that never made one
        let u3 = AddressSpace::new_user(&template, &mut alloc).unwrap();
        assert!(u3.translate(va.floor()).is_none());
    }

    #[test]
    fn user_space_cannot_shape_the_kernel_half() {
        let mut alloc = arena_allocator(512);
        let template = AddressSpace::new_kernel_template(&mut alloc).unwrap();
        let mut user = AddressSpace::new_user(&template, &mut alloc).unwrap();
        let frame = alloc.alloc().unwrap();
        assert_eq!(
            user.map_page(
                VirtAddr::from(0xffff_9000_0000_0000usize),
                frame.into(),
                MapPermission::W,
                &mut alloc,
            ),
            Err(KernelError::InvalidAddress)
        );
    }

    #[test]
    fn destroy_returns_every_lower_half_frame() {
        let mut alloc = arena_allocator(512);
        let template = AddressSpace::new_kernel_template(&mut alloc).unwrap();
        let free_before = alloc.free_frames();
        let mut user = AddressSpace::new_user(&template, &mut alloc).unwrap();
        user.insert_framed_area(
            lower(0x40_0000),
            lower(0x40_8000),
            MapPermission::W | MapPermission::U,
            &mut alloc,
        )
        .unwrap();
        // a loader-style raw mapping of an explicitly allocated frame
        let raw = alloc.alloc().unwrap();
        user.map_page(lower(0x80_0000), raw.into(), MapPermission::U, &mut alloc)
            .unwrap();
        assert!(alloc.free_frames() < free_before);
        user.destroy(&mut alloc);
        assert_eq!(alloc.free_frames(), free_before);
    }

    #[test]
    fn destroy_leaves_the_kernel_half_alone() {
        let mut alloc = arena_allocator(512);
        let mut template = AddressSpace::new_kernel_template(&mut alloc).unwrap();
        let kframe = alloc.alloc().unwrap();
        let kva = VirtAddr::from(0xffff_a000_0000_0000usize);
        template
            .map_page(kva, kframe.into(), MapPermission::W, &mut alloc)
            .unwrap();
        let mut user = AddressSpace::new_user(&template, &mut alloc).unwrap();
        user.insert_framed_area(lower(0x1000), lower(0x3000), MapPermission::U, &mut alloc)
            .unwrap();
        user.destroy(&mut alloc);
        // the kernel mapping is still intact in the template
        assert_eq!(template.translate(kva.floor()).unwrap().ppn(), kframe);
    }

    #[test]
    fn removed_area_frames_are_reusable() {
        let mut alloc = arena_allocator(512);
        let mut space = AddressSpace::new_bare(&mut alloc).unwrap();
        let free_before = alloc.free_frames();
        space
            .insert_framed_area(lower(0x40_0000), lower(0x40_4000), MapPermission::W, &mut alloc)
            .unwrap();
        space.remove_area_with_start_vpn(lower(0x40_0000).floor(), &mut alloc);
        // the four data frames came back; table frames stay with the space
        assert_eq!(alloc.free_frames(), free_before - 3);
        assert!(space.translate(lower(0x40_0000).floor()).is_none());
    }
}
