//! Per-process virtual memory.
//!
//! A [`Virtmem`] owns one page directory, the page tables it installed, and
//! every user frame it mapped. The kernel half of the directory is copied
//! verbatim from the root directory at creation, so all address spaces see
//! the same kernel at the same addresses; user entries start empty and grow
//! on demand.
//!
//! The current address space is read without locking; mutation goes through
//! `&mut self`, which the owning process guards with its own lock, and is
//! followed by a TLB flush for any address that may be cached.

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;

use crate::error::{FrameError, KernelError, KernelResult, MmuError};

use super::mmu::{self, EntryFlags, PageDirectory, PageTable};
use super::{
    frame, FrameNumber, PhysAddr, VirtAddr, KERNEL_PGTAB_BASE_PHYS, KMEM_SIZE, KPOOL_BASE_VIRT,
    KPOOL_SIZE, PAGE_SHIFT, PAGE_SIZE, PGTAB_SIZE,
};

struct UserPgtab {
    frame: FrameNumber,
    table: Box<PageTable>,
}

struct UserPage {
    frame: FrameNumber,
    data: Box<[u8; PAGE_SIZE]>,
}

/// One virtual address space.
pub struct Virtmem {
    pgdir: Box<PageDirectory>,
    /// User page tables, keyed by directory index.
    tables: BTreeMap<usize, UserPgtab>,
    /// User pages, keyed by page-aligned virtual address.
    pages: BTreeMap<u32, UserPage>,
    /// Lowest mapped stack page, for growth triage.
    stack_floor: Option<u32>,
}

/// Builds the root page directory: identity entries for the kernel image
/// and the kernel page pool, backed by the boot page tables booked inside
/// the kernel image region.
pub fn build_root_pgdir() -> PageDirectory {
    let mut pgdir = PageDirectory::empty();

    let kernel_regions = (KMEM_SIZE as usize + KPOOL_SIZE as usize) / PGTAB_SIZE;
    let pgtab_base_frame = KERNEL_PGTAB_BASE_PHYS >> PAGE_SHIFT as u32;

    for idx in 0..kernel_regions {
        pgdir.entries[idx] = super::mmu::PageDirEntry::new(
            FrameNumber::new(pgtab_base_frame + idx as u32),
            EntryFlags::PRESENT | EntryFlags::WRITABLE,
        );
    }

    pgdir
}

impl Virtmem {
    /// Creates an address space from `src`, copying every kernel-shared
    /// directory entry verbatim. Kernel-shared means present without the
    /// user bit.
    pub fn create(src: &PageDirectory) -> Self {
        let mut pgdir = Box::new(PageDirectory::empty());

        for (idx, entry) in src.entries.iter().enumerate() {
            if entry.is_present() && !entry.flags().contains(EntryFlags::USER) {
                pgdir.entries[idx] = *entry;
            }
        }

        Self {
            pgdir,
            tables: BTreeMap::new(),
            pages: BTreeMap::new(),
            stack_floor: None,
        }
    }

    /// The page directory of this address space.
    pub fn pgdir(&self) -> &PageDirectory {
        &self.pgdir
    }

    /// Number of user pages currently mapped.
    pub fn user_page_count(&self) -> usize {
        self.pages.len()
    }

    fn pgtab_for(&mut self, vaddr: VirtAddr) -> KernelResult<&mut UserPgtab> {
        let idx = mmu::pde_index(vaddr);

        if !self.tables.contains_key(&idx) {
            if self.pgdir.entries[idx].is_present() {
                // Present but not ours: the kernel-shared half.
                return Err(KernelError::BadAddress);
            }
            let frame = frame::frame_alloc_any();
            if frame == super::FRAME_NULL {
                return Err(FrameError::OutOfMemory.into());
            }
            mmu::pgtab_map(&mut self.pgdir, frame.base(), vaddr)?;
            self.tables.insert(
                idx,
                UserPgtab {
                    frame,
                    table: Box::new(PageTable::empty()),
                },
            );
        }

        Ok(self.tables.get_mut(&idx).expect("page table just ensured"))
    }

    /// Maps a fresh zeroed frame at `vaddr`.
    ///
    /// Policy enforced here: the address must be page aligned and must lie
    /// in the user half.
    pub fn map_page(
        &mut self,
        vaddr: VirtAddr,
        writable: bool,
        executable: bool,
    ) -> KernelResult<FrameNumber> {
        if !vaddr.is_page_aligned() {
            return Err(MmuError::Misaligned.into());
        }
        if !super::is_uaddr(vaddr) {
            return Err(KernelError::BadAddress);
        }

        let frame = frame::frame_alloc_any();
        if frame == super::FRAME_NULL {
            return Err(FrameError::OutOfMemory.into());
        }

        let pgtab = match self.pgtab_for(vaddr) {
            Ok(pgtab) => pgtab,
            Err(e) => {
                frame::frame_free(frame).ok();
                return Err(e);
            }
        };

        if let Err(e) = mmu::page_map(&mut pgtab.table, frame.base(), vaddr, writable, executable)
        {
            frame::frame_free(frame).ok();
            return Err(e.into());
        }

        self.pages.insert(
            vaddr.as_u32(),
            UserPage {
                frame,
                data: Box::new([0; PAGE_SIZE]),
            },
        );
        mmu::tlb_flush_page(vaddr);

        Ok(frame)
    }

    /// Attaches one stack page ending at `vaddr`, i.e. mapping
    /// `[vaddr - PAGE_SIZE, vaddr)` writable.
    pub fn attach_stack(&mut self, vaddr: VirtAddr) -> KernelResult<()> {
        if !vaddr.is_page_aligned() {
            return Err(MmuError::Misaligned.into());
        }

        let base = vaddr.as_u32() - PAGE_SIZE as u32;
        self.map_page(VirtAddr::new(base), true, false)?;

        let floor = self.stack_floor.map_or(base, |f| f.min(base));
        self.stack_floor = Some(floor);
        Ok(())
    }

    /// Distinguishes a stack-growth fault from a hard fault: a fault in the
    /// guard page just below the stack floor grows the stack by one page
    /// and returns true.
    pub fn grow_stack(&mut self, fault: VirtAddr) -> bool {
        let Some(floor) = self.stack_floor else {
            return false;
        };
        let guard_base = floor - PAGE_SIZE as u32;
        if fault.as_u32() < guard_base || fault.as_u32() >= floor {
            return false;
        }
        self.attach_stack(VirtAddr::new(floor)).is_ok()
    }

    /// Resolves a user virtual address to its frame and entry flags.
    pub fn resolve(&self, vaddr: VirtAddr) -> Option<(FrameNumber, EntryFlags)> {
        let pgtab = self.tables.get(&mmu::pde_index(vaddr))?;
        let entry = pgtab.table.entries[mmu::pte_index(vaddr)];
        if !entry.is_present() {
            return None;
        }
        Some((entry.frame(), entry.flags()))
    }

    /// Reverse lookup: the virtual address a physical address is mapped at,
    /// in this address space. Kernel physical memory is identity-mapped.
    pub fn page_walk(&self, paddr: PhysAddr) -> Option<VirtAddr> {
        let raw = paddr.as_u32();
        if raw < KMEM_SIZE || (KPOOL_BASE_VIRT..KPOOL_BASE_VIRT + KPOOL_SIZE).contains(&raw) {
            return Some(VirtAddr::new(raw));
        }

        for (idx, pgtab) in self.tables.iter() {
            let region = VirtAddr::new((*idx as u32) << super::PGTAB_SHIFT as u32);
            if let Some(vaddr) = mmu::pgtab_walk(&pgtab.table, region, paddr) {
                return Some(vaddr);
            }
        }
        None
    }

    /// Copies bytes out of this address space into `buf`.
    pub fn read_bytes(&self, vaddr: VirtAddr, buf: &mut [u8]) -> KernelResult<()> {
        let mut addr = vaddr.as_u32();
        let mut copied = 0;

        while copied < buf.len() {
            let page = addr & !(PAGE_SIZE as u32 - 1);
            let offset = (addr - page) as usize;
            let chunk = (PAGE_SIZE - offset).min(buf.len() - copied);

            let user_page = self.pages.get(&page).ok_or(KernelError::BadAddress)?;
            buf[copied..copied + chunk].copy_from_slice(&user_page.data[offset..offset + chunk]);

            copied += chunk;
            addr += chunk as u32;
        }
        Ok(())
    }

    /// Copies bytes into this address space. Kernel-side stores ignore the
    /// writable bit (the loader fills read-only text this way).
    pub fn write_bytes(&mut self, vaddr: VirtAddr, bytes: &[u8]) -> KernelResult<()> {
        let mut addr = vaddr.as_u32();
        let mut copied = 0;

        while copied < bytes.len() {
            let page = addr & !(PAGE_SIZE as u32 - 1);
            let offset = (addr - page) as usize;
            let chunk = (PAGE_SIZE - offset).min(bytes.len() - copied);

            let user_page = self.pages.get_mut(&page).ok_or(KernelError::BadAddress)?;
            user_page.data[offset..offset + chunk].copy_from_slice(&bytes[copied..copied + chunk]);

            copied += chunk;
            addr += chunk as u32;
        }
        Ok(())
    }
}

impl Drop for Virtmem {
    fn drop(&mut self) {
        for (_, page) in core::mem::take(&mut self.pages) {
            frame::frame_free(page.frame).ok();
        }
        for (idx, pgtab) in core::mem::take(&mut self.tables) {
            self.pgdir.entries[idx].clear();
            frame::frame_free(pgtab.frame).ok();
        }
        mmu::tlb_flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::{root_pgdir, USER_BASE_PHYS, USER_BASE_VIRT, USER_STACK_TOP};

    #[test]
    fn kernel_half_is_shared_verbatim() {
        let vm = Virtmem::create(root_pgdir());
        let root = root_pgdir();
        for idx in 0..mmu::ENTRIES {
            let entry = root.entries[idx];
            if entry.is_present() && !entry.flags().contains(EntryFlags::USER) {
                assert_eq!(vm.pgdir().entries[idx], entry);
            }
        }
    }

    #[test]
    fn mapped_page_is_present_and_backed() {
        let mut vm = Virtmem::create(root_pgdir());
        let vaddr = VirtAddr::new(USER_BASE_VIRT);

        let frame = vm.map_page(vaddr, true, false).unwrap();
        assert!(frame::frame_is_allocated(frame));

        let (resolved, flags) = vm.resolve(vaddr).unwrap();
        assert_eq!(resolved, frame);
        assert!(flags.contains(EntryFlags::PRESENT | EntryFlags::USER));

        // The page table behind the mapping is backed by an allocated frame.
        let pde = vm.pgdir().entries[mmu::pde_index(vaddr)];
        assert!(pde.is_present());
        assert!(frame::frame_is_allocated(pde.frame()));
    }

    #[test]
    fn user_pages_never_come_from_kernel_reserved_memory() {
        let mut vm = Virtmem::create(root_pgdir());
        let frame = vm
            .map_page(VirtAddr::new(USER_BASE_VIRT + 0x1000), false, true)
            .unwrap();
        assert!(frame.base().as_u32() >= USER_BASE_PHYS);
    }

    #[test]
    fn remapping_a_page_is_busy() {
        let mut vm = Virtmem::create(root_pgdir());
        let vaddr = VirtAddr::new(USER_BASE_VIRT + 0x2000);
        vm.map_page(vaddr, true, false).unwrap();
        assert!(matches!(
            vm.map_page(vaddr, true, false),
            Err(KernelError::Mmu(MmuError::Busy))
        ));
    }

    #[test]
    fn kernel_addresses_are_rejected() {
        let mut vm = Virtmem::create(root_pgdir());
        assert!(matches!(
            vm.map_page(VirtAddr::new(0x4000), true, false),
            Err(KernelError::BadAddress)
        ));
    }

    #[test]
    fn stack_attach_maps_the_page_below() {
        let mut vm = Virtmem::create(root_pgdir());
        vm.attach_stack(VirtAddr::new(USER_STACK_TOP)).unwrap();

        let page = VirtAddr::new(USER_STACK_TOP - PAGE_SIZE as u32);
        let (_, flags) = vm.resolve(page).unwrap();
        assert!(flags.contains(EntryFlags::WRITABLE));
        assert!(vm.resolve(VirtAddr::new(USER_STACK_TOP - 2 * PAGE_SIZE as u32)).is_none());
    }

    #[test]
    fn guard_page_fault_grows_the_stack() {
        let mut vm = Virtmem::create(root_pgdir());
        vm.attach_stack(VirtAddr::new(USER_STACK_TOP)).unwrap();

        let guard = USER_STACK_TOP - 2 * PAGE_SIZE as u32 + 8;
        assert!(vm.grow_stack(VirtAddr::new(guard)));
        assert!(vm.resolve(VirtAddr::new(USER_STACK_TOP - 2 * PAGE_SIZE as u32)).is_some());

        // A wild fault far below the stack is not growth.
        assert!(!vm.grow_stack(VirtAddr::new(USER_BASE_VIRT)));
    }

    #[test]
    fn bytes_round_trip_through_user_pages() {
        let mut vm = Virtmem::create(root_pgdir());
        let vaddr = VirtAddr::new(USER_BASE_VIRT + 0x3000);
        vm.map_page(vaddr, true, false).unwrap();
        vm.map_page(VirtAddr::new(vaddr.as_u32() + PAGE_SIZE as u32), true, false)
            .unwrap();

        // Straddle the page boundary on purpose.
        let at = VirtAddr::new(vaddr.as_u32() + PAGE_SIZE as u32 - 3);
        vm.write_bytes(at, b"boundary").unwrap();

        let mut out = [0u8; 8];
        vm.read_bytes(at, &mut out).unwrap();
        assert_eq!(&out, b"boundary");
    }

    #[test]
    fn unmapped_reads_fail() {
        let vm = Virtmem::create(root_pgdir());
        let mut out = [0u8; 4];
        assert!(vm
            .read_bytes(VirtAddr::new(USER_BASE_VIRT), &mut out)
            .is_err());
    }

    #[test]
    fn page_walk_reverses_mappings() {
        let mut vm = Virtmem::create(root_pgdir());
        let vaddr = VirtAddr::new(USER_BASE_VIRT + 0x5000);
        let frame = vm.map_page(vaddr, true, false).unwrap();

        let paddr = PhysAddr::new(frame.base().as_u32() + 0x21);
        assert_eq!(vm.page_walk(paddr), Some(VirtAddr::new(vaddr.as_u32() + 0x21)));

        // Kernel memory is identity-mapped.
        assert_eq!(vm.page_walk(PhysAddr::new(0x1000)), Some(VirtAddr::new(0x1000)));
    }
}
