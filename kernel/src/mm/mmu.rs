//! MMU primitives.
//!
//! Two-level translation: a page directory of 1024 entries, each naming a
//! page table of 1024 entries, each naming a 4 KiB frame. This layer is
//! deliberately thin: it owns the bit-level correctness of one entry at a
//! time and nothing else. Alignment and permission policy belong to the
//! virtual memory layer.

use bitflags::bitflags;

use crate::error::MmuError;

use super::{FrameNumber, PhysAddr, VirtAddr, PAGE_SHIFT, PGTAB_SHIFT};

/// Entries per page table and per page directory.
pub const ENTRIES: usize = 1024;

bitflags! {
    /// Bits of a page-table or page-directory entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u32 {
        const PRESENT  = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER     = 1 << 2;
        const ACCESSED = 1 << 5;
        const DIRTY    = 1 << 6;
        /// Software bit: mapping must not be executed.
        const NOEXEC   = 1 << 9;
    }
}

/// A page-table entry: flags plus a 20-bit frame number.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTableEntry(u32);

impl PageTableEntry {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn new(frame: FrameNumber, flags: EntryFlags) -> Self {
        Self((frame.as_u32() << PAGE_SHIFT as u32) | flags.bits())
    }

    pub fn is_present(self) -> bool {
        self.flags().contains(EntryFlags::PRESENT)
    }

    pub fn flags(self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.0)
    }

    pub fn frame(self) -> FrameNumber {
        FrameNumber::new(self.0 >> PAGE_SHIFT as u32)
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

/// A page-directory entry: flags plus the frame of a page table.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageDirEntry(u32);

impl PageDirEntry {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn new(pgtab_frame: FrameNumber, flags: EntryFlags) -> Self {
        Self((pgtab_frame.as_u32() << PAGE_SHIFT as u32) | flags.bits())
    }

    pub fn is_present(self) -> bool {
        self.flags().contains(EntryFlags::PRESENT)
    }

    pub fn flags(self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.0)
    }

    pub fn frame(self) -> FrameNumber {
        FrameNumber::new(self.0 >> PAGE_SHIFT as u32)
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

/// A page table: maps one 4 MiB region page by page.
#[repr(C, align(4096))]
#[derive(Clone)]
pub struct PageTable {
    pub entries: [PageTableEntry; ENTRIES],
}

impl PageTable {
    pub const fn empty() -> Self {
        Self {
            entries: [PageTableEntry::empty(); ENTRIES],
        }
    }
}

/// A page directory: the root of one address space.
#[repr(C, align(4096))]
#[derive(Clone)]
pub struct PageDirectory {
    pub entries: [PageDirEntry; ENTRIES],
}

impl PageDirectory {
    pub const fn empty() -> Self {
        Self {
            entries: [PageDirEntry::empty(); ENTRIES],
        }
    }
}

/// Directory index of a virtual address.
pub fn pde_index(vaddr: VirtAddr) -> usize {
    (vaddr.as_u32() >> PGTAB_SHIFT as u32) as usize
}

/// Table index of a virtual address.
pub fn pte_index(vaddr: VirtAddr) -> usize {
    ((vaddr.as_u32() >> PAGE_SHIFT as u32) & (ENTRIES as u32 - 1)) as usize
}

/// Sets the entry for `vaddr` in `pgtab` to point at `paddr`.
///
/// Fails busy if the entry is already present; both addresses must be page
/// aligned.
pub fn page_map(
    pgtab: &mut PageTable,
    paddr: PhysAddr,
    vaddr: VirtAddr,
    writable: bool,
    executable: bool,
) -> Result<(), MmuError> {
    if !paddr.is_page_aligned() || !vaddr.is_page_aligned() {
        return Err(MmuError::Misaligned);
    }

    let entry = &mut pgtab.entries[pte_index(vaddr)];
    if entry.is_present() {
        return Err(MmuError::Busy);
    }

    let mut flags = EntryFlags::PRESENT | EntryFlags::USER;
    if writable {
        flags |= EntryFlags::WRITABLE;
    }
    if !executable {
        flags |= EntryFlags::NOEXEC;
    }
    *entry = PageTableEntry::new(paddr.frame(), flags);
    Ok(())
}

/// Installs the page-table frame `paddr` in the directory entry covering
/// `vaddr`.
///
/// Fails busy if the entry is already present.
pub fn pgtab_map(
    pgdir: &mut PageDirectory,
    paddr: PhysAddr,
    vaddr: VirtAddr,
) -> Result<(), MmuError> {
    if !paddr.is_page_aligned() {
        return Err(MmuError::Misaligned);
    }

    let entry = &mut pgdir.entries[pde_index(vaddr)];
    if entry.is_present() {
        return Err(MmuError::Busy);
    }

    *entry = PageDirEntry::new(
        paddr.frame(),
        EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::USER,
    );
    Ok(())
}

/// Scans one page table for a mapping of `paddr`.
///
/// `region_base` is the first virtual address the table covers. Used by
/// kernel tooling that holds a physical address known to be mapped.
pub fn pgtab_walk(pgtab: &PageTable, region_base: VirtAddr, paddr: PhysAddr) -> Option<VirtAddr> {
    let frame = paddr.frame();
    for (idx, entry) in pgtab.entries.iter().enumerate() {
        if entry.is_present() && entry.frame() == frame {
            let offset = paddr.as_u32() & (super::PAGE_SIZE as u32 - 1);
            let page = region_base.as_u32() + (idx << PAGE_SHIFT) as u32;
            return Some(VirtAddr::new(page + offset));
        }
    }
    None
}

/// Flushes the whole TLB. Must follow any change to an entry whose virtual
/// address may be cached.
pub fn tlb_flush() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    x86_64::instructions::tlb::flush_all();
}

/// Flushes a single page translation.
pub fn tlb_flush_page(vaddr: VirtAddr) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(u64::from(vaddr.as_u32())));
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    let _ = vaddr;
}
