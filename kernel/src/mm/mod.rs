//! Memory manager.
//!
//! Three layers, initialized in order: the page frame allocator over the
//! DRAM window, the kernel page pool carved out of it, and per-process
//! virtual memory built on both. The MMU structures themselves are policy
//! free; everything about what maps where is decided here.

pub mod frame;
pub mod kpool;
pub mod mmu;
pub mod vmem;

use core::fmt;

use spin::Once;

use crate::kargs::Kargs;
use mmu::PageDirectory;

/// Size of a page and of a page frame.
pub const PAGE_SIZE: usize = 4096;
/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: usize = 12;
/// log2 of the region mapped by one page table (4 MiB).
pub const PGTAB_SHIFT: usize = 22;
/// Size of the region mapped by one page table.
pub const PGTAB_SIZE: usize = 1 << PGTAB_SHIFT;

/// Extent of the DRAM window managed by the frame allocator.
pub const MEMORY_SIZE: usize = 64 << 20;
/// Number of page frames in the DRAM window.
pub const NUM_FRAMES: usize = MEMORY_SIZE / PAGE_SIZE;

/// Base of the kernel image region (identity-mapped).
pub const KERNEL_BASE_VIRT: u32 = 0x0000_0000;
/// Extent of the kernel image region.
pub const KMEM_SIZE: u32 = 16 << 20;
/// Base of the kernel page pool (identity-mapped).
pub const KPOOL_BASE_VIRT: u32 = 0x0100_0000;
/// Extent of the kernel page pool.
pub const KPOOL_SIZE: u32 = 4 << 20;
/// Physical base of the kernel page pool.
pub const KPOOL_BASE_PHYS: u32 = KPOOL_BASE_VIRT;

/// Base of the user half of the address space.
pub const USER_BASE_VIRT: u32 = 0x8000_0000;
/// Extent of the user half.
pub const UMEM_SIZE: u32 = 1 << 30;
/// Canonical top of the user stack.
pub const USER_STACK_TOP: u32 = USER_BASE_VIRT + UMEM_SIZE;

/// First physical address handed out by `frame_alloc_any`.
pub const USER_BASE_PHYS: u32 = 0x0200_0000;

/// Physical base of the boot page tables that map the kernel half.
/// Lies inside the booked kernel image region.
pub const KERNEL_PGTAB_BASE_PHYS: u32 = 0x0010_0000;

/// A physical address inside the DRAM window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysAddr(pub u32);

impl PhysAddr {
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const fn frame(self) -> FrameNumber {
        FrameNumber(self.0 >> PAGE_SHIFT as u32)
    }

    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE as u32 == 0
    }
}

/// A virtual address in the 4 GiB model space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtAddr(pub u32);

impl VirtAddr {
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE as u32 == 0
    }

    pub const fn page_base(self) -> VirtAddr {
        VirtAddr(self.0 & !(PAGE_SIZE as u32 - 1))
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// A page frame number within the DRAM window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FrameNumber(pub u32);

impl FrameNumber {
    pub const fn new(num: u32) -> Self {
        Self(num)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const fn base(self) -> PhysAddr {
        PhysAddr(self.0 << PAGE_SHIFT as u32)
    }
}

/// The null frame, returned when no frame is available.
pub const FRAME_NULL: FrameNumber = FrameNumber(u32::MAX);

/// Halves of the address space for range validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Area {
    User,
    Kernel,
}

/// Asserts that `vaddr` lies in user space.
pub fn is_uaddr(vaddr: VirtAddr) -> bool {
    let addr = u64::from(vaddr.0);
    addr >= u64::from(USER_BASE_VIRT) && addr < u64::from(USER_BASE_VIRT) + u64::from(UMEM_SIZE)
}

/// Asserts that `vaddr` lies in kernel space.
pub fn is_kaddr(vaddr: VirtAddr) -> bool {
    let addr = u64::from(vaddr.0);
    addr < u64::from(KERNEL_BASE_VIRT) + u64::from(KMEM_SIZE)
        || (addr >= u64::from(KPOOL_BASE_VIRT)
            && addr < u64::from(KPOOL_BASE_VIRT) + u64::from(KPOOL_SIZE))
}

/// Checks that `[vaddr, vaddr + size)` lies entirely in the requested half
/// of the address space. Overflow in the end address fails the check, it
/// never wraps.
pub fn check_area(vaddr: VirtAddr, size: usize, area: Area) -> bool {
    let start = u64::from(vaddr.0);
    let end = match start.checked_add(size as u64) {
        Some(end) if end <= u64::from(u32::MAX) + 1 => end,
        _ => return false,
    };

    match area {
        Area::User => {
            let base = u64::from(USER_BASE_VIRT);
            start >= base && end <= base + u64::from(UMEM_SIZE)
        }
        Area::Kernel => {
            let in_kernel =
                start < u64::from(KMEM_SIZE) && end <= u64::from(KMEM_SIZE);
            let kpool = u64::from(KPOOL_BASE_VIRT);
            let in_kpool = start >= kpool && end <= kpool + u64::from(KPOOL_SIZE);
            in_kernel || in_kpool
        }
    }
}

static ROOT_PGDIR: Once<PageDirectory> = Once::new();

/// The root page directory every address space copies its kernel half from.
pub fn root_pgdir() -> &'static PageDirectory {
    ROOT_PGDIR.call_once(vmem::build_root_pgdir)
}

/// Initializes the memory system: frame allocator, booked ranges, kernel
/// page pool, and the root page directory. Idempotent.
pub fn init(kargs: &Kargs) {
    use core::sync::atomic::{AtomicBool, Ordering};
    static ONLINE: AtomicBool = AtomicBool::new(false);
    if ONLINE.swap(true, Ordering::AcqRel) {
        return;
    }

    log::info!("initializing the memory system");

    frame::init();

    // Carve out everything that must never reach frame_alloc_any: the
    // kernel image (which also holds the boot page tables), the kernel
    // page pool, and the pinned boot modules.
    frame::frame_book_range(PhysAddr(0), PhysAddr(KMEM_SIZE))
        .expect("booking the kernel image");
    frame::frame_book_range(
        PhysAddr(KPOOL_BASE_PHYS),
        PhysAddr(KPOOL_BASE_PHYS + KPOOL_SIZE),
    )
    .expect("booking the kernel page pool");
    for module in kargs.modules() {
        frame::frame_book_range(PhysAddr(module.start), PhysAddr(module.end))
            .expect("booking a kernel module");
    }

    kpool::init();
    root_pgdir();

    let stats = frame::frame_stats();
    log::info!(
        "memory online: {} frames, {} free, {} booked",
        stats.total,
        stats.free,
        stats.booked
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_area_accepts_the_user_half_only() {
        assert!(check_area(VirtAddr(USER_BASE_VIRT), 16, Area::User));
        assert!(check_area(
            VirtAddr(USER_STACK_TOP - 16),
            16,
            Area::User
        ));
        assert!(!check_area(VirtAddr(USER_BASE_VIRT - 1), 16, Area::User));
        assert!(!check_area(VirtAddr(USER_STACK_TOP - 15), 16, Area::User));
        assert!(!check_area(VirtAddr(0x1000), 16, Area::User));
    }

    #[test]
    fn kernel_area_covers_image_and_pool() {
        assert!(check_area(VirtAddr(0x1000), 64, Area::Kernel));
        assert!(check_area(VirtAddr(KPOOL_BASE_VIRT), 64, Area::Kernel));
        assert!(!check_area(VirtAddr(USER_BASE_VIRT), 64, Area::Kernel));
    }

    #[test]
    fn overflowing_range_is_rejected_without_wrapping() {
        assert!(!check_area(VirtAddr(u32::MAX - 8), 64, Area::User));
        assert!(!check_area(VirtAddr(u32::MAX), usize::MAX, Area::User));
    }

    #[test]
    fn frame_and_address_conversions_round_trip() {
        let frame = FrameNumber::new(0x1234);
        assert_eq!(frame.base().frame(), frame);
        assert!(frame.base().is_page_aligned());
    }
}
