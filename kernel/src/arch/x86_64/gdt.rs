//! Segmentation tables and the kernel stacks behind them.
//!
//! The flat model needs exactly five descriptors: kernel code and data
//! (ring 0), user data and code (ring 3), and a TSS whose ring-0 stack
//! slot decides where the CPU lands when ring 3 traps into the kernel.
//! That slot starts on a statically reserved boot stack and is repointed
//! by the scheduler at the running thread's kernel stack on every switch.

use core::cell::UnsafeCell;

use lazy_static::lazy_static;
use x86_64::registers::segmentation::{Segment, CS, DS, SS};
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

/// IST slot the double-fault handler runs on.
pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

const STACK_SIZE: usize = 16 * 1024;

/// A statically reserved kernel stack. The cell keeps the bytes in
/// writable memory; 16-byte alignment is what the ABI expects of a stack
/// top.
#[repr(C, align(16))]
struct BootStack(UnsafeCell<[u8; STACK_SIZE]>);

// SAFETY: the bytes are only ever touched by the CPU using the region as
// a stack, and each region backs exactly one context at a time.
unsafe impl Sync for BootStack {}

impl BootStack {
    const fn new() -> Self {
        Self(UnsafeCell::new([0; STACK_SIZE]))
    }

    /// One past the last byte: where RSP starts.
    fn top(&'static self) -> VirtAddr {
        VirtAddr::from_ptr(self.0.get()) + STACK_SIZE as u64
    }
}

/// Ring-0 entry stack used until the scheduler takes over RSP0.
static BOOT_STACK: BootStack = BootStack::new();

/// Stack of last resort: a double fault must not ride whatever kernel
/// stack just failed.
static FAULT_STACK: BootStack = BootStack::new();

/// Flat-model segment selectors for both rings.
pub struct Selectors {
    pub kernel_code: SegmentSelector,
    pub kernel_data: SegmentSelector,
    pub tss: SegmentSelector,
    pub user_data: SegmentSelector,
    pub user_code: SegmentSelector,
}

/// The TSS keeps changing after the descriptor is handed to the CPU: the
/// scheduler rewrites RSP0 on every context switch. The cell makes that
/// post-publication mutation explicit.
struct TssCell(UnsafeCell<TaskStateSegment>);

// SAFETY: mutation goes through `set_kernel_stack` alone, which runs with
// interrupts masked on the only CPU, so no ring crossing can read the TSS
// mid-store.
unsafe impl Sync for TssCell {}

lazy_static! {
    static ref TSS: TssCell = {
        let mut tss = TaskStateSegment::new();
        tss.privilege_stack_table[0] = BOOT_STACK.top();
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = FAULT_STACK.top();
        TssCell(UnsafeCell::new(tss))
    };

    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();
        // User data before user code: SYSRET derives SS and CS from one
        // base selector in that order.
        let selectors = Selectors {
            kernel_code: gdt.append(Descriptor::kernel_code_segment()),
            kernel_data: gdt.append(Descriptor::kernel_data_segment()),
            // SAFETY: the TSS lives in a leaked lazy static and never
            // moves after the descriptor captures its address.
            tss: gdt.append(Descriptor::tss_segment(unsafe { &*TSS.0.get() })),
            user_data: gdt.append(Descriptor::user_data_segment()),
            user_code: gdt.append(Descriptor::user_code_segment()),
        };
        (gdt, selectors)
    };
}

/// Loads the GDT and TSS and moves the segment registers the flat model
/// relies on onto the new descriptors.
pub fn init() {
    use x86_64::instructions::tables::load_tss;

    GDT.0.load();
    let selectors = &GDT.1;
    // SAFETY: every selector indexes the table loaded on the line above.
    unsafe {
        CS::set_reg(selectors.kernel_code);
        SS::set_reg(selectors.kernel_data);
        DS::set_reg(selectors.kernel_data);
        load_tss(selectors.tss);
    }
}

/// Segment selectors installed by [`init`].
pub fn selectors() -> &'static Selectors {
    &GDT.1
}

/// Repoints the TSS ring-0 stack at `stack_top`.
///
/// Called on the context-switch path so the next user-to-kernel crossing
/// lands on the new thread's kernel stack. The caller holds interrupts
/// masked.
pub fn set_kernel_stack(stack_top: u64) {
    // SAFETY: see `TssCell`; single writer, no concurrent reader while
    // interrupts are off.
    unsafe {
        (*TSS.0.get()).privilege_stack_table[0] = VirtAddr::new(stack_top);
    }
}
