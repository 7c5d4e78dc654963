//! Obsidian microkernel.
//!
//! Brings the CPU from its reset-like entry state into a running
//! multi-tasking environment and then mediates CPU time, memory,
//! interrupts, and synchronization on behalf of unprivileged processes.
//!
//! The library builds for two targets: the bare-metal kernel proper, and
//! the host triple, where the hardware-independent core (memory manager,
//! tables, scheduler bookkeeping, synchronization, kernel calls, the
//! exception service) runs under the standard test harness.

#![no_std]
#![cfg_attr(
    all(target_arch = "x86_64", target_os = "none"),
    feature(abi_x86_interrupt)
)]

extern crate alloc;

// The host build links std for the test harness and uses the system
// allocator; the kernel proper carves its heap out of the image.
#[cfg(not(target_os = "none"))]
extern crate std;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use linked_list_allocator::LockedHeap;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
const KERNEL_HEAP_SIZE: usize = 1 << 20;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
static mut KERNEL_HEAP: [u8; KERNEL_HEAP_SIZE] = [0; KERNEL_HEAP_SIZE];

#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[macro_use]
pub mod print;

pub mod arch;
pub mod dev;
pub mod error;
pub mod excp;
pub mod hal;
pub mod kargs;
pub mod kcall;
pub mod klog;
pub mod kmod;
pub mod mm;
pub mod pm;
pub mod timer;

use core::sync::atomic::{AtomicBool, Ordering};

use spin::Once;

use kargs::Kargs;

static KARGS: Once<Kargs> = Once::new();
static BOOTED: AtomicBool = AtomicBool::new(false);

/// The boot-time kernel arguments, retained for the kernel's lifetime.
pub fn kernel_args() -> Option<&'static Kargs> {
    KARGS.get()
}

/// Boots the kernel core in dependency order: devices and logging, the
/// HAL, the memory system, the process manager, and finally the timer
/// wiring. Idempotent; only the first call does anything.
pub fn boot(kargs: Kargs) {
    if BOOTED.swap(true, Ordering::AcqRel) {
        return;
    }

    dev::init();
    klog::init(log::LevelFilter::Info);
    kprintln!("obsidian {}", env!("CARGO_PKG_VERSION"));

    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        // SAFETY: the heap region is a static this function owns; boot
        // runs once, before anything allocates.
        unsafe {
            ALLOCATOR
                .lock()
                .init(&raw mut KERNEL_HEAP as *mut u8, KERNEL_HEAP_SIZE);
        }
    }

    let kargs = KARGS.call_once(|| kargs);

    hal::init(kargs);
    mm::init(kargs);
    pm::init();

    for module in kargs.modules() {
        if let Err(e) = kmod::kmod_register(module.start, module.end, module.cmdline()) {
            log::warn!("dropping kernel module {:?}: {}", module, e);
        }
    }
    kmod::kmod_print();

    hal::interrupt::interrupt_register(0, timer::handle_irq)
        .expect("claiming the timer interrupt");

    log::info!("kernel core online");
}

/// Spawns one process per registered boot module, in boot order.
pub fn spawn_boot_modules() {
    for index in 0..kmod::kmod_count() {
        match kmod::kmod_image(index).map(pm::process::create) {
            Some(Ok(pid)) => log::info!("boot module {} running as process {}", index, pid),
            Some(Err(e)) => log::warn!("boot module {} failed to spawn: {}", index, e),
            None => log::warn!("boot module {} has no pinned image", index),
        }
    }
}
