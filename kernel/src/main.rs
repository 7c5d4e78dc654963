//! Bare-metal kernel binary.
//!
//! The kernel proper only exists on the `x86_64-unknown-none` target; the
//! host build of this binary is an inert stub so the workspace builds
//! everywhere.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod kernel {
    use core::panic::PanicInfo;

    use bootloader_api::{entry_point, BootInfo};
    use obsidian_kernel::{kargs::Kargs, kprintln, mm, pm};

    entry_point!(kmain);

    fn kmain(boot_info: &'static mut BootInfo) -> ! {
        // Clamp usable RAM to the DRAM window the frame allocator
        // manages.
        let mut memory_end = 0u64;
        for region in boot_info.memory_regions.iter() {
            if region.kind == bootloader_api::info::MemoryRegionKind::Usable
                && region.end > memory_end
            {
                memory_end = region.end;
            }
        }
        let memory_end = memory_end.min(mm::MEMORY_SIZE as u64) as u32;

        let kargs = Kargs::new(0, memory_end);

        obsidian_kernel::boot(kargs);
        obsidian_kernel::spawn_boot_modules();
        pm::sched::run()
    }

    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        kprintln!("[KERNEL PANIC] {}", info);
        obsidian_kernel::arch::halt()
    }
}

#[cfg(not(target_os = "none"))]
fn main() {}
