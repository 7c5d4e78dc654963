//! Hardware abstraction layer.
//!
//! Owns CPU bring-up ordering and the generic dispatch tables that sit
//! between the raw trap stubs and the rest of the kernel. When
//! [`init`] returns the guarantees of the boot contract hold: segmentation
//! installed, all 256 vectors wired, the legacy PIC remapped to 0x20-0x2f,
//! the I/O APIC programmed when the boot record describes one, and the
//! timer ticking at the configured frequency.
//!
//! Bring-up has nobody to report errors to: anything that goes wrong here
//! panics the boot.

pub mod interrupt;
pub mod irq;

use crate::kargs::Kargs;

/// Brings the CPU up. See the module docs for the post-conditions.
pub fn init(kargs: &Kargs) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        crate::arch::x86_64::gdt::init();
        crate::arch::x86_64::idt::init();
        crate::arch::x86_64::pic::init();
        if let Some(ioapic) = kargs.ioapic {
            crate::arch::x86_64::ioapic::init(ioapic);
        }
        crate::arch::x86_64::timer::init(crate::timer::FREQUENCY_HZ);
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    let _ = kargs;

    interrupt::init();
    log::info!("hal initialized");
}

/// Fatal kernel error: disable interrupts, report, halt.
///
/// There is no fallback path; nothing after this function runs.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn kpanic(msg: &str) -> ! {
    crate::arch::interrupts_disable();
    // SAFETY: interrupts are off on the only CPU, so nothing else can be
    // holding or taking the stdout device.
    unsafe {
        crate::dev::stdout::write_raw(b"PANIC: ");
        crate::dev::stdout::write_raw(msg.as_bytes());
        crate::dev::stdout::write_raw(b"\n");
    }
    crate::arch::halt()
}

/// Host rendering of a kernel panic, so tests can observe it.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub fn kpanic(msg: &str) -> ! {
    panic!("PANIC: {}", msg);
}
