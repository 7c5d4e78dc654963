//! I/O APIC programming.
//!
//! The boot record may carry a pre-parsed interrupt-controller summary
//! (byte-level MADT parsing happens outside the core). When it does, the
//! legacy IRQ lines are routed through the I/O APIC redirection table onto
//! the same vectors the PIC remap uses, honoring the source overrides the
//! summary reports.

use core::ptr;

use spin::Mutex;

use crate::kargs::IoApicInfo;

use super::pic::PIC_VECTOR_OFFSET;

/// Register-select window offset.
const IOREGSEL: usize = 0x00;
/// Register-data window offset.
const IOWIN: usize = 0x10;

/// Redirection table base register index; two 32-bit registers per entry.
const REG_REDTBL_BASE: u32 = 0x10;

/// Masked bit in a redirection entry low word.
const REDTBL_MASKED: u32 = 1 << 16;

struct IoApic {
    base: usize,
}

impl IoApic {
    fn read(&self, reg: u32) -> u32 {
        // SAFETY: the MMIO window was reported by the boot record and is
        // identity-mapped; IOREGSEL/IOWIN is the architected access
        // protocol.
        unsafe {
            ptr::write_volatile((self.base + IOREGSEL) as *mut u32, reg);
            ptr::read_volatile((self.base + IOWIN) as *const u32)
        }
    }

    fn write(&self, reg: u32, value: u32) {
        // SAFETY: as in `read`.
        unsafe {
            ptr::write_volatile((self.base + IOREGSEL) as *mut u32, reg);
            ptr::write_volatile((self.base + IOWIN) as *mut u32, value);
        }
    }

    fn route(&self, gsi: u8, vector: u8) {
        let reg = REG_REDTBL_BASE + u32::from(gsi) * 2;
        // Fixed delivery, physical destination, active high, edge
        // triggered, destination APIC 0.
        self.write(reg, u32::from(vector));
        self.write(reg + 1, 0);
    }

    fn mask(&self, gsi: u8) {
        let reg = REG_REDTBL_BASE + u32::from(gsi) * 2;
        let low = self.read(reg);
        self.write(reg, low | REDTBL_MASKED);
    }
}

static IOAPIC: Mutex<Option<IoApic>> = Mutex::new(None);

/// Routes the legacy IRQ lines through the I/O APIC described by `info`.
pub fn init(info: IoApicInfo) {
    let ioapic = IoApic {
        base: info.base as usize,
    };

    for irq in 0..crate::hal::interrupt::IRQS_NUM as u8 {
        let gsi = info.gsi_for(irq);
        ioapic.route(gsi, PIC_VECTOR_OFFSET + irq);
        if gsi != irq {
            // The boot record reported an interrupt source override.
            crate::hal::irq::irq_remap(irq, gsi).ok();
        }
    }

    *IOAPIC.lock() = Some(ioapic);
    log::info!("ioapic online at {:#x}", info.base);
}

/// Masks a line at the I/O APIC, when one is present.
pub fn mask_irq(irq: u8) {
    if let Some(ioapic) = IOAPIC.lock().as_ref() {
        ioapic.mask(irq);
    }
}
