// Legacy 8259 PIC pair

use pic8259::ChainedPics;
use spin::Mutex;

/// First vector of the remapped IRQ range. The CPU reserves vectors 0-31
/// for exceptions, so IRQ 0-15 land on 0x20-0x2f.
pub const PIC_VECTOR_OFFSET: u8 = 0x20;

static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(PIC_VECTOR_OFFSET, PIC_VECTOR_OFFSET + 8) });

/// Remaps and unmasks the PIC pair.
pub fn init() {
    // SAFETY: the offsets do not collide with CPU exceptions, and this runs
    // once during bring-up before interrupts are enabled.
    unsafe { PICS.lock().initialize() };
}

/// Acknowledges IRQ line `irq` on the controller.
///
/// Called after the handler returns and before the interrupted flags are
/// restored, so a storm on the same line cannot re-enter the handler.
pub fn eoi(irq: u8) {
    // SAFETY: only called from the trap stub for a vector the PIC raised.
    unsafe {
        PICS.lock().notify_end_of_interrupt(PIC_VECTOR_OFFSET + irq);
    }
}
