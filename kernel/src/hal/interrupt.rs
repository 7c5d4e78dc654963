//! Exception and interrupt dispatch tables.
//!
//! Two fixed per-vector tables sit between the low-level trap stubs and the
//! kernel proper: one for CPU exceptions (0-31), one for hardware
//! interrupts (IRQ 0-15). Registration claims a vector; a second
//! registration on the same vector fails busy until the first is undone.
//!
//! Handlers run from interrupt context: they must not allocate and must not
//! block. Interrupts are masked for the whole dispatch; the controller is
//! acknowledged by the trap stub after the handler returns, before the
//! interrupted flags (and with them IF) are restored.

use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::error::IntrError;

/// Number of CPU exception vectors.
pub const EXCEPTIONS_NUM: usize = 32;

/// Number of hardware interrupt lines.
pub const IRQS_NUM: usize = 16;

/// Snapshot of the interrupted execution state handed to exception
/// handlers.
#[derive(Debug, Clone, Copy)]
pub struct ExceptionContext {
    /// Exception vector number.
    pub num: u8,
    /// Instruction pointer at the time of the fault.
    pub instruction: u64,
    /// Faulting memory address (page fault only, otherwise 0).
    pub addr: u64,
    /// Hardware error code, 0 for vectors that push none.
    pub error_code: u64,
    /// Whether the fault came from ring 3.
    pub user_mode: bool,
}

/// Exception handler. Receives the frozen state of the faulting context.
pub type ExceptionHandler = fn(&ExceptionContext);

/// Interrupt handler. Receives the logical IRQ number that fired.
pub type IrqHandler = fn(u8);

struct HandlerTables {
    exceptions: [Option<ExceptionHandler>; EXCEPTIONS_NUM],
    irqs: [Option<IrqHandler>; IRQS_NUM],
}

static TABLES: Mutex<HandlerTables> = Mutex::new(HandlerTables {
    exceptions: [None; EXCEPTIONS_NUM],
    irqs: [None; IRQS_NUM],
});

/// Spurious arrivals per IRQ line (no handler installed).
static SPURIOUS: [AtomicU64; IRQS_NUM] = [const { AtomicU64::new(0) }; IRQS_NUM];

/// Resets both tables to the default handlers.
pub fn init() {
    let mut tables = TABLES.lock();
    tables.exceptions = [None; EXCEPTIONS_NUM];
    tables.irqs = [None; IRQS_NUM];
}

/// Installs `handler` on IRQ line `irq`.
///
/// Fails busy if a non-default handler is already installed.
pub fn interrupt_register(irq: u8, handler: IrqHandler) -> Result<(), IntrError> {
    let slot = usize::from(irq);
    if slot >= IRQS_NUM {
        return Err(IntrError::InvalidVector);
    }

    let mut tables = TABLES.lock();
    if tables.irqs[slot].is_some() {
        return Err(IntrError::Busy);
    }
    tables.irqs[slot] = Some(handler);

    log::info!("interrupt handler registered for irq {}", irq);
    Ok(())
}

/// Restores the default handler on IRQ line `irq`.
pub fn interrupt_unregister(irq: u8) -> Result<(), IntrError> {
    let slot = usize::from(irq);
    if slot >= IRQS_NUM {
        return Err(IntrError::InvalidVector);
    }

    TABLES.lock().irqs[slot] = None;
    Ok(())
}

/// Installs `handler` on exception vector `num`.
///
/// Fails busy if a non-default handler is already installed.
pub fn exception_register(num: u8, handler: ExceptionHandler) -> Result<(), IntrError> {
    let slot = usize::from(num);
    if slot >= EXCEPTIONS_NUM {
        return Err(IntrError::InvalidVector);
    }

    let mut tables = TABLES.lock();
    if tables.exceptions[slot].is_some() {
        return Err(IntrError::Busy);
    }
    tables.exceptions[slot] = Some(handler);
    Ok(())
}

/// Restores the default handler on exception vector `num`.
pub fn exception_unregister(num: u8) -> Result<(), IntrError> {
    let slot = usize::from(num);
    if slot >= EXCEPTIONS_NUM {
        return Err(IntrError::InvalidVector);
    }

    TABLES.lock().exceptions[slot] = None;
    Ok(())
}

/// Routes an IRQ arrival to its handler.
///
/// Called by the trap stub with interrupts masked. Unhandled lines are
/// counted and reported once.
pub fn irq_dispatch(irq: u8) {
    let slot = usize::from(irq);
    if slot >= IRQS_NUM {
        log::warn!("unknown irq {}", irq);
        return;
    }

    let handler = TABLES.lock().irqs[slot];
    match handler {
        Some(handler) => handler(irq),
        None => {
            if SPURIOUS[slot].fetch_add(1, Ordering::Relaxed) == 0 {
                log::warn!("spurious interrupt on irq {}", irq);
            }
        }
    }
}

/// Routes an exception to its handler, defaulting to the exception service.
///
/// Called by the trap stub with interrupts masked.
pub fn exception_dispatch(ctx: &ExceptionContext) {
    let slot = usize::from(ctx.num);
    if slot >= EXCEPTIONS_NUM {
        crate::hal::kpanic("exception vector out of range");
    }

    let handler = TABLES.lock().exceptions[slot];
    match handler {
        Some(handler) => handler(ctx),
        None => crate::excp::forward(ctx),
    }
}

/// Spurious arrival count for an IRQ line.
pub fn spurious_count(irq: u8) -> u64 {
    SPURIOUS
        .get(usize::from(irq))
        .map(|c| c.load(Ordering::Relaxed))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};

    static FIRED: AtomicU32 = AtomicU32::new(0);

    fn count_irq(_irq: u8) {
        FIRED.fetch_add(1, Ordering::Relaxed);
    }

    fn other_irq(_irq: u8) {}

    #[test]
    fn second_registration_is_busy() {
        assert_eq!(interrupt_register(5, count_irq), Ok(()));
        assert_eq!(interrupt_register(5, other_irq), Err(IntrError::Busy));
        assert_eq!(interrupt_unregister(5), Ok(()));
        assert_eq!(interrupt_register(5, other_irq), Ok(()));
        interrupt_unregister(5).unwrap();
    }

    #[test]
    fn dispatch_reaches_registered_handler() {
        interrupt_register(6, count_irq).unwrap();
        let before = FIRED.load(Ordering::Relaxed);
        irq_dispatch(6);
        assert_eq!(FIRED.load(Ordering::Relaxed), before + 1);
        interrupt_unregister(6).unwrap();
    }

    #[test]
    fn unhandled_irq_is_counted_not_fatal() {
        let before = spurious_count(7);
        irq_dispatch(7);
        assert_eq!(spurious_count(7), before + 1);
    }

    #[test]
    fn out_of_range_vectors_are_rejected() {
        assert_eq!(
            interrupt_register(IRQS_NUM as u8, count_irq),
            Err(IntrError::InvalidVector)
        );
        assert_eq!(
            exception_register(EXCEPTIONS_NUM as u8, |_| {}),
            Err(IntrError::InvalidVector)
        );
    }
}
