//! System timer.
//!
//! One IRQ per tick; the handler bumps the monotonic tick counter and then
//! pokes the scheduler. The hardware side (PIT programming) lives in the
//! architecture layer.

use core::sync::atomic::{AtomicU64, Ordering};

/// Timer frequency in Hz.
pub const FREQUENCY_HZ: u32 = 100;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Monotonic tick count since boot.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Milliseconds since boot, derived from the tick count.
pub fn uptime_ms() -> u64 {
    ticks() * 1000 / u64::from(FREQUENCY_HZ)
}

/// Timer interrupt handler: advance the clock, then let the scheduler
/// account the tick.
pub fn handle_irq(_irq: u8) {
    TICKS.fetch_add(1, Ordering::Relaxed);
    crate::pm::sched::clock_tick();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uptime_follows_ticks() {
        let before = ticks();
        handle_irq(0);
        handle_irq(0);
        assert!(ticks() >= before + 2);
        assert_eq!(uptime_ms(), ticks() * 1000 / 100);
    }
}
