//! Logical-to-physical IRQ remapping.
//!
//! Boot code discovers how interrupt lines are actually wired (legacy PIC,
//! I/O APIC, or a virtualized controller) and remaps the logical numbers
//! the kernel uses onto the physical lines it found.

use spin::Mutex;

use crate::error::IntrError;
use crate::hal::interrupt::IRQS_NUM;

static IRQS: Mutex<[u8; IRQS_NUM]> =
    Mutex::new([0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15]);

/// Remaps logical IRQ `logical` onto physical line `physical`.
///
/// Returns the previous physical number so the caller can undo the change.
pub fn irq_remap(logical: u8, physical: u8) -> Result<u8, IntrError> {
    let slot = usize::from(logical);
    if slot >= IRQS_NUM {
        log::error!("invalid logical irq number (irq={})", logical);
        return Err(IntrError::InvalidVector);
    }

    let mut irqs = IRQS.lock();
    let old = irqs[slot];
    irqs[slot] = physical;

    // This may severely impact the system, so say it loudly.
    log::info!("remapped irq {} to {}", logical, physical);

    Ok(old)
}

/// Looks up the physical line behind logical IRQ `logical`.
pub fn irq_lookup(logical: u8) -> Result<u8, IntrError> {
    let slot = usize::from(logical);
    if slot >= IRQS_NUM {
        log::error!("invalid logical irq number (irq={})", logical);
        return Err(IntrError::InvalidVector);
    }

    Ok(IRQS.lock()[slot])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remap_returns_old_mapping_for_undo() {
        let old = irq_remap(9, 12).unwrap();
        assert_eq!(irq_lookup(9), Ok(12));
        irq_remap(9, old).unwrap();
        assert_eq!(irq_lookup(9), Ok(old));
    }

    #[test]
    fn out_of_range_logical_irq_fails() {
        assert_eq!(irq_remap(16, 0), Err(IntrError::InvalidVector));
        assert_eq!(irq_lookup(16), Err(IntrError::InvalidVector));
    }
}
