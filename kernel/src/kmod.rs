//! Kernel modules.
//!
//! Executable images handed in at boot, identified by their physical
//! bounds and a command line. The table is filled once during boot and
//! read-only afterwards; `spawn` takes its images from here.

use core::fmt;

use spin::Mutex;

use crate::error::KernelError;

/// Maximum number of kernel modules.
pub const KMOD_MAX: usize = 8;

/// Maximum length of a module command line.
pub const KMOD_CMDLINE_MAX: usize = 64;

/// One pre-loaded executable image.
#[derive(Clone, Copy)]
pub struct Kmod {
    /// First physical byte of the image.
    pub start: u32,
    /// One past the last physical byte.
    pub end: u32,
    cmdline: [u8; KMOD_CMDLINE_MAX],
    cmdline_len: usize,
}

impl Kmod {
    /// Builds a module record; the command line is truncated to fit.
    pub fn new(start: u32, end: u32, cmdline: &str) -> Self {
        let mut buf = [0u8; KMOD_CMDLINE_MAX];
        let len = cmdline.len().min(KMOD_CMDLINE_MAX);
        buf[..len].copy_from_slice(&cmdline.as_bytes()[..len]);
        Self {
            start,
            end,
            cmdline: buf,
            cmdline_len: len,
        }
    }

    pub fn cmdline(&self) -> &str {
        core::str::from_utf8(&self.cmdline[..self.cmdline_len]).unwrap_or("")
    }

    /// Raw command-line bytes, padded to the fixed width.
    pub fn cmdline_bytes(&self) -> &[u8; KMOD_CMDLINE_MAX] {
        &self.cmdline
    }
}

impl fmt::Debug for Kmod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kmod")
            .field("start", &self.start)
            .field("end", &self.end)
            .field("cmdline", &self.cmdline())
            .finish()
    }
}

/// Bounded module table.
pub struct KmodTable {
    slots: Mutex<[Option<Kmod>; KMOD_MAX]>,
}

impl KmodTable {
    pub const fn new() -> Self {
        Self {
            slots: Mutex::new([None; KMOD_MAX]),
        }
    }

    /// Registers a module in the first free slot.
    pub fn register(&self, module: Kmod) -> Result<(), KernelError> {
        if module.start >= module.end {
            return Err(KernelError::InvalidArgument);
        }

        let mut slots = self.slots.lock();
        for slot in slots.iter_mut() {
            if slot.is_none() {
                *slot = Some(module);
                return Ok(());
            }
        }
        Err(KernelError::InvalidArgument)
    }

    pub fn count(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.is_some()).count()
    }

    pub fn get(&self, index: usize) -> Option<Kmod> {
        self.slots.lock().get(index).copied().flatten()
    }
}

impl Default for KmodTable {
    fn default() -> Self {
        Self::new()
    }
}

/// The system module table.
static KMODS: KmodTable = KmodTable::new();

/// Registers a kernel module. Boot only.
pub fn kmod_register(start: u32, end: u32, cmdline: &str) -> Result<(), KernelError> {
    KMODS.register(Kmod::new(start, end, cmdline))
}

/// Number of registered kernel modules.
pub fn kmod_count() -> usize {
    KMODS.count()
}

/// Information on the `index`-th kernel module.
pub fn kmod_get(index: usize) -> Option<Kmod> {
    KMODS.get(index)
}

/// The bytes of the `index`-th module image.
///
/// On bare metal the image sits pinned in physical memory, which the
/// kernel sees identity-mapped. The host build reads from the pinned-image
/// registry the boot path fills instead.
pub fn kmod_image(index: usize) -> Option<&'static [u8]> {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        let module = KMODS.get(index)?;
        let len = (module.end - module.start) as usize;
        // SAFETY: the module range was handed over by the boot contract,
        // booked in the frame allocator, and never written after boot.
        Some(unsafe { core::slice::from_raw_parts(module.start as usize as *const u8, len) })
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        KMODS.get(index)?;
        IMAGES.lock().get(index).copied().flatten()
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
static IMAGES: Mutex<[Option<&'static [u8]>; KMOD_MAX]> = Mutex::new([None; KMOD_MAX]);

/// Pins the byte contents of the `index`-th module. Host boot path only;
/// on bare metal the physical range itself is the image.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub fn kmod_pin_image(index: usize, bytes: &'static [u8]) {
    if let Some(slot) = IMAGES.lock().get_mut(index) {
        *slot = Some(bytes);
    }
}

/// Dumps the module table.
pub fn kmod_print() {
    for index in 0..KMOD_MAX {
        if let Some(module) = KMODS.get(index) {
            log::info!(
                "kmod {}: {:#010x}-{:#010x} \"{}\"",
                index,
                module.start,
                module.end,
                module.cmdline()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_get_round_trip() {
        let table = KmodTable::new();
        table
            .register(Kmod::new(0x0180_0000, 0x0180_4000, "init one"))
            .unwrap();

        assert_eq!(table.count(), 1);
        let module = table.get(0).unwrap();
        assert_eq!(module.start, 0x0180_0000);
        assert_eq!(module.cmdline(), "init one");
        assert!(table.get(1).is_none());
    }

    #[test]
    fn empty_ranges_are_rejected() {
        let table = KmodTable::new();
        assert!(table.register(Kmod::new(0x1000, 0x1000, "x")).is_err());
    }

    #[test]
    fn long_cmdlines_are_truncated() {
        let long = "a".repeat(2 * KMOD_CMDLINE_MAX);
        let module = Kmod::new(0, 0x1000, &long);
        assert_eq!(module.cmdline().len(), KMOD_CMDLINE_MAX);
    }

    #[test]
    fn table_is_bounded() {
        let table = KmodTable::new();
        for i in 0..KMOD_MAX as u32 {
            table
                .register(Kmod::new(i * 0x1000, (i + 1) * 0x1000, "m"))
                .unwrap();
        }
        assert!(table
            .register(Kmod::new(0x9000_0000, 0x9000_1000, "extra"))
            .is_err());
    }
}
