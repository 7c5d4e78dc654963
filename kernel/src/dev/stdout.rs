//! Standard output device.
//!
//! A byte-oriented sink with two operations: [`init`] and [`write`]. The
//! backing driver is chosen at build time: the UART by default, the VGA
//! text buffer behind the `stdout-vga` feature. Line buffering is the
//! caller's business, not the driver's.
//!
//! The host build routes output into a capture buffer so tests can assert
//! on what the kernel printed.

use core::fmt;

use spin::Mutex;

/// Byte sink contract satisfied by every stdout backend.
pub trait StdoutDevice {
    /// Puts the device into a usable state.
    fn init(&mut self);

    /// Writes `buf` to the device, blocking until it is accepted.
    fn write(&mut self, buf: &[u8]);
}

#[cfg(all(target_arch = "x86_64", target_os = "none", not(feature = "stdout-vga")))]
type Backend = crate::arch::x86_64::serial::SerialOut;

#[cfg(all(target_arch = "x86_64", target_os = "none", feature = "stdout-vga"))]
type Backend = crate::arch::x86_64::vga::VgaOut;

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
type Backend = capture::CaptureOut;

static STDOUT: Mutex<Backend> = Mutex::new(Backend::new());

/// Initializes the standard output device.
pub fn init() {
    STDOUT.lock().init();
}

/// Writes a byte buffer to the standard output device.
pub fn write(buf: &[u8]) {
    STDOUT.lock().write(buf);
}

/// Writes to the device without taking the lock.
///
/// Only for panic paths: the panicking CPU may hold the stdout lock, and
/// nobody else runs once interrupts are off.
///
/// # Safety
///
/// Caller must guarantee that no other context touches the device
/// concurrently (in practice: interrupts disabled on the only CPU).
pub unsafe fn write_raw(buf: &[u8]) {
    // SAFETY: the caller upholds exclusive access; we bypass the lock by
    // force-unlocking a fresh guard scope.
    unsafe { STDOUT.force_unlock() };
    STDOUT.lock().write(buf);
}

struct Writer;

impl fmt::Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        write(s.as_bytes());
        Ok(())
    }
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use fmt::Write;
    // Formatting cannot fail on an infallible sink.
    Writer.write_fmt(args).ok();
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod capture {
    //! Host-side stdout backend: appends into a buffer tests can drain.

    extern crate alloc;
    use alloc::vec::Vec;

    use spin::Mutex;

    use super::StdoutDevice;

    static CAPTURED: Mutex<Vec<u8>> = Mutex::new(Vec::new());

    pub struct CaptureOut;

    impl CaptureOut {
        pub const fn new() -> Self {
            Self
        }
    }

    impl StdoutDevice for CaptureOut {
        fn init(&mut self) {
            CAPTURED.lock().clear();
        }

        fn write(&mut self, buf: &[u8]) {
            CAPTURED.lock().extend_from_slice(buf);
        }
    }

    /// Drains and returns everything written so far.
    pub fn take() -> Vec<u8> {
        core::mem::take(&mut *CAPTURED.lock())
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub use capture::take as take_captured;

