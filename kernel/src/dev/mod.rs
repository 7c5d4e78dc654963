//! Device layer.
//!
//! The core only depends on one device contract: a byte-oriented standard
//! output sink. Concrete drivers live in the architecture layer and are
//! selected at build time.

pub mod stdout;

/// Initializes all devices known to the kernel.
pub fn init() {
    stdout::init();
    log::info!("devices initialized");
}
