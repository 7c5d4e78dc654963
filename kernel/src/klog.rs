//! Kernel logger.
//!
//! Bridges the `log` facade onto the standard output device. Levels follow
//! the error-handling design: kernel calls trace, soft errors warn, and
//! fatal errors never come through here (they go straight to `kpanic`).

use log::{LevelFilter, Metadata, Record};

struct Klog;

static KLOG: Klog = Klog;

impl log::Log for Klog {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            crate::kprintln!(
                "[{}] {}: {}",
                record.level().as_str(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

/// Installs the kernel logger.
///
/// Safe to call more than once; only the first call wins.
pub fn init(level: LevelFilter) {
    if log::set_logger(&KLOG).is_ok() {
        log::set_max_level(level);
    }
}

#[cfg(test)]
mod tests {
    use log::LevelFilter;

    #[test]
    fn records_reach_stdout() {
        super::init(LevelFilter::Trace);
        log::warn!(target: "klog-probe", "soft error {}", 42);
        let got = crate::dev::stdout::take_captured();
        let text = core::str::from_utf8(&got).unwrap();
        assert!(text.contains("[WARN] klog-probe: soft error 42"));
    }
}
