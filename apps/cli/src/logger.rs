//! Stderr logger for the `log` facade.
//!
//! Stdout carries daemon responses and inspect listings, so log lines go to
//! stderr only.

use std::io::Write;

use log::{LevelFilter, Log, Metadata, Record};

static LOGGER: StderrLogger = StderrLogger;

struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(
            stderr,
            "[{:<5} {}] {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

/// Installs the logger. Calling it twice only updates the level.
pub fn init(level: LevelFilter) {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}

/// Raises `base` by one level per `-v`.
pub fn level_with_verbosity(base: LevelFilter, verbose: u8) -> LevelFilter {
    let levels = [
        LevelFilter::Off,
        LevelFilter::Error,
        LevelFilter::Warn,
        LevelFilter::Info,
        LevelFilter::Debug,
        LevelFilter::Trace,
    ];
    let index = levels.iter().position(|&l| l == base).unwrap_or(3);
    levels[(index + verbose as usize).min(levels.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_with_verbosity() {
        assert_eq!(level_with_verbosity(LevelFilter::Info, 0), LevelFilter::Info);
        assert_eq!(level_with_verbosity(LevelFilter::Info, 1), LevelFilter::Debug);
        assert_eq!(level_with_verbosity(LevelFilter::Warn, 9), LevelFilter::Trace);
    }
}
