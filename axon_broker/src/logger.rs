//! Console logger for the broker daemon.
//!
//! Small `log::Log` backend writing ANSI-colored level tags and
//! wall-clock timestamps to stderr. Verbosity comes from the CLI.

use colored::Colorize;
use log::{Level, LevelFilter, Log, Metadata, Record};

struct ConsoleLogger {
    level: LevelFilter,
}

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let tag = match record.level() {
            Level::Error => "[ERROR]".red().bold(),
            Level::Warn => "[WARN ]".yellow().bold(),
            Level::Info => "[INFO ]".blue(),
            Level::Debug => "[DEBUG]".dimmed(),
            Level::Trace => "[TRACE]".dimmed(),
        };
        let now = chrono::Local::now().format("%H:%M:%S%.3f");
        eprintln!("{now} {tag} {}", record.args());
    }

    fn flush(&self) {}
}

/// Install the logger. `verbose` lowers the threshold to debug.
pub fn init(verbose: bool) {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let logger = Box::new(ConsoleLogger { level });
    if log::set_boxed_logger(logger).is_ok() {
        log::set_max_level(level);
    }
}
