//! Logging setup, routed around the progress display.
//!
//! TTY runs log through `MultiProgress::suspend` so a line never tears a
//! half-drawn bar; non-TTY runs emit timestamped plain lines suitable for
//! log aggregation. Debug-level lines carry the module target in both
//! modes, which is the fastest way to tell which pipeline stage spoke.

use indicatif::MultiProgress;

/// ANSI color and fixed-width label for a level.
fn level_color(level: log::Level) -> (&'static str, &'static str) {
    match level {
        log::Level::Error => ("\x1b[31m", "ERROR"),
        log::Level::Warn => ("\x1b[33m", "WARN "),
        log::Level::Info => ("\x1b[32m", "INFO "),
        log::Level::Debug => ("\x1b[36m", "DEBUG"),
        log::Level::Trace => ("\x1b[35m", "TRACE"),
    }
}

/// Whether the record's module target should be shown.
fn show_target(level: log::Level) -> bool {
    level >= log::Level::Debug
}

/// TTY logger that suspends the progress bars around each line.
///
/// Filtering is delegated to an inner `env_logger` built from the usual
/// `RUST_LOG` environment handling; only the rendering is ours.
pub struct HarvestLogger {
    inner: env_logger::Logger,
    multi: MultiProgress,
}

impl HarvestLogger {
    pub fn new(inner: env_logger::Logger, multi: MultiProgress) -> Self {
        Self { inner, multi }
    }

    fn render(record: &log::Record) -> String {
        let (color, label) = level_color(record.level());
        if show_target(record.level()) {
            format!(
                "{color}{label}\x1b[0m \x1b[2m{}\x1b[0m {}",
                record.target(),
                record.args()
            )
        } else {
            format!("{color}{label}\x1b[0m {}", record.args())
        }
    }
}

impl log::Log for HarvestLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &log::Record) {
        if self.inner.enabled(record.metadata()) {
            let line = Self::render(record);
            self.multi.suspend(|| eprintln!("{line}"));
        }
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

/// Initialize logging; pass the `MultiProgress` when running on a TTY.
pub fn init_logging(quiet: bool, debug: bool, multi: Option<&MultiProgress>) {
    use std::io::Write;

    let default_level = if debug {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };
    let env = env_logger::Env::default().default_filter_or(default_level);

    match multi {
        Some(multi) => {
            let logger = env_logger::Builder::from_env(env).build();
            let max_level = logger.filter();
            log::set_boxed_logger(Box::new(HarvestLogger::new(logger, multi.clone())))
                .expect("failed to init logger");
            log::set_max_level(max_level);
        }
        None => {
            // millisecond timestamps, no ANSI, target only at debug level
            env_logger::Builder::from_env(env)
                .format(|buf, record| {
                    let (_, label) = level_color(record.level());
                    if show_target(record.level()) {
                        writeln!(
                            buf,
                            "{} [{label}] {}: {}",
                            buf.timestamp_millis(),
                            record.target(),
                            record.args()
                        )
                    } else {
                        writeln!(
                            buf,
                            "{} [{label}] {}",
                            buf.timestamp_millis(),
                            record.args()
                        )
                    }
                })
                .init();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_fixed_width() {
        for level in [
            log::Level::Error,
            log::Level::Warn,
            log::Level::Info,
            log::Level::Debug,
            log::Level::Trace,
        ] {
            let (_, label) = level_color(level);
            assert_eq!(label.len(), 5);
        }
    }

    #[test]
    fn target_shown_for_debug_only() {
        assert!(show_target(log::Level::Debug));
        assert!(show_target(log::Level::Trace));
        assert!(!show_target(log::Level::Info));
        assert!(!show_target(log::Level::Warn));
        assert!(!show_target(log::Level::Error));
    }

    #[test]
    fn render_includes_target_at_debug() {
        let line = HarvestLogger::render(
            &log::Record::builder()
                .args(format_args!("fetching"))
                .level(log::Level::Debug)
                .target("oaharvest_pipeline::fetch")
                .build(),
        );
        assert!(line.contains("oaharvest_pipeline::fetch"));
        assert!(line.contains("fetching"));

        let info_line = HarvestLogger::render(
            &log::Record::builder()
                .args(format_args!("started"))
                .level(log::Level::Info)
                .target("oaharvest_pipeline::orchestrator")
                .build(),
        );
        assert!(!info_line.contains("orchestrator"));
    }
}
