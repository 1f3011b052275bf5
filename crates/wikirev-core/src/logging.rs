//! Logging utilities with indicatif integration

use indicatif::MultiProgress;

/// ANSI color code and padded label for a log level.
fn level_style(level: log::Level, color: bool) -> (&'static str, &'static str, &'static str) {
    let label = match level {
        log::Level::Error => "ERROR",
        log::Level::Warn => "WARN ",
        log::Level::Info => "INFO ",
        log::Level::Debug => "DEBUG",
        log::Level::Trace => "TRACE",
    };
    if !color {
        return ("", label, "");
    }
    let ansi = match level {
        log::Level::Error => "\x1b[31m",
        log::Level::Warn => "\x1b[33m",
        log::Level::Info => "\x1b[32m",
        log::Level::Debug => "\x1b[36m",
        log::Level::Trace => "\x1b[35m",
    };
    (ansi, label, "\x1b[0m")
}

/// `w3 ` on orchestrator worker threads, empty elsewhere
fn worker_tag() -> String {
    std::thread::current()
        .name()
        .and_then(|name| name.strip_prefix("wikirev-"))
        .map(|n| format!("w{n} "))
        .unwrap_or_default()
}

/// Logger that prints through indicatif MultiProgress to avoid mixing with progress bars.
pub struct IndicatifLogger {
    inner: env_logger::Logger,
    multi: MultiProgress,
}

impl IndicatifLogger {
    pub fn new(inner: env_logger::Logger, multi: MultiProgress) -> Self {
        Self { inner, multi }
    }
}

impl log::Log for IndicatifLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &log::Record) {
        if self.inner.enabled(record.metadata()) {
            // TTY path: always has color (IndicatifLogger only used in TTY mode)
            let (pre, label, post) = level_style(record.level(), true);
            let line = format!("[{pre}{label}{post}] {}{}", worker_tag(), record.args());
            self.multi.suspend(|| eprintln!("{line}"));
        }
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

/// Default filter: our level for everything, HTTP stack held at warn
fn default_filter(quiet: bool, debug: bool) -> String {
    let level = if debug {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };
    format!("{level},reqwest=warn,hyper=warn,hyper_util=warn,native_tls=warn")
}

/// Initialize logging with optional TTY mode (indicatif integration).
///
/// `RUST_LOG` replaces the default filter entirely.
pub fn init_logging(
    quiet: bool,
    debug: bool,
    multi: Option<&MultiProgress>,
) -> Result<(), log::SetLoggerError> {
    use std::io::Write;

    let default_level = default_filter(quiet, debug);

    if let Some(multi) = multi {
        let logger = env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or(&default_level),
        )
        .format_timestamp_millis()
        .build();
        let max_level = logger.filter();

        log::set_boxed_logger(Box::new(IndicatifLogger::new(logger, multi.clone())))?;
        log::set_max_level(max_level);
    } else {
        // Non-TTY: no ANSI colors
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&default_level))
            .format(|buf, record| {
                let (_, label, _) = level_style(record.level(), false);
                writeln!(buf, "[{label}] {}{}", worker_tag(), record.args())
            })
            .try_init()?;
    }
    Ok(())
}
