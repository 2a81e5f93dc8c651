//! Logging setup, matching `maelstrom_util::log`: a terminal-decorated,
//! asynchronous `slog` drain shared by the CLI and the compute-resource
//! daemon.

use slog::{o, Drain, Level, Logger};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    Error,
    Warning,
    #[default]
    Info,
    Debug,
}

impl LogLevel {
    fn to_slog_level(self) -> Level {
        match self {
            LogLevel::Error => Level::Error,
            LogLevel::Warning => Level::Warning,
            LogLevel::Info => Level::Info,
            LogLevel::Debug => Level::Debug,
        }
    }
}

pub fn build_logger(level: LogLevel) -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog::LevelFilter::new(drain, level.to_slog_level()).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!())
}

/// Builds a logger at `level` and runs `body` with it, the shape every
/// `jobrelay` binary entry point uses (`maelstrom-run`'s
/// `log::run_with_logger`).
pub fn run_with_logger<T>(level: LogLevel, body: impl FnOnce(Logger) -> anyhow::Result<T>) -> anyhow::Result<T> {
    let logger = build_logger(level);
    body(logger)
}
