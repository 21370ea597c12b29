//! Structured logging setup.
//!
//! Follows the gateway's layered `tracing-subscriber` setup: an
//! env-filter driven by the configured [`LogLevel`], a JSON-formatted
//! rotating file sink via `tracing-appender` for `adapter.log`, a second
//! sink restricted to warnings and above for `adapter.error.log`, and a
//! human-readable stderr layer for interactive runs.

use crate::config::LogLevel;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    filter::LevelFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

/// Must be kept alive for the lifetime of the process: dropping either
/// guard stops that sink's background flush thread.
pub struct LoggingGuard {
    _main_guard: WorkerGuard,
    _error_guard: WorkerGuard,
}

pub fn init(log_dir: &Path, level: LogLevel) -> std::io::Result<LoggingGuard> {
    std::fs::create_dir_all(log_dir)?;

    let main_appender = tracing_appender::rolling::daily(log_dir, "adapter.log");
    let (non_blocking_main, main_guard) = tracing_appender::non_blocking(main_appender);

    let error_appender = tracing_appender::rolling::daily(log_dir, "adapter.error.log");
    let (non_blocking_error, error_guard) = tracing_appender::non_blocking(error_appender);

    let level_str = match level {
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warning => "warn",
        LogLevel::Error => "error",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_str));

    let main_layer = fmt::layer()
        .json()
        .with_writer(non_blocking_main)
        .with_ansi(false);

    let error_layer = fmt::layer()
        .json()
        .with_writer(non_blocking_error)
        .with_ansi(false)
        .with_filter(LevelFilter::WARN);

    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_ansi(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(main_layer)
        .with(error_layer)
        .with(stderr_layer)
        .try_init()
        .ok();

    Ok(LoggingGuard {
        _main_guard: main_guard,
        _error_guard: error_guard,
    })
}
