//! Structured logging setup: an `EnvFilter` (default `info`, override via
//! `RUST_LOG`) driving a JSON-formatted layer written to a daily-rotated
//! file under the configured log directory, plus a plain layer on
//! stderr for interactive use. This is a headless HTTP proxy, not a TUI -
//! the ancestor's in-memory `TuiLogLayer`/log-buffer-for-display plumbing
//! has no counterpart here; logs just go to stderr and disk.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Must be kept alive for the process lifetime; dropping it stops the
/// background thread that flushes the file writer.
pub fn init(log_dir: &Path) -> anyhow::Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "relayplane.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_ansi(false);
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    Ok(guard)
}
