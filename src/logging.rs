//! Logging setup: stderr plus the append-only agent log.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Pick the level from the `--verbose` / `--quiet` flags.
pub fn level_for(verbose: bool, quiet: bool) -> Level {
    if verbose {
        Level::DEBUG
    } else if quiet {
        Level::ERROR
    } else {
        Level::INFO
    }
}

/// Install the global subscriber.
///
/// The log file gets timestamps and no colours. If it cannot be opened the
/// agent keeps logging to stderr only.
pub fn init(level: Level, log_file: Option<&Path>) -> anyhow::Result<()> {
    let filter = LevelFilter::from_level(level);

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .with_filter(filter);

    let mut open_error = None;
    let file_layer = log_file.and_then(|path| {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(
                fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false)
                    .with_target(false)
                    .with_filter(LevelFilter::from_level(level.max(Level::INFO))),
            ),
            Err(e) => {
                open_error = Some(format!("Cannot open log file {:?}: {}", path, e));
                None
            }
        }
    });

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()?;

    if let Some(msg) = open_error {
        tracing::warn!("{}, logging to stderr only", msg);
    }
    Ok(())
}
