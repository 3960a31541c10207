// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Construction of the root slog logger.
//!
//! Components derive child loggers from the root with
//! `log.new(o!("component" => ...))`; nothing else in the workspace
//! touches drains directly.

use slog::Drain;

#[derive(Debug, thiserror::Error)]
#[error("unrecognized log level {0:?}")]
pub struct BadLogLevel(String);

/// Parse a log level name as it appears in config files.
pub fn parse_level(name: &str) -> Result<slog::Level, BadLogLevel> {
    match name {
        "trace" => Ok(slog::Level::Trace),
        "debug" => Ok(slog::Level::Debug),
        "info" => Ok(slog::Level::Info),
        "warn" | "warning" => Ok(slog::Level::Warning),
        "error" => Ok(slog::Level::Error),
        other => Err(BadLogLevel(other.to_string())),
    }
}

/// Build the process-wide root logger: terminal output through an async
/// drain, filtered to `level`.
pub fn root_logger(name: &'static str, level: slog::Level) -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).chan_size(4096).build().fuse();
    let drain = slog::LevelFilter::new(drain, level).fuse();
    slog::Logger::root(drain, slog::o!("name" => name))
}

/// Synchronous stdout logger for tests. Output interleaves with the
/// test harness's captured output, which is what we want on failure.
pub fn test_logger(test_name: &'static str) -> slog::Logger {
    let decorator = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let drain = slog_term::FullFormat::new(decorator).build();
    let drain = std::sync::Mutex::new(drain).fuse();
    slog::Logger::root(drain, slog::o!("test" => test_name))
}
