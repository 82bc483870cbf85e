//! Thin wrapper around `slog` so the rest of the workspace can pull in structured logging
//! without depending on `slog`/`sloggers` directly or re-deriving the macro imports everywhere.

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Drain, Logger};

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

/// Builds a root logger that writes leveled, structured records to stderr.
///
/// Intended for embedders that want observability out of the box; anything that doesn't
/// call this (or supply its own `Logger`) gets a silent [`discard`] logger instead.
pub fn root(level: Severity) -> Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(level);
    builder.destination(Destination::Stderr);

    builder
        .build()
        .unwrap_or_else(|_| Logger::root(Discard, o!()))
}

/// A logger that discards every record. Used as the default when no logger is supplied.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
