// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Process-wide logging setup.
//!
//! `Context::start()` is the only place this is invoked; global mutable
//! state for logging (like process priority) is set once at startup and
//! nothing else in the core reads or writes it, per SPEC_FULL.md's
//! "Global mutable state" design note.

use std::path::Path;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Installs the global `tracing` subscriber, bridging the `log` facade
/// macros used throughout the core onto it. `verbose` lowers the default
/// filter from `info` to `debug`; `RUST_LOG` always takes precedence when
/// set. Returns the worker guard that must be kept alive for the
/// lifetime of the process so the non-blocking file writer keeps
/// flushing.
pub fn init(log_dir: &Path, verbose: bool) -> WorkerGuard {
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let file_appender = tracing_appender::rolling::never(log_dir, "airbrakes.log");
    let (non_blocking, guard): (NonBlocking, WorkerGuard) =
        tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stdout))
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    guard
}
