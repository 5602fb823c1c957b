//! File logging. Terminal output belongs to the commands; tracing goes to
//! `$XDG_STATE_HOME/pgsandbox/pgsandbox.log` so long builds can be inspected later.

use std::ffi::OsString;
use std::fs;
use std::path::PathBuf;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

const APP_DIR: &str = "pgsandbox";
const LOG_FILE: &str = "pgsandbox.log";

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global subscriber. Calling it again is a no-op.
pub fn init() -> Result<()> {
    if GUARD.get().is_some() {
        return Ok(());
    }

    let dir = match log_dir(std::env::var_os("XDG_STATE_HOME"), home::home_dir()) {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create log directory at {}", dir.display()))?;

    let (writer, guard) = tracing_appender::non_blocking(rolling::never(&dir, LOG_FILE));
    if GUARD.set(guard).is_err() {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false),
        )
        .try_init()
        .context("Failed to initialize tracing subscriber")?;
    Ok(())
}

/// `$XDG_STATE_HOME/pgsandbox`, else `~/.local/state/pgsandbox`.
fn log_dir(state_home: Option<OsString>, home: Option<PathBuf>) -> Option<PathBuf> {
    match state_home.filter(|s| !s.is_empty()) {
        Some(state_home) => Some(PathBuf::from(state_home).join(APP_DIR)),
        None => home.map(|h| h.join(".local").join("state").join(APP_DIR)),
    }
}
