//! Tracing setup for hosts without their own subscriber.
//!
//! The engine only emits `tracing` events; installing a subscriber is the
//! host's job. These helpers cover the common cases: an append-only log
//! file under a host-supplied directory (or the XDG state home), or plain
//! stderr.

use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

const LOG_FILE: &str = "engine.log";
const DEFAULT_FILTER: &str = "info,blobup=debug";

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Default log directory: the XDG state home (`~/.local/state/blobup`).
pub fn default_log_dir() -> Result<PathBuf> {
    let dirs = xdg::BaseDirectories::with_prefix("blobup")?;
    Ok(dirs.get_state_home())
}

/// Install a file-backed subscriber and return the log file path. `dir`
/// overrides the default directory. Fails if the directory or file cannot
/// be created, or if a subscriber is already installed; callers may then
/// fall back to `init_stderr`.
pub fn init_file(dir: Option<&Path>) -> Result<PathBuf> {
    let dir = match dir {
        Some(d) => d.to_path_buf(),
        None => default_log_dir()?,
    };
    fs::create_dir_all(&dir)
        .with_context(|| format!("creating log directory {}", dir.display()))?;
    let path = dir.join(LOG_FILE);
    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("opening {}", path.display()))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .try_init()
        .map_err(|e| anyhow!("installing subscriber: {}", e))?;
    tracing::info!(path = %path.display(), "logging to file");
    Ok(path)
}

/// Install a stderr subscriber.
pub fn init_stderr() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init()
        .map_err(|e| anyhow!("installing subscriber: {}", e))
}
