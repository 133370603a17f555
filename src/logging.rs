//! Tracing setup for the two transports.
//!
//! In stdio mode stdout carries the MCP stream and clients treat any stderr
//! chatter during the handshake as a dead connection, so logs go to a file
//! or nowhere. Stream mode logs to stderr and optionally to a file as well.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Stdio,
    Stream,
}

pub const DEFAULT_LOG_FILE: &str = "graph-memory-mcp.log";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn open_log_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {}", path.display()))
}

/// Install the global subscriber. `log_file` enables file output.
pub fn init_logging(mode: TransportMode, log_file: Option<String>) -> Result<()> {
    let file_layer = match log_file.as_deref() {
        Some(name) => {
            let file = open_log_file(Path::new(name))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };
    let stderr_layer = match mode {
        TransportMode::Stream => Some(fmt::layer().with_writer(std::io::stderr)),
        TransportMode::Stdio => None,
    };

    tracing_subscriber::registry()
        .with(env_filter())
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    tracing::debug!(?mode, file = ?log_file, "Logging initialized");
    Ok(())
}
