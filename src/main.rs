//! nugs - a command-line downloader and catalog manager for nugs.net.
//!
//! Authenticates against the service, downloads audio releases and video
//! concerts in selectable quality tiers, keeps a local index of the full
//! catalog for gap analysis, and optionally mirrors downloads to remote
//! storage via rclone.

pub mod api;
pub mod app;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod control;
pub mod download;
pub mod error;
pub mod ffmpeg;
pub mod mirror;
pub mod persist;
pub mod presence;
pub mod progress;
#[cfg(test)]
pub mod test_utils;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn main() -> anyhow::Result<()> {
    // Aliases are rewritten before clap ever sees the argv.
    let args = cli::normalize_args(std::env::args().skip(1).collect());
    let cli = cli::Cli::parse_from(std::iter::once("nugs".to_string()).chain(args));

    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive("nugs=info".parse().unwrap()))
        .init();

    match cli::run_command(&cli) {
        Ok(()) => Ok(()),
        Err(e) => {
            // Cooperative cancellation is a clean exit, not a failure.
            if e.downcast_ref::<error::Error>()
                .map(|e| e.is_cancelled())
                .unwrap_or(false)
            {
                return Ok(());
            }
            Err(e)
        }
    }
}
