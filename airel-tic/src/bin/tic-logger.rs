//! Records logger for the Tiny Ion Counter.
//!
//! Stores data received from the TIC in records files that can be used
//! directly with the Retrospect program. The measurement cycle is aligned
//! to the computer clock and the device's internal automatic zeroing is
//! disabled in favour of the configured cycle.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tokio::signal::unix::{self, SignalKind};
use tokio_util::sync::CancellationToken;

use airel_tic::logger::{self, LoggerConfig};
use airel_tic::tracing::{self, prelude::*};
use airel_tic::{PortSpec, UsbContext};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Connection string: empty for auto-discovery, a serial number,
    /// "usb:<serial>", or "serial:<path>"
    #[arg(short, long, default_value = "")]
    connection: String,

    /// YAML configuration file
    #[arg(short = 'f', long, value_name = "FILE")]
    config: PathBuf,

    /// Run one worker per connected TIC instead of a single device
    #[arg(long, conflicts_with = "connection")]
    all: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing::init_journald_or_stdout();

    let cli = Cli::parse();
    let config = LoggerConfig::load(&cli.config)?;

    let shutdown = CancellationToken::new();
    let mut sigint = unix::signal(SignalKind::interrupt())?;
    let mut sigterm = unix::signal(SignalKind::terminate())?;
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sigint.recv() => {}
                _ = sigterm.recv() => {}
            }
            trace!("Shutting down.");
            shutdown.cancel();
        });
    }

    let ctx = UsbContext::new();
    if cli.all {
        logger::run_many(&ctx, &config, shutdown).await?;
    } else {
        let spec: PortSpec = cli.connection.parse()?;
        logger::run(&ctx, &spec, &config, shutdown).await?;
    }

    info!("Exiting.");
    Ok(())
}
