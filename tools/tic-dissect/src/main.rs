//! Dissect captured TIC wire traffic into frames and messages.
//!
//! Reads a capture of the byte stream between host and device, splits it
//! on frame delimiters, checks each frame's integrity and prints the
//! decoded JSON traffic.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

mod dissect;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Capture file: raw bytes, or whitespace-separated hex with --hex
    capture: PathBuf,

    /// Treat the capture as a hex dump
    #[arg(long)]
    hex: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let data = if cli.hex {
        let text = fs::read_to_string(&cli.capture)
            .with_context(|| format!("cannot read {}", cli.capture.display()))?;
        let compact: String = text.split_whitespace().collect();
        hex::decode(&compact).context("invalid hex capture")?
    } else {
        fs::read(&cli.capture)
            .with_context(|| format!("cannot read {}", cli.capture.display()))?
    };

    for frame in dissect::dissect_stream(&data) {
        println!(
            "{:>4}  {:>5}B  {}  {}",
            frame.index,
            frame.raw.len(),
            frame.crc_status,
            frame.content
        );
    }

    Ok(())
}
