//! Host-side driver for the Airel Tiny Ion Counter (TIC).
//!
//! The TIC is a USB laboratory instrument that measures air-ion
//! concentrations. It frames JSON messages with COBS byte stuffing and a
//! CRC-16 checksum, delimited by zero bytes, over either a raw USB bulk
//! endpoint pair or a CDC-ACM virtual serial port (`serial` feature).
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use airel_tic::{OperatingMode, PortSpec, Tic, UsbContext};
//!
//! let ctx = UsbContext::new();
//! let mut device = Tic::open(&ctx, &PortSpec::Auto).await?;
//!
//! device.set_mode(OperatingMode::Run).await?;
//! while let Some(message) = device.receive_message(Duration::from_secs(1)).await? {
//!     println!("{message}");
//! }
//! ```
//!
//! The `logger` feature adds the records logger behind the `tic-logger`
//! binary, which drives a measurement cycle and writes daily
//! Retrospect-compatible records files.

pub mod device;
pub mod encoding;
pub mod error;
#[cfg(feature = "logger")]
pub mod logger;
pub mod protocol;
pub mod tracing;
pub mod transport;

pub use device::Tic;
pub use error::{Error, Result};
pub use protocol::OperatingMode;
pub use transport::usb::{UsbContext, UsbDeviceAddress};
pub use transport::PortSpec;
