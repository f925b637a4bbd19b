//! Common error types for the TIC driver.
//!
//! This module provides a centralized Error enum using thiserror, with
//! conversions from the underlying transport error types used throughout
//! the crate.

use thiserror::Error;

/// Main error type for TIC driver operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from tokio or std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port errors
    #[cfg(feature = "serial")]
    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// USB transfer failures reported by the host controller
    #[error("USB transfer error: {0}")]
    UsbTransfer(#[from] nusb::transfer::TransferError),

    /// Failure while encoding a message for the device
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Malformed frame received from the device
    #[error("decoding error: {0}")]
    Decoding(String),

    /// Connection-level failures: enumeration, open, disconnect
    #[error("communication error: {0}")]
    Transport(String),

    /// No complete frame arrived within the deadline
    #[error("timed out waiting for the device")]
    Timeout,

    /// Error response sent by the device
    #[error("device error ({code}): {message}")]
    Device { code: String, message: String },

    /// Well-formed but unexpected response
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invalid configuration or port specification
    #[error("configuration error: {0}")]
    Config(String),
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
