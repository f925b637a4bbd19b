//! Physical transport layer for device connections.
//!
//! This module handles the low-level connection to a TIC: raw USB bulk
//! endpoints or a CDC-ACM serial port. A transport moves whole frames; it
//! has no knowledge of the JSON protocol spoken on top of it.

pub mod mock;
#[cfg(feature = "serial")]
pub mod serial;
pub mod usb;

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{Error, Result};

/// A byte link carrying whole frames to and from one device.
///
/// Implementations own their port exclusively. Dropping a transport
/// releases it; [`Transport::close`] releases it early and is safe to
/// call more than once.
#[async_trait]
pub trait Transport: Send {
    /// Encode `payload` and write it as one delimited frame.
    async fn send(&mut self, payload: &[u8]) -> Result<()>;

    /// Return the next decoded payload, skipping empty frames.
    ///
    /// Fails with [`Error::Timeout`] when no complete frame arrives
    /// within `timeout`.
    async fn receive(&mut self, timeout: Duration) -> Result<Bytes>;

    /// Discard buffered and in-flight input so the next frame starts
    /// clean.
    async fn flush_pending(&mut self) -> Result<()>;

    /// Release the underlying port.
    async fn close(&mut self) -> Result<()>;
}

/// Where to find the device, parsed from a connection string.
///
/// Accepted forms:
///
/// * `""` or `"*"`: find the single TIC connected over USB
/// * `"0107E60A0101"` or `"usb:0107E60A0101"`: USB device with that
///   serial number
/// * `"serial:/dev/ttyACM0"`: CDC-ACM serial port (requires the
///   `serial` feature)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PortSpec {
    /// Auto-discover a single TIC on the USB bus.
    #[default]
    Auto,
    /// USB device with a specific serial number.
    Usb { serial_number: String },
    /// CDC-ACM serial port at the given path.
    Serial { path: String },
}

impl FromStr for PortSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(path) = s.strip_prefix("serial:") {
            if path.is_empty() {
                return Err(Error::Config("empty serial port path".into()));
            }
            return Ok(PortSpec::Serial {
                path: path.to_string(),
            });
        }

        match s.strip_prefix("usb:").unwrap_or(s) {
            "" | "*" => Ok(PortSpec::Auto),
            serial_number => Ok(PortSpec::Usb {
                serial_number: serial_number.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("", PortSpec::Auto; "empty")]
    #[test_case("*", PortSpec::Auto; "wildcard")]
    #[test_case("usb:", PortSpec::Auto; "usb prefix only")]
    fn auto_specs(input: &str, expected: PortSpec) {
        assert_eq!(input.parse::<PortSpec>().unwrap(), expected);
    }

    #[test_case("0107E60A0101"; "bare serial number")]
    #[test_case("usb:0107E60A0101"; "usb prefix")]
    fn usb_specs(input: &str) {
        assert_eq!(
            input.parse::<PortSpec>().unwrap(),
            PortSpec::Usb {
                serial_number: "0107E60A0101".into()
            }
        );
    }

    #[test]
    fn serial_spec_keeps_the_path() {
        assert_eq!(
            "serial:/dev/ttyACM0".parse::<PortSpec>().unwrap(),
            PortSpec::Serial {
                path: "/dev/ttyACM0".into()
            }
        );
    }

    #[test]
    fn empty_serial_path_is_rejected() {
        assert!(matches!(
            "serial:".parse::<PortSpec>(),
            Err(Error::Config(_))
        ));
    }
}
