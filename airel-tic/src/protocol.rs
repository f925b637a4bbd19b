//! JSON message envelope for the TIC control protocol.
//!
//! Requests are objects carrying a `method` and optional `params`. The
//! device answers with either a `result` or an `error` object, and pushes
//! unsolicited notifications (measurement records, raw electrometer
//! samples) at any time.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Outgoing command envelope.
#[derive(Debug, Clone, Serialize)]
pub struct Request {
    pub method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(method: &'static str) -> Self {
        Self {
            method,
            params: None,
        }
    }

    pub fn with_params(method: &'static str, params: Value) -> Self {
        Self {
            method,
            params: Some(params),
        }
    }
}

/// One message received from the device, classified by envelope shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Response carrying the `result` of the last request.
    Result(Value),
    /// Error response to the last request.
    Error { code: String, message: String },
    /// Anything else; kept whole for the caller.
    Notification(Value),
}

impl Message {
    /// Classify one decoded payload.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| Error::Decoding(format!("invalid json message: {e}")))?;

        if let Some(object) = value.as_object() {
            if let Some(result) = object.get("result") {
                return Ok(Message::Result(result.clone()));
            }
            if let Some(error) = object.get("error") {
                let code = error
                    .get("code")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let message = error
                    .get("msg")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();
                return Ok(Message::Error { code, message });
            }
        }

        Ok(Message::Notification(value))
    }
}

/// Operating mode of the instrument.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OperatingMode {
    /// Normal measurement
    Run,
    /// Measurement with swapped electrometer polarity
    RunSwapped,
    /// Zero-air reference measurement
    Zero,
    /// Measurements stopped
    Stop,
}
