//! Frame dissection engine.

use std::fmt;

use airel_tic::encoding;
use colored::Colorize;
use serde_json::Value;

/// CRC/framing validation status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrcStatus {
    Valid,
    Invalid,
}

impl fmt::Display for CrcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrcStatus::Valid => write!(f, "{}", "CRC OK".green()),
            CrcStatus::Invalid => write!(f, "{}", "CRC FAIL".red()),
        }
    }
}

/// Decoded frame content
#[derive(Debug)]
pub enum FrameContent {
    Request { method: String, params: Option<Value> },
    Result(Value),
    Error { code: String, message: String },
    Event { event: String, params: Option<Value> },
    Json(Value),
    Binary(Vec<u8>),
    Invalid(String),
}

impl fmt::Display for FrameContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameContent::Request { method, params } => match params {
                Some(params) => write!(f, "{} {}({})", "→".cyan(), method.cyan(), params),
                None => write!(f, "{} {}()", "→".cyan(), method.cyan()),
            },
            FrameContent::Result(value) => {
                write!(f, "{} result {}", "←".green(), value)
            }
            FrameContent::Error { code, message } => {
                write!(f, "{} error {}: {}", "←".red(), code.red(), message)
            }
            FrameContent::Event { event, params } => match params {
                Some(params) => write!(f, "{} {} {}", "←".yellow(), event.yellow(), params),
                None => write!(f, "{} {}", "←".yellow(), event.yellow()),
            },
            FrameContent::Json(value) => write!(f, "json {value}"),
            FrameContent::Binary(bytes) => write!(f, "binary {}", hex::encode(bytes)),
            FrameContent::Invalid(reason) => write!(f, "{}", reason.red()),
        }
    }
}

/// One dissected frame
#[derive(Debug)]
pub struct DissectedFrame {
    pub index: usize,
    pub raw: Vec<u8>,
    pub content: FrameContent,
    pub crc_status: CrcStatus,
}

/// Split a capture on frame delimiters and dissect every frame.
pub fn dissect_stream(data: &[u8]) -> Vec<DissectedFrame> {
    data.split(|&b| b == encoding::FRAME_DELIMITER)
        .filter(|frame| !frame.is_empty())
        .enumerate()
        .map(|(index, frame)| dissect_frame(index, frame))
        .collect()
}

fn dissect_frame(index: usize, frame: &[u8]) -> DissectedFrame {
    match encoding::decode(frame) {
        Ok(payload) => DissectedFrame {
            index,
            raw: frame.to_vec(),
            content: classify(&payload),
            crc_status: CrcStatus::Valid,
        },
        Err(e) => DissectedFrame {
            index,
            raw: frame.to_vec(),
            content: FrameContent::Invalid(e.to_string()),
            crc_status: CrcStatus::Invalid,
        },
    }
}

fn classify(payload: &[u8]) -> FrameContent {
    let Ok(value) = serde_json::from_slice::<Value>(payload) else {
        return FrameContent::Binary(payload.to_vec());
    };

    let Some(object) = value.as_object() else {
        return FrameContent::Json(value);
    };

    if let Some(method) = object.get("method").and_then(Value::as_str) {
        return FrameContent::Request {
            method: method.to_string(),
            params: object.get("params").cloned(),
        };
    }
    if let Some(result) = object.get("result") {
        return FrameContent::Result(result.clone());
    }
    if let Some(error) = object.get("error") {
        return FrameContent::Error {
            code: error
                .get("code")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            message: error
                .get("msg")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        };
    }
    if let Some(event) = object.get("event").and_then(Value::as_str) {
        return FrameContent::Event {
            event: event.to_string(),
            params: object.get("params").cloned(),
        };
    }

    FrameContent::Json(value)
}
