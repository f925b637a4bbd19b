//! Connection client for the Tiny Ion Counter.
//!
//! [`Tic`] owns one framed transport and speaks the instrument's JSON
//! request/response protocol. Unsolicited messages (measurement records)
//! arriving while a response is awaited are buffered and handed out by
//! [`Tic::receive_message`].

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use rand::Rng;
use serde_json::{json, Map, Value};
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::protocol::{Message, OperatingMode, Request};
use crate::tracing::prelude::*;
use crate::transport::usb::{UsbContext, UsbTransport};
use crate::transport::{PortSpec, Transport};

/// Deadline for the initial ping exchange.
pub const CONNECTION_INIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Deadline for command responses.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Poll interval while waiting for the handshake reply.
const INIT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// One open connection to a TIC device.
///
/// The client is the exclusive owner of its transport. Dropping it
/// releases the port; [`Tic::close`] releases it early, which is useful
/// when a connection must be restarted after an error response.
pub struct Tic {
    transport: Option<Box<dyn Transport>>,
    pending: VecDeque<Value>,
}

impl Tic {
    /// Open a connection to a TIC device.
    ///
    /// See [`PortSpec`] for the accepted connection forms. Auto-discovery
    /// fails when no TIC, or more than one, is connected.
    pub async fn open(ctx: &UsbContext, spec: &PortSpec) -> Result<Self> {
        let transport: Box<dyn Transport> = match spec {
            PortSpec::Auto => Box::new(UsbTransport::open(ctx, None)?),
            PortSpec::Usb { serial_number } => {
                Box::new(UsbTransport::open(ctx, Some(serial_number.as_str()))?)
            }
            #[cfg(feature = "serial")]
            PortSpec::Serial { path } => {
                Box::new(crate::transport::serial::SerialTransport::open(path)?)
            }
            #[cfg(not(feature = "serial"))]
            PortSpec::Serial { .. } => {
                return Err(Error::Config(
                    "serial connections require the `serial` feature".into(),
                ));
            }
        };
        Self::from_transport(transport).await
    }

    /// Build a client on an already-open transport and run the handshake.
    pub async fn from_transport(transport: Box<dyn Transport>) -> Result<Self> {
        let mut tic = Self {
            transport: Some(transport),
            pending: VecDeque::new(),
        };
        tic.init_connection().await?;
        Ok(tic)
    }

    /// Close the connection and release the port.
    ///
    /// Called automatically on drop; calling it twice is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(transport) = self.transport.as_mut() {
            transport.close().await?;
            self.transport = None;
        }
        Ok(())
    }

    fn transport_mut(&mut self) -> Result<&mut Box<dyn Transport>> {
        self.transport
            .as_mut()
            .ok_or_else(|| Error::Transport("connection is closed".into()))
    }

    /// Wake the link, drop in-flight traffic, and verify the device
    /// responds to a fresh ping.
    async fn init_connection(&mut self) -> Result<()> {
        self.transport_mut()?.send(&[]).await?;
        self.transport_mut()?.flush_pending().await?;

        let token = rand::thread_rng().gen_range(0..1_000_000_000u32).to_string();
        self.send_request(&Request::with_params("ping", token.clone().into()))
            .await?;

        let deadline = Instant::now() + CONNECTION_INIT_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout);
            }
            match self.receive_raw(remaining.min(INIT_POLL_TIMEOUT)).await {
                Ok(Message::Result(result)) if result.as_str() == Some(token.as_str()) => {
                    return Ok(())
                }
                Ok(Message::Error { code, message }) => {
                    return Err(Error::Device { code, message })
                }
                // Stale frames from a previous session are expected here
                Ok(_) | Err(Error::Timeout) | Err(Error::Decoding(_)) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_request(&mut self, request: &Request) -> Result<()> {
        let payload = serde_json::to_vec(request)
            .map_err(|e| Error::Encoding(format!("failed to encode request: {e}")))?;
        self.transport_mut()?.send(&payload).await
    }

    async fn receive_raw(&mut self, timeout: Duration) -> Result<Message> {
        let payload = self.transport_mut()?.receive(timeout).await?;
        Message::parse(&payload)
    }

    /// Wait for the response to the request just sent, buffering any
    /// unsolicited messages that arrive first.
    async fn receive_response(&mut self) -> Result<Value> {
        let deadline = Instant::now() + RESPONSE_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout);
            }
            match self.receive_raw(remaining).await? {
                Message::Result(result) => return Ok(result),
                Message::Error { code, message } => return Err(Error::Device { code, message }),
                Message::Notification(msg) => self.pending.push_back(msg),
            }
        }
    }

    async fn wait_ok_response(&mut self) -> Result<()> {
        let response = self.receive_response().await?;
        if response.as_str() != Some("ok") {
            return Err(Error::Protocol(format!("unexpected response: {response}")));
        }
        Ok(())
    }

    async fn request_object(&mut self, request: Request) -> Result<Map<String, Value>> {
        self.send_request(&request).await?;
        match self.receive_response().await? {
            Value::Object(map) => Ok(map),
            other => Err(Error::Protocol(format!("unexpected response: {other}"))),
        }
    }

    /// Return the next message received from the device.
    ///
    /// The message may come from the internal FIFO where it was stored
    /// while a command response was being awaited. Returns `Ok(None)`
    /// when nothing arrives within `timeout`; fails with
    /// [`Error::Device`] when the message is an error response.
    pub async fn receive_message(&mut self, timeout: Duration) -> Result<Option<Value>> {
        if let Some(msg) = self.pending.pop_front() {
            return Ok(Some(msg));
        }
        if timeout.is_zero() {
            return Ok(None);
        }

        match self.receive_raw(timeout).await {
            Ok(Message::Notification(msg)) => Ok(Some(msg)),
            Ok(Message::Result(result)) => Ok(Some(json!({ "result": result }))),
            Ok(Message::Error { code, message }) => Err(Error::Device { code, message }),
            Err(Error::Timeout) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Send a ping and return the payload echoed by the device.
    pub async fn ping(&mut self, payload: &str) -> Result<String> {
        self.send_request(&Request::with_params("ping", payload.into()))
            .await?;
        let response = self.receive_response().await?;
        match response.as_str() {
            Some(echoed) => Ok(echoed.to_string()),
            None => Err(Error::Protocol(format!("unexpected response: {response}"))),
        }
    }

    /// Request system information from the device.
    pub async fn get_system_info(&mut self) -> Result<Map<String, Value>> {
        self.request_object(Request::new("get_system_info")).await
    }

    /// Request debug information from the device.
    pub async fn get_debug_info(&mut self) -> Result<Map<String, Value>> {
        self.request_object(Request::new("get_debug_info")).await
    }

    /// Request the active user settings.
    pub async fn get_settings(&mut self) -> Result<Map<String, Value>> {
        self.request_object(Request::new("get_settings")).await
    }

    /// Update user settings on the device.
    pub async fn set_settings(&mut self, settings: Map<String, Value>) -> Result<()> {
        self.send_request(&Request::with_params(
            "set_settings",
            Value::Object(settings),
        ))
        .await?;
        self.wait_ok_response().await
    }

    /// Reset user settings, optionally applying new ones afterwards.
    pub async fn reset_settings(&mut self, settings: Option<Map<String, Value>>) -> Result<()> {
        let request = match settings {
            Some(map) => Request::with_params("reset_settings", Value::Object(map)),
            None => Request::new("reset_settings"),
        };
        self.send_request(&request).await?;
        self.wait_ok_response().await
    }

    /// Store the active settings in the device's non-volatile memory.
    pub async fn store_settings(&mut self) -> Result<()> {
        self.send_request(&Request::new("store_settings")).await?;
        self.wait_ok_response().await
    }

    /// Request an MCU reset.
    ///
    /// The device restarts and the connection is lost; close the client
    /// afterwards.
    pub async fn hard_reset(&mut self) -> Result<()> {
        self.send_request(&Request::new("hard_reset")).await
    }

    /// Request a reset into firmware update mode.
    ///
    /// The device restarts and the connection is lost; close the client
    /// afterwards.
    pub async fn enter_dfu(&mut self) -> Result<()> {
        self.send_request(&Request::new("enter_dfu")).await
    }

    /// Set the operating mode of the device.
    pub async fn set_mode(&mut self, mode: OperatingMode) -> Result<()> {
        self.send_request(&Request::with_params("set_mode", mode.to_string().into()))
            .await?;
        self.wait_ok_response().await
    }

    /// Set a custom operating mode from raw parameters.
    pub async fn set_custom_mode(&mut self, params: Map<String, Value>) -> Result<()> {
        self.send_request(&Request::with_params(
            "set_custom_mode",
            Value::Object(params),
        ))
        .await?;
        self.wait_ok_response().await
    }

    /// Request the textual descriptions of the record flags the device
    /// uses.
    pub async fn get_flag_descriptions(&mut self) -> Result<HashMap<String, String>> {
        self.send_request(&Request::new("get_flag_descriptions"))
            .await?;
        let response = self.receive_response().await?;
        let pairs: Vec<(String, String)> = serde_json::from_value(response)
            .map_err(|e| Error::Protocol(format!("unexpected response: {e}")))?;
        debug!(flags = pairs.len(), "flag descriptions received");
        Ok(pairs.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;
    use bytes::Bytes;
    use std::sync::{Arc, Mutex};

    fn reply(value: Value) -> Bytes {
        Bytes::from(serde_json::to_vec(&value).unwrap())
    }

    /// Echoes pings; answers other methods through `extend`.
    fn responder(
        extend: impl Fn(&str, &Value) -> Vec<Bytes> + Send + 'static,
    ) -> impl FnMut(&[u8]) -> Vec<Bytes> + Send + 'static {
        move |payload: &[u8]| {
            if payload.is_empty() {
                return Vec::new();
            }
            let request: Value = serde_json::from_slice(payload).unwrap();
            let method = request["method"].as_str().unwrap();
            if method == "ping" {
                return vec![reply(json!({ "result": request["params"] }))];
            }
            extend(method, &request["params"])
        }
    }

    async fn connect(
        extend: impl Fn(&str, &Value) -> Vec<Bytes> + Send + 'static,
    ) -> Tic {
        let mock = MockTransport::with_responder(responder(extend));
        Tic::from_transport(Box::new(mock)).await.unwrap()
    }

    #[tokio::test]
    async fn handshake_survives_stale_traffic() {
        let mut mock = MockTransport::with_responder(responder(|_, _| Vec::new()));
        mock.push_incoming(Bytes::from_static(b"left over garbage"));
        assert!(Tic::from_transport(Box::new(mock)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_times_out_on_a_silent_device() {
        let result = Tic::from_transport(Box::new(MockTransport::new())).await;
        assert!(matches!(result, Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn ping_round_trip() {
        let mut tic = connect(|_, _| Vec::new()).await;
        assert_eq!(tic.ping("hello").await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn requests_are_serialized_with_method_and_params() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let mut tic = connect(move |method, params| {
            log.lock().unwrap().push((method.to_string(), params.clone()));
            vec![reply(json!({ "result": "ok" }))]
        })
        .await;

        tic.set_mode(OperatingMode::RunSwapped).await.unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![("set_mode".to_string(), json!("run_swapped"))]
        );
    }

    #[tokio::test]
    async fn system_info_returns_the_result_object() {
        let mut tic = connect(|method, _| match method {
            "get_system_info" => vec![reply(json!({
                "result": { "serial_number": "0107E60A0101" }
            }))],
            _ => Vec::new(),
        })
        .await;

        let info = tic.get_system_info().await.unwrap();
        assert_eq!(info["serial_number"], "0107E60A0101");
    }

    #[tokio::test]
    async fn error_responses_surface_as_device_errors() {
        let mut tic = connect(|_, _| {
            vec![reply(json!({
                "error": { "code": "invalid_mode", "msg": "no such mode" }
            }))]
        })
        .await;

        let result = tic.set_mode(OperatingMode::Run).await;
        match result {
            Err(Error::Device { code, message }) => {
                assert_eq!(code, "invalid_mode");
                assert_eq!(message, "no such mode");
            }
            other => panic!("expected device error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unexpected_ok_response_is_a_protocol_error() {
        let mut tic =
            connect(|_, _| vec![reply(json!({ "result": "nope" }))]).await;
        assert!(matches!(
            tic.store_settings().await,
            Err(Error::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn notifications_are_buffered_while_a_response_is_awaited() {
        let mut tic = connect(|method, _| match method {
            "get_settings" => vec![
                reply(json!({ "event": "record", "params": { "seq": 1 } })),
                reply(json!({ "event": "record", "params": { "seq": 2 } })),
                reply(json!({ "result": {} })),
            ],
            _ => Vec::new(),
        })
        .await;

        tic.get_settings().await.unwrap();

        let first = tic.receive_message(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(first["params"]["seq"], 1);
        let second = tic.receive_message(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(second["params"]["seq"], 2);
        assert_eq!(tic.receive_message(Duration::ZERO).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn receive_message_returns_none_on_timeout() {
        let mut tic = connect(|_, _| Vec::new()).await;
        let message = tic.receive_message(Duration::from_secs(1)).await.unwrap();
        assert_eq!(message, None);
    }

    #[tokio::test]
    async fn receive_message_raises_device_errors() {
        // The handshake echo is followed by an error the device pushed on
        // its own; it stays queued until receive_message reads it.
        let mock = MockTransport::with_responder(|payload: &[u8]| {
            if payload.is_empty() {
                return Vec::new();
            }
            let request: Value = serde_json::from_slice(payload).unwrap();
            vec![
                reply(json!({ "result": request["params"] })),
                reply(json!({ "error": { "code": "overload", "msg": "bad state" } })),
            ]
        });
        let mut tic = Tic::from_transport(Box::new(mock)).await.unwrap();

        assert!(matches!(
            tic.receive_message(Duration::from_secs(1)).await,
            Err(Error::Device { .. })
        ));
    }

    #[tokio::test]
    async fn flag_descriptions_become_a_map() {
        let mut tic = connect(|method, _| match method {
            "get_flag_descriptions" => vec![reply(json!({
                "result": [["overload", "electrometer overload"], ["settle", "settling"]]
            }))],
            _ => Vec::new(),
        })
        .await;

        let flags = tic.get_flag_descriptions().await.unwrap();
        assert_eq!(flags["overload"], "electrometer overload");
        assert_eq!(flags.len(), 2);
    }

    #[tokio::test]
    async fn close_twice_is_a_no_op() {
        let mut tic = connect(|_, _| Vec::new()).await;
        tic.close().await.unwrap();
        tic.close().await.unwrap();
        assert!(matches!(
            tic.ping("x").await,
            Err(Error::Transport(_))
        ));
    }
}
