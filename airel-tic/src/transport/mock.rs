//! Scripted transport for exercising the client without hardware.
//!
//! The mock records every payload passed to `send` and replays a queue of
//! scripted incoming payloads. An optional responder closure turns sent
//! requests into queued replies, which is enough to drive the connection
//! handshake in tests.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::sleep;

use crate::error::{Error, Result};
use crate::transport::Transport;

type Responder = Box<dyn FnMut(&[u8]) -> Vec<Bytes> + Send>;

/// In-memory transport with scripted traffic.
#[derive(Default)]
pub struct MockTransport {
    incoming: VecDeque<Bytes>,
    sent: Vec<Vec<u8>>,
    responder: Option<Responder>,
    close_count: u32,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a responder invoked for every sent payload; whatever it
    /// returns is queued as incoming traffic.
    pub fn with_responder(responder: impl FnMut(&[u8]) -> Vec<Bytes> + Send + 'static) -> Self {
        Self {
            responder: Some(Box::new(responder)),
            ..Self::default()
        }
    }

    /// Queue one incoming payload.
    pub fn push_incoming(&mut self, payload: impl Into<Bytes>) {
        self.incoming.push_back(payload.into());
    }

    /// Payloads sent so far, oldest first.
    pub fn sent(&self) -> &[Vec<u8>] {
        &self.sent
    }

    /// How many times `close` was called.
    pub fn close_count(&self) -> u32 {
        self.close_count
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, payload: &[u8]) -> Result<()> {
        self.sent.push(payload.to_vec());
        if let Some(responder) = &mut self.responder {
            let replies = responder(payload);
            self.incoming.extend(replies);
        }
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Bytes> {
        match self.incoming.pop_front() {
            Some(payload) => Ok(payload),
            None => {
                // Nothing can arrive while we hold &mut self; consume the
                // timeout like a real port would.
                sleep(timeout).await;
                Err(Error::Timeout)
            }
        }
    }

    async fn flush_pending(&mut self) -> Result<()> {
        self.incoming.clear();
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.close_count += 1;
        Ok(())
    }
}
