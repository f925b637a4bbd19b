//! Serial transport over a CDC-ACM virtual port.
//!
//! The framing is identical to the USB transport; here the stream is a
//! serial port driven through the frame codec.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::SinkExt;
use tokio::time;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;

use crate::encoding::FrameCodec;
use crate::error::{Error, Result};
use crate::tracing::prelude::*;
use crate::transport::Transport;

/// Nominal rate only; the CDC-ACM link ignores it.
const BAUD_RATE: u32 = 115_200;

const WRITE_TIMEOUT: Duration = Duration::from_secs(1);
const FLUSH_CHUNK_TIMEOUT: Duration = Duration::from_millis(10);
const FLUSH_CHUNK_LIMIT: usize = 100;

/// Framed transport over one exclusively owned serial port.
pub struct SerialTransport {
    framed: Option<Framed<SerialStream, FrameCodec>>,
}

impl SerialTransport {
    pub fn open(path: &str) -> Result<Self> {
        let stream = tokio_serial::new(path, BAUD_RATE)
            .open_native_async()
            .map_err(|e| Error::Transport(format!("init error: {e}")))?;
        Ok(Self {
            framed: Some(Framed::new(stream, FrameCodec)),
        })
    }

    fn framed_mut(&mut self) -> Result<&mut Framed<SerialStream, FrameCodec>> {
        self.framed
            .as_mut()
            .ok_or_else(|| Error::Transport("connection is closed".into()))
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn send(&mut self, payload: &[u8]) -> Result<()> {
        trace!(bytes = payload.len(), "serial write");
        let framed = self.framed_mut()?;
        time::timeout(WRITE_TIMEOUT, framed.send(Bytes::copy_from_slice(payload)))
            .await
            .map_err(|_| Error::Timeout)?
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Bytes> {
        let framed = self.framed_mut()?;
        match time::timeout(timeout, framed.next()).await {
            Err(_) => Err(Error::Timeout),
            Ok(None) => Err(Error::Transport("serial stream closed".into())),
            Ok(Some(payload)) => payload,
        }
    }

    async fn flush_pending(&mut self) -> Result<()> {
        // Read off whatever the device pushed before we attached. Stale
        // malformed frames are discarded, not reported.
        for _ in 0..FLUSH_CHUNK_LIMIT {
            let framed = self.framed_mut()?;
            match time::timeout(FLUSH_CHUNK_TIMEOUT, framed.next()).await {
                Err(_) => break,
                Ok(None) => break,
                Ok(Some(Ok(_))) => continue,
                Ok(Some(Err(Error::Decoding(_)))) => continue,
                Ok(Some(Err(e))) => return Err(e),
            }
        }
        self.framed_mut()?.read_buffer_mut().clear();
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.framed = None;
        Ok(())
    }
}
