//! USB transport using raw bulk transfers.
//!
//! The TIC enumerates as a V-USB vendor device identified by its
//! manufacturer and product strings. Frames move over one bulk endpoint
//! pair on interface 0; reads accumulate into a buffer that is split on
//! the frame delimiter.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use nusb::transfer::RequestBuffer;
use tokio::time;

use crate::encoding::{decode, encode, FRAME_DELIMITER};
use crate::error::{Error, Result};
use crate::tracing::prelude::*;
use crate::transport::Transport;

const VUSB_VENDOR_ID: u16 = 0x16c0;
const VUSB_PRODUCT_ID: u16 = 0x27dd;
const USB_MANUFACTURER: &str = "Airel";
const USB_PRODUCT: &str = "TIC";

const TIC_INTERFACE: u8 = 0;
const TIC_IN_ENDPOINT: u8 = 0x82;
const TIC_OUT_ENDPOINT: u8 = 0x01;

/// Matches the transmit buffer on the device side.
const RECEIVE_BUFFER_SIZE: usize = 10 * 1024;

const WRITE_TIMEOUT: Duration = Duration::from_millis(100);
const FLUSH_CHUNK_TIMEOUT: Duration = Duration::from_millis(1);
const FLUSH_CHUNK_LIMIT: usize = 100;

/// Bus location and identity of one TIC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDeviceAddress {
    pub bus: u8,
    pub address: u8,
    pub serial_number: String,
}

/// Explicit handle for USB enumeration.
///
/// Discovery goes through a context value owned by the caller rather than
/// hidden process-wide state. The multi-device logger holds one context
/// together with an exclusion set of bus addresses it already supervises.
#[derive(Debug, Clone, Default)]
pub struct UsbContext(());

impl UsbContext {
    pub fn new() -> Self {
        Self(())
    }

    /// List every connected TIC, skipping excluded bus addresses.
    pub fn find_all(&self, exclude: &HashSet<(u8, u8)>) -> Result<Vec<UsbDeviceAddress>> {
        let devices = nusb::list_devices()
            .map_err(|e| Error::Transport(format!("USB error: {e}")))?
            .filter(is_tic)
            .filter(|di| !exclude.contains(&(di.bus_number(), di.device_address())))
            .map(|di| UsbDeviceAddress {
                bus: di.bus_number(),
                address: di.device_address(),
                serial_number: di.serial_number().unwrap_or_default().to_string(),
            })
            .collect();
        Ok(devices)
    }

    fn open_device(
        &self,
        serial_number: Option<&str>,
        bus_address: Option<(u8, u8)>,
    ) -> Result<nusb::Device> {
        let wanted = match serial_number {
            None | Some("") | Some("*") => None,
            Some(serial_number) => Some(serial_number),
        };

        let candidates: Vec<_> = nusb::list_devices()
            .map_err(|e| Error::Transport(format!("USB error: {e}")))?
            .filter(is_tic)
            .filter(|di| {
                bus_address.map_or(true, |ba| (di.bus_number(), di.device_address()) == ba)
            })
            .filter(|di| wanted.map_or(true, |sn| di.serial_number() == Some(sn)))
            .collect();

        match candidates.as_slice() {
            [] => Err(Error::Transport("device not found".into())),
            [device] => device
                .open()
                .map_err(|e| Error::Transport(format!("init error: {e}"))),
            found => {
                let serials: Vec<_> = found
                    .iter()
                    .map(|di| di.serial_number().unwrap_or("?"))
                    .collect();
                Err(Error::Transport(format!(
                    "found multiple matching devices: {}",
                    serials.join(", ")
                )))
            }
        }
    }
}

fn is_tic(di: &nusb::DeviceInfo) -> bool {
    di.vendor_id() == VUSB_VENDOR_ID
        && di.product_id() == VUSB_PRODUCT_ID
        && di.manufacturer_string() == Some(USB_MANUFACTURER)
        && di.product_string() == Some(USB_PRODUCT)
}

/// Bulk-endpoint transport for one claimed TIC interface.
pub struct UsbTransport {
    interface: Option<nusb::Interface>,
    buf: BytesMut,
}

impl UsbTransport {
    /// Open the single matching device, optionally filtered by serial
    /// number.
    pub fn open(ctx: &UsbContext, serial_number: Option<&str>) -> Result<Self> {
        let device = ctx.open_device(serial_number, None)?;
        Self::claim(device)
    }

    /// Open the device at a known bus address (multi-device discovery).
    pub fn open_at(ctx: &UsbContext, addr: &UsbDeviceAddress) -> Result<Self> {
        let device = ctx.open_device(
            Some(addr.serial_number.as_str()),
            Some((addr.bus, addr.address)),
        )?;
        Self::claim(device)
    }

    fn claim(device: nusb::Device) -> Result<Self> {
        let interface = device
            .detach_and_claim_interface(TIC_INTERFACE)
            .map_err(|e| Error::Transport(format!("init error: {e}")))?;
        Ok(Self {
            interface: Some(interface),
            buf: BytesMut::new(),
        })
    }

    fn interface(&self) -> Result<&nusb::Interface> {
        self.interface
            .as_ref()
            .ok_or_else(|| Error::Transport("connection is closed".into()))
    }

    async fn read_chunk(&mut self, timeout: Duration) -> Result<()> {
        let transfer = self
            .interface()?
            .bulk_in(TIC_IN_ENDPOINT, RequestBuffer::new(RECEIVE_BUFFER_SIZE));
        let completion = time::timeout(timeout, transfer)
            .await
            .map_err(|_| Error::Timeout)?;
        completion.status?;
        trace!(bytes = completion.data.len(), "bulk read");
        self.buf.extend_from_slice(&completion.data);
        Ok(())
    }
}

#[async_trait]
impl Transport for UsbTransport {
    async fn send(&mut self, payload: &[u8]) -> Result<()> {
        let mut frame = encode(payload)?;
        frame.push(FRAME_DELIMITER);
        trace!(bytes = frame.len(), "bulk write");

        let transfer = self.interface()?.bulk_out(TIC_OUT_ENDPOINT, frame);
        let completion = time::timeout(WRITE_TIMEOUT, transfer)
            .await
            .map_err(|_| Error::Timeout)?;
        completion.status?;
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Bytes> {
        let deadline = time::Instant::now() + timeout;
        loop {
            while let Some(pos) = self.buf.iter().position(|&b| b == FRAME_DELIMITER) {
                let frame = self.buf.split_to(pos);
                self.buf.advance(1);
                if frame.is_empty() {
                    continue;
                }
                return decode(&frame).map(Bytes::from);
            }

            let remaining = deadline.saturating_duration_since(time::Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout);
            }
            self.read_chunk(remaining).await?;
        }
    }

    async fn flush_pending(&mut self) -> Result<()> {
        for _ in 0..FLUSH_CHUNK_LIMIT {
            match self.read_chunk(FLUSH_CHUNK_TIMEOUT).await {
                Ok(()) => {}
                Err(Error::Timeout) => break,
                Err(e) => return Err(e),
            }
        }

        // Keep a partial frame tail; it completes with the next delimiter.
        match self.buf.iter().rposition(|&b| b == FRAME_DELIMITER) {
            Some(pos) => self.buf.advance(pos + 1),
            None => self.buf.clear(),
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.interface = None;
        self.buf.clear();
        Ok(())
    }
}
