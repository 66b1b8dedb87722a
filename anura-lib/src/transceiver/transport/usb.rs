//! USB transceiver transport.
//!
//! Transceivers enumerate as a vendor-specific bulk interface. Outgoing
//! frames carry the same `u16`-BE length prefix as TCP; incoming bulk data
//! arrives in 64-byte packets that are reassembled into framed messages by
//! a background reader.

use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use nusb::io::{EndpointRead, EndpointWrite};
use nusb::transfer::Bulk;
use nusb::Interface;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, trace};

use crate::error::TransportError;

use super::MAX_MESSAGE_SIZE;

/// The IDs used by our transceivers.
pub const VENDOR_ID: u16 = 0x16D0;
pub const PRODUCT_ID: u16 = 0x13D4;

pub const OUT_ENDPOINT: u8 = 0x01; // host to device
pub const IN_ENDPOINT: u8 = 0x81; // device to host
pub const MAX_PACKET_SIZE: usize = 64;

const SEND_TIMEOUT: Duration = Duration::from_millis(1000);
const FLUSH_READ_TIMEOUT: Duration = Duration::from_millis(50);
const READ_BUFFER_SIZE: usize = 2048;

pub struct UsbTransport;

impl UsbTransport {
    /// Open the transceiver with the given serial number and start the
    /// background reader.
    pub async fn open(serial_number: &str) -> Result<(UsbReader, UsbWriter), TransportError> {
        let device_info = nusb::list_devices()
            .await?
            .find(|d| {
                d.vendor_id() == VENDOR_ID
                    && d.product_id() == PRODUCT_ID
                    && d.serial_number() == Some(serial_number)
            })
            .ok_or_else(|| TransportError::DeviceNotFound(serial_number.to_string()))?;

        debug!(
            "Transceiver found on bus {} addr {}",
            device_info.bus_id(),
            device_info.device_address()
        );

        let device = device_info.open().await?;

        if let Err(e) = device.detach_kernel_driver(0) {
            // The driver may already be detached, or the platform may not
            // support detaching at all.
            trace!("Could not detach kernel driver: {e}");
        }

        let interface = device.claim_interface(0).await?;
        debug!("USB interface claimed");

        let ep_in = interface.endpoint::<Bulk, _>(IN_ENDPOINT)?;
        let ep_out = interface.endpoint::<Bulk, _>(OUT_ENDPOINT)?;
        let mut reader = ep_in.reader(READ_BUFFER_SIZE).with_num_transfers(4);
        let writer = ep_out.writer(MAX_PACKET_SIZE).with_num_transfers(4);

        // Discard stale data the device buffered before we attached.
        flush_in_endpoint(&mut reader).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let reader_task = tokio::spawn(background_reader(reader, tx));

        Ok((
            UsbReader { rx },
            UsbWriter {
                writer,
                reader_task,
                _interface: interface,
            },
        ))
    }

    /// Serial numbers of all connected transceivers.
    pub async fn list_devices() -> Result<Vec<String>, TransportError> {
        let devices = nusb::list_devices().await?;
        Ok(devices
            .filter(|d| d.vendor_id() == VENDOR_ID && d.product_id() == PRODUCT_ID)
            .filter_map(|d| d.serial_number().map(str::to_string))
            .collect())
    }
}

async fn flush_in_endpoint(reader: &mut EndpointRead<Bulk>) -> Result<(), TransportError> {
    let mut scratch = [0u8; MAX_PACKET_SIZE];
    loop {
        match timeout(FLUSH_READ_TIMEOUT, reader.read(&mut scratch)).await {
            Ok(Ok(0)) | Err(_) => return Ok(()),
            Ok(Ok(n)) => trace!("Flushed {n} stale bytes from IN endpoint"),
            Ok(Err(e)) => {
                error!("Error while flushing IN endpoint: {e}");
                return Err(e.into());
            }
        }
    }
}

/// Keep a read pending on the IN endpoint and extract complete
/// length-prefixed messages into the receive queue.
async fn background_reader(mut reader: EndpointRead<Bulk>, tx: mpsc::UnboundedSender<Bytes>) {
    let mut buf = BytesMut::new();
    let mut chunk = [0u8; READ_BUFFER_SIZE];
    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                error!("USB error while receiving: {e}");
                break;
            }
        };
        trace!("RX [{n} bytes]");
        buf.extend_from_slice(&chunk[..n]);

        while buf.len() >= 2 {
            let msg_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
            if buf.len() < 2 + msg_len {
                break; // need more data
            }
            buf.advance(2);
            let msg = buf.split_to(msg_len).freeze();
            if tx.send(msg).is_err() {
                return; // receiver side closed
            }
        }
    }
    // Dropping the sender ends the receive queue, which readers observe
    // as end-of-stream.
}

pub struct UsbReader {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl UsbReader {
    pub async fn read(&mut self) -> Result<Bytes, TransportError> {
        match self.rx.recv().await {
            Some(message) => Ok(message),
            None => {
                debug!("USB connection closed during read");
                Err(TransportError::Eof)
            }
        }
    }
}

pub struct UsbWriter {
    writer: EndpointWrite<Bulk>,
    reader_task: JoinHandle<()>,
    // Keeps the interface claimed for the lifetime of the connection.
    _interface: Interface,
}

impl UsbWriter {
    pub async fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(TransportError::MessageTooLarge(payload.len()));
        }
        let mut packet = Vec::with_capacity(2 + payload.len());
        packet.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        packet.extend_from_slice(payload);

        timeout(SEND_TIMEOUT, self.writer.write_all(&packet)).await??;
        timeout(SEND_TIMEOUT, self.writer.flush_end_async()).await??;
        Ok(())
    }

    pub async fn close(&mut self) {
        self.reader_task.abort();
        debug!("USB interface released");
    }
}
