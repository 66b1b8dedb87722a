//! Framed byte transports carrying the transceiver RPC protocol.
//!
//! Every message travels as a `u16` big-endian byte length followed by the
//! CBOR payload, over either a TCP connection or a USB bulk pipe. A target
//! spec string selects the variant: `tcp:<host>`, `usb:<serial>`, or a bare
//! hostname which defaults to TCP.

pub mod tcp;
pub mod usb;

use std::str::FromStr;

use bytes::Bytes;

use crate::error::TransportError;

pub use tcp::TcpTransport;
pub use usb::UsbTransport;

/// Largest payload expressible with the 16-bit length prefix.
pub const MAX_MESSAGE_SIZE: usize = 0xFFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Tcp,
    Usb,
}

/// A parsed `<scheme>:<target>` transport address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
    pub scheme: Scheme,
    pub target: String,
}

impl FromStr for TargetSpec {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, target) = match s.split_once(':') {
            None => (Scheme::Tcp, s),
            Some(("tcp", target)) => (Scheme::Tcp, target),
            Some(("usb", target)) => (Scheme::Usb, target),
            Some(_) => return Err(TransportError::InvalidTarget(s.to_string())),
        };
        if target.is_empty() {
            return Err(TransportError::InvalidTarget(s.to_string()));
        }
        Ok(TargetSpec {
            scheme,
            target: target.to_string(),
        })
    }
}

pub struct Transport;

impl Transport {
    /// Open a connection to the target and split it into its read and
    /// write halves.
    pub async fn open(
        spec: &TargetSpec,
        port: u16,
    ) -> Result<(TransportReader, TransportWriter), TransportError> {
        match spec.scheme {
            Scheme::Tcp => {
                let (reader, writer) = TcpTransport::open(&spec.target, port).await?;
                Ok((TransportReader::Tcp(reader), TransportWriter::Tcp(writer)))
            }
            Scheme::Usb => {
                let (reader, writer) = UsbTransport::open(&spec.target).await?;
                Ok((TransportReader::Usb(reader), TransportWriter::Usb(writer)))
            }
        }
    }
}

pub enum TransportReader {
    Tcp(tcp::TcpReader),
    Usb(usb::UsbReader),
}

impl TransportReader {
    /// Read the next complete framed payload. Returns
    /// [`TransportError::Eof`] when the peer closes.
    pub async fn read(&mut self) -> Result<Bytes, TransportError> {
        match self {
            TransportReader::Tcp(reader) => reader.read().await,
            TransportReader::Usb(reader) => reader.read().await,
        }
    }
}

pub enum TransportWriter {
    Tcp(tcp::TcpWriter),
    Usb(usb::UsbWriter),
}

impl TransportWriter {
    /// Send one framed payload.
    pub async fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        match self {
            TransportWriter::Tcp(writer) => writer.send(payload).await,
            TransportWriter::Usb(writer) => writer.send(payload).await,
        }
    }

    pub async fn close(&mut self) {
        match self {
            TransportWriter::Tcp(writer) => writer.close().await,
            TransportWriter::Usb(writer) => writer.close().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_spec_parsing() {
        assert_eq!(
            "tcp:transceiver.local".parse::<TargetSpec>().unwrap(),
            TargetSpec {
                scheme: Scheme::Tcp,
                target: "transceiver.local".into()
            }
        );
        assert_eq!(
            "usb:AB1234".parse::<TargetSpec>().unwrap(),
            TargetSpec {
                scheme: Scheme::Usb,
                target: "AB1234".into()
            }
        );
        // Bare strings default to TCP.
        assert_eq!(
            "192.168.0.10".parse::<TargetSpec>().unwrap().scheme,
            Scheme::Tcp
        );
        assert!("serial:foo".parse::<TargetSpec>().is_err());
        assert!("usb:".parse::<TargetSpec>().is_err());
    }
}
