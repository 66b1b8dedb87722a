//! TCP/IP transceiver transport.

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::TransportError;

use super::MAX_MESSAGE_SIZE;

pub struct TcpTransport;

impl TcpTransport {
    pub async fn open(host: &str, port: u16) -> Result<(TcpReader, TcpWriter), TransportError> {
        debug!("Connecting to {host}:{port}");
        let stream = TcpStream::connect((host, port)).await?;
        let (read_half, write_half) = stream.into_split();
        Ok((TcpReader { inner: read_half }, TcpWriter { inner: write_half }))
    }
}

pub struct TcpReader {
    inner: OwnedReadHalf,
}

impl TcpReader {
    pub async fn read(&mut self) -> Result<Bytes, TransportError> {
        let mut header = [0u8; 2];
        read_exact_or_eof(&mut self.inner, &mut header).await?;
        let payload_len = u16::from_be_bytes(header) as usize;

        let mut payload = vec![0u8; payload_len];
        read_exact_or_eof(&mut self.inner, &mut payload).await?;
        Ok(Bytes::from(payload))
    }
}

async fn read_exact_or_eof(
    reader: &mut OwnedReadHalf,
    buf: &mut [u8],
) -> Result<(), TransportError> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(TransportError::Eof),
        Err(e) => Err(e.into()),
    }
}

pub struct TcpWriter {
    inner: OwnedWriteHalf,
}

impl TcpWriter {
    pub async fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(TransportError::MessageTooLarge(payload.len()));
        }
        self.inner
            .write_all(&(payload.len() as u16).to_be_bytes())
            .await?;
        self.inner.write_all(payload).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn close(&mut self) {
        let _ = self.inner.shutdown().await;
    }
}
