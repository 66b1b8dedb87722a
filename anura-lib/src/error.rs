use std::io;

use thiserror::Error;

use crate::cbor::{CborError, Value};
use crate::marshal::MarshalError;

/// Errors produced by the transport layer (TCP or USB).
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("USB error: {0}")]
    Usb(#[from] nusb::Error),

    #[error("transceiver with serial number {0:?} not found")]
    DeviceNotFound(String),

    #[error("end of stream")]
    Eof,

    #[error("timeout during transport operation: {0}")]
    Timeout(#[from] tokio::time::error::Elapsed),

    #[error("message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("invalid target spec: {0:?}")]
    InvalidTarget(String),
}

/// Errors produced by the transceiver RPC client.
#[derive(Error, Debug)]
pub enum RpcError {
    #[error("request {method:?} returned an error response: {error:?}")]
    Request { method: String, error: Value },

    #[error("disconnected from transceiver")]
    Disconnected,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Marshal(#[from] MarshalError),

    #[error(transparent)]
    Cbor(#[from] CborError),
}

/// An error response code from the AVSS control point.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlPointError {
    #[error("unspecified error")]
    Unspecified,

    #[error("opcode unsupported")]
    OpCodeUnsupported,

    #[error("node is busy")]
    Busy,

    #[error("bad argument")]
    BadArgument,

    #[error("response code {0}")]
    Other(u8),
}

impl ControlPointError {
    /// Map a wire response code to an error. `OK` (1) is not an error and
    /// yields `None`.
    pub fn from_response_code(code: u8) -> Option<Self> {
        match code {
            1 => None,
            2 => Some(ControlPointError::Unspecified),
            3 => Some(ControlPointError::OpCodeUnsupported),
            4 => Some(ControlPointError::Busy),
            5 => Some(ControlPointError::BadArgument),
            other => Some(ControlPointError::Other(other)),
        }
    }
}

/// Errors produced by an AVSS session, regardless of binding.
#[derive(Error, Debug)]
pub enum AvssError {
    #[error("disconnected from node")]
    Disconnected,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("control point error: {0}")]
    ControlPoint(#[from] ControlPointError),

    #[error("control point request timed out")]
    ControlPointTimeout,

    #[error("program transfer aborted by node")]
    TransferAborted,

    #[error(transparent)]
    Marshal(#[from] MarshalError),

    #[error(transparent)]
    Cbor(#[from] CborError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("bluetooth error: {0}")]
    Ble(#[from] btleplug::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_code_mapping() {
        assert_eq!(ControlPointError::from_response_code(1), None);
        assert_eq!(
            ControlPointError::from_response_code(3),
            Some(ControlPointError::OpCodeUnsupported)
        );
        assert_eq!(
            ControlPointError::from_response_code(4),
            Some(ControlPointError::Busy)
        );
        assert_eq!(
            ControlPointError::from_response_code(9),
            Some(ControlPointError::Other(9))
        );
    }
}
