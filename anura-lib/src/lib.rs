pub mod addr;
pub mod avss;
pub mod cbor;
pub mod coordinator;
pub mod error;
pub mod marshal;
pub mod transceiver;

// Re-export commonly used types
pub use addr::{AddrType, BluetoothAddrLE, InvalidAddressError};
pub use avss::client::{AvssChannel, AvssClient, AvssSession, ParsedReportStream, ReportStream};
pub use avss::models::{ParsedReport, Report, ReportTransferInfo};
pub use avss::opcode::{OpCode, ReportType, ResponseCode};
pub use cbor::Value;
pub use error::{AvssError, ControlPointError, RpcError, TransportError};
pub use marshal::{Marshal, MarshalError, Unmarshal};
pub use transceiver::client::{NotificationStream, TransceiverClient, DEFAULT_PORT};
pub use transceiver::models::Notification;
pub use transceiver::proxy::ProxyAvssClient;
