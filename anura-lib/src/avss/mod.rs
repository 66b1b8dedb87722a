//! Anura Vibration Sensing Service (AVSS) client.

pub mod ble;
pub mod client;
pub mod models;
pub mod opcode;
pub mod settings;

pub use client::{AvssChannel, AvssClient, AvssSession, DEFAULT_ATT_MTU};
pub use models::{ControlPointResponse, ParsedReport, Report, ReportTransferInfo};
pub use opcode::{OpCode, ReportType, ResponseCode};
pub use settings::{InvalidSettingKeyError, SettingsMapper};

/// GATT UUIDs of the AVSS service and its characteristics.
pub mod uuids {
    use uuid::{uuid, Uuid};

    pub const SERVICE: Uuid = uuid!("4d390100-1b04-4a6f-9c8d-5f21c3a0de77");
    /// Segmented report notifications.
    pub const REPORT: Uuid = uuid!("4d390101-1b04-4a6f-9c8d-5f21c3a0de77");
    /// Request/response command channel (write + indicate).
    pub const CONTROL_POINT: Uuid = uuid!("4d390102-1b04-4a6f-9c8d-5f21c3a0de77");
    /// Firmware transfer channel (write-without-response + notify).
    pub const PROGRAM: Uuid = uuid!("4d390103-1b04-4a6f-9c8d-5f21c3a0de77");
}
