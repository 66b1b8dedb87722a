//! Closed numeric enumerations of the AVSS control point protocol.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Control point opcodes. Requests and responses share the number space;
/// opcodes 100+ belong to the firmware upgrade flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum OpCode {
    ResponseCode = 1,
    ReportSnippet = 2,
    ReportAggregates = 3,
    ReportHealth = 4,
    GetVersion = 5,
    GetVersionResponse = 6,
    WriteSettings = 7,
    WriteSettingsResponse = 8,
    ReportSettings = 9,
    ApplySettings = 10,
    ApplySettingsResponse = 11,
    TestThroughput = 12,
    ReportCapture = 13,
    WriteSettingsV2 = 14,
    WriteSettingsV2Response = 15,
    Deactivate = 16,
    TriggerMeasurement = 17,
    GetFirmwareInfo = 18,
    GetFirmwareInfoResponse = 19,
    ResetReport = 20,
    ResetSettings = 21,
    PrepareUpgrade = 100,
    ApplyUpgrade = 101,
    ConfirmUpgrade = 102,
    Reboot = 103,
}

/// Status codes carried in a generic `ResponseCode` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ResponseCode {
    Ok = 1,
    Error = 2,
    OpCodeUnsupported = 3,
    Busy = 4,
    BadArgument = 5,
}

/// Discriminator byte at the start of every reassembled report record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ReportType {
    Snippet = 2,
    AggregatedValues = 3,
    Health = 4,
    Settings = 5,
    Capture = 6,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_values() {
        assert_eq!(u8::from(OpCode::GetVersion), 5);
        assert_eq!(u8::from(OpCode::PrepareUpgrade), 100);
        assert_eq!(OpCode::try_from(103).unwrap(), OpCode::Reboot);
        assert!(OpCode::try_from(99).is_err());
    }

    #[test]
    fn test_report_type_values() {
        assert_eq!(ReportType::try_from(6).unwrap(), ReportType::Capture);
        assert!(ReportType::try_from(1).is_err());
    }
}
