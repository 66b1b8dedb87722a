//! Typed payloads for AVSS control point requests, responses and reports.

use std::collections::BTreeMap;

use bytes::Bytes;
use tracing::warn;

use crate::cbor::Value;
use crate::marshal::{self, Marshal, MarshalError, Unmarshal};
use crate::record;

use super::opcode::ReportType;

record! {
    pub struct ReportSnippetArgs {
        0 => count: Option<i64>,
        1 => auto_resume: bool,
    }
}

record! {
    pub struct ReportAggregatesArgs {
        0 => count: Option<i64>,
        1 => auto_resume: bool,
    }
}

record! {
    pub struct ReportCaptureArgs {
        0 => count: Option<i64>,
        1 => auto_resume: bool,
    }
}

/// The health report argument is either a report count or, for older
/// firmware, a bare activation flag. `Active(true)` is what legacy nodes
/// expect when no count is given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthCount {
    Active(bool),
    Count(i64),
}

impl Marshal for HealthCount {
    fn marshal(&self) -> Value {
        match self {
            HealthCount::Active(flag) => Value::Bool(*flag),
            HealthCount::Count(count) => Value::Int(*count),
        }
    }
}

impl Unmarshal for HealthCount {
    fn unmarshal(value: &Value) -> Result<Self, MarshalError> {
        match value {
            Value::Bool(flag) => Ok(HealthCount::Active(*flag)),
            Value::Int(count) => Ok(HealthCount::Count(*count)),
            other => Err(MarshalError::mismatch("bool or int", other)),
        }
    }
}

record! {
    pub struct ReportHealthArgs {
        0 => count: HealthCount,
    }
}

record! {
    pub struct ReportSettingsArgs {
        0 => current: bool,
        1 => pending: bool,
    }
}

record! {
    pub struct PrepareUpgradeArgs {
        0 => image: i64,
        1 => size: i64,
    }
}

record! {
    pub struct ApplyUpgradeArgs {}
}

record! {
    pub struct ConfirmUpgradeArgs {
        0 => image: i64,
    }
}

record! {
    pub struct TestThroughputArgs {
        0 => duration: i64,
    }
}

record! {
    pub struct ApplySettingsArgs {
        0 => persist: bool,
    }
}

record! {
    pub struct DeactivateArgs {
        0 => key: u32,
    }
}

record! {
    pub struct TriggerMeasurementArgs {
        0 => duration_ms: i64,
    }
}

record! {
    pub struct ApplySettingsResponse {
        0 => will_reboot: bool,
    }
}

record! {
    pub struct WriteSettingsResponse {
        0 => num_unhandled: i64,
    }
}

record! {
    pub struct WriteSettingsV2Args {
        0 => settings: Value,
        1 => reset_defaults: bool,
        2 => apply: bool,
    }
}

record! {
    pub struct WriteSettingsV2Response {
        0 => num_unhandled: i64,
        1 => will_reboot: bool,
    }
}

record! {
    pub struct GetVersionResponse {
        0 => version: String,
        1 => build_version: String,
    }
}

record! {
    pub struct GetFirmwareInfoResponse {
        0 => app_version: u32,
        1 => app_build_version: String,
        2 => app_status: i64,
        3 => net_version: u32,
        4 => net_build_version: String,
    }
}

record! {
    /// A short burst of raw acceleration samples, one byte buffer per axis.
    pub struct SnippetReport {
        0 => start_time: i64,
        1 => sample_rate: f32,
        2 => range: i32,
        3 => samples: BTreeMap<i64, Bytes>,
        4 => is_synced: bool,
    }
}

record! {
    pub struct CaptureReport {
        0 => start_time: i64,
        1 => unused: i64,
        2 => range: i32,
        3 => samples: BTreeMap<i64, Bytes>,
        4 => is_synced: bool,
        5 => duration: i64,
        6 => start_time_monotonic: i64,
        7 => duration_monotonic: i64,
    }
}

record! {
    // Tag 1 is reserved and never declared here.
    pub struct AggregatedValuesReport {
        0 => start_time: i64,
        2 => values: BTreeMap<i64, f32>,
    }
}

record! {
    pub struct HealthReport {
        0 => uptime: i64,
        1 => reboot_count: i64,
        2 => reset_cause: i64,
        3 => temperature: f32,
        4 => battery_voltage: i64,
        5 => rssi: i64,
        6 => eh_voltage: i64,
        7 => clock_sync_skew: Option<f32> = None,
        8 => clock_sync_age: Option<i64> = None,
        9 => clock_sync_diff: Option<i64> = None,
    }
}

record! {
    pub struct SettingsReport {
        0 => settings: Option<Value> = None,
        1 => pending_settings: Option<Value> = None,
    }
}

/// Timing and size statistics for one reassembled report.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportTransferInfo {
    /// Wall-clock seconds when the first segment arrived.
    pub start_time: f64,
    /// Seconds between the first and the last segment.
    pub elapsed_time: f64,
    pub num_bytes: usize,
    pub num_segments: u32,
}

/// A complete report record as reassembled from segments. The payload is
/// still CBOR; call [`Report::parse`] for the typed form.
#[derive(Debug, Clone)]
pub struct Report {
    pub report_type: u8,
    pub payload_cbor: Bytes,
    pub transfer_info: Option<ReportTransferInfo>,
}

/// A typed report payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedReport {
    Snippet(SnippetReport),
    AggregatedValues(AggregatedValuesReport),
    Health(HealthReport),
    Settings(SettingsReport),
    Capture(CaptureReport),
}

impl Report {
    pub fn from_record(record: Bytes, transfer_info: Option<ReportTransferInfo>) -> Option<Self> {
        if record.is_empty() {
            return None;
        }
        Some(Report {
            report_type: record[0],
            payload_cbor: record.slice(1..),
            transfer_info,
        })
    }

    /// Decode the payload into the typed report for this report type.
    /// Returns `None` for report types this library does not know.
    pub fn parse(&self) -> Result<Option<ParsedReport>, MarshalError> {
        let Ok(report_type) = ReportType::try_from(self.report_type) else {
            warn!("Unknown report type {} skipped", self.report_type);
            return Ok(None);
        };
        let parsed = match report_type {
            ReportType::Snippet => ParsedReport::Snippet(marshal::from_cbor(&self.payload_cbor)?),
            ReportType::AggregatedValues => {
                ParsedReport::AggregatedValues(marshal::from_cbor(&self.payload_cbor)?)
            }
            ReportType::Health => ParsedReport::Health(marshal::from_cbor(&self.payload_cbor)?),
            ReportType::Settings => ParsedReport::Settings(marshal::from_cbor(&self.payload_cbor)?),
            ReportType::Capture => ParsedReport::Capture(marshal::from_cbor(&self.payload_cbor)?),
        };
        Ok(Some(parsed))
    }
}

/// A typed control point response, dispatched by response opcode.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlPointResponse {
    GetVersion(GetVersionResponse),
    WriteSettings(WriteSettingsResponse),
    WriteSettingsV2(WriteSettingsV2Response),
    ApplySettings(ApplySettingsResponse),
    GetFirmwareInfo(GetFirmwareInfoResponse),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cbor;

    #[test]
    fn test_health_report_optional_tail() {
        // Keys 7-9 may be absent entirely.
        let value = cbor::from_slice(
            &hex::decode("a700010101020103fa3fc0000004190e7405382506190b54").unwrap(),
        )
        .unwrap();
        let report = HealthReport::unmarshal(&value).unwrap();
        assert_eq!(report.uptime, 1);
        assert_eq!(report.battery_voltage, 3700);
        assert_eq!(report.rssi, -38);
        assert_eq!(report.clock_sync_skew, None);
        assert_eq!(report.clock_sync_age, None);
    }

    #[test]
    fn test_settings_report_independent_fields() {
        let only_pending = SettingsReport::unmarshal(&Value::Map(vec![(
            Value::Int(1),
            Value::Map(vec![(Value::Int(0), Value::Int(1024))]),
        )]))
        .unwrap();
        assert!(only_pending.settings.is_none());
        assert!(only_pending.pending_settings.is_some());
    }

    #[test]
    fn test_health_count_forms() {
        assert_eq!(HealthCount::Active(true).marshal(), Value::Bool(true));
        assert_eq!(HealthCount::Count(3).marshal(), Value::Int(3));
        assert_eq!(
            HealthCount::unmarshal(&Value::Int(2)).unwrap(),
            HealthCount::Count(2)
        );
    }

    #[test]
    fn test_parse_unknown_report_type() {
        let report = Report {
            report_type: 0x7F,
            payload_cbor: Bytes::from_static(&[0xF6]),
            transfer_info: None,
        };
        assert!(report.parse().unwrap().is_none());
    }

    #[test]
    fn test_parse_settings_report() {
        // {0: {0: 1024}}
        let report = Report {
            report_type: ReportType::Settings.into(),
            payload_cbor: Bytes::from(hex::decode("a100a100190400").unwrap()),
            transfer_info: None,
        };
        match report.parse().unwrap() {
            Some(ParsedReport::Settings(settings)) => {
                assert!(settings.settings.is_some());
                assert!(settings.pending_settings.is_none());
            }
            other => panic!("unexpected parse result: {other:?}"),
        }
    }
}
