//! Typed records of the transceiver RPC protocol.

use std::net::Ipv4Addr;

use bytes::Bytes;
use uuid::Uuid;

use crate::addr::BluetoothAddrLE;
use crate::cbor::Value;
use crate::marshal::{MarshalError, Unmarshal};
use crate::record;

/// RPC message tags, the first element of every wire message.
pub mod msg_type {
    pub const REQUEST: i64 = 0;
    pub const RESPONSE: i64 = 1;
    pub const NOTIFICATION: i64 = 2;
}

record! {
    /// Error object carried in an RPC error response.
    pub struct ApiError {
        0 => code: i64,
        1 => internal_code: i64,
        2 => message: String,
    }
}

record! {
    pub struct AssignedNode {
        0 => address: BluetoothAddrLE,
    }
}

record! {
    pub struct SetAssignedNodesArgs {
        0 => nodes: Vec<AssignedNode>,
    }
}

record! {
    pub struct GetAssignedNodesResult {
        0 => nodes: Vec<AssignedNode>,
    }
}

record! {
    pub struct ConnectedNode {
        0 => address: BluetoothAddrLE,
        1 => rssi: i64,
    }
}

record! {
    pub struct GetConnectedNodesResult {
        0 => nodes: Vec<ConnectedNode>,
    }
}

record! {
    pub struct AvssRequestArgs {
        0 => address: BluetoothAddrLE,
        1 => data: Bytes,
    }
}

record! {
    pub struct AvssProgramWriteArgs {
        0 => address: BluetoothAddrLE,
        1 => data: Bytes,
    }
}

record! {
    pub struct GetDeviceInfoResult {
        0 => board: String,
        1 => hw_rev: i64,
        2 => device_id: Bytes,
        3 => app_version: String,
        4 => app_build_version: String,
        5 => serial_number: String,
        6 => hostname: String,
        7 => mac_address: Bytes,
        8 => ip_addresses: Vec<Ipv4Addr>,
    }
}

record! {
    pub struct GetDeviceStatusResult {
        0 => uptime: i64,
        1 => reboot_count: i64,
        2 => reset_cause: i64,
    }
}

record! {
    pub struct GetFirmwareInfoResult {
        0 => dfu_status: i64,
        1 => app_version: u32,
        2 => app_build_version: String,
        3 => net_version: u32,
        4 => net_build_version: String,
    }
}

record! {
    pub struct GetPtpStatusResult {
        0 => port_state: String,
        1 => offset: i64,
        2 => delay: i64,
        3 => offset_histogram: Vec<i64>,
    }
}

record! {
    pub struct DfuPrepareArgs {
        0 => size: i64,
    }
}

record! {
    pub struct DfuWriteArgs {
        0 => offset: i64,
        1 => data: Bytes,
    }
}

record! {
    pub struct DfuApplyArgs {
        0 => permanent: u32,
    }
}

record! {
    pub struct SetTimeArgs {
        0 => time: i64,
    }
}

record! {
    pub struct GetTimeResult {
        0 => time: i64,
    }
}

record! {
    pub struct NodeConnectedEvent {
        0 => address: BluetoothAddrLE,
    }
}

record! {
    pub struct NodeDisconnectedEvent {
        0 => address: BluetoothAddrLE,
    }
}

record! {
    pub struct NodeServiceDiscoveredEvent {
        0 => address: BluetoothAddrLE,
        1 => uuid: Uuid,
    }
}

record! {
    pub struct AvssReportNotifiedEvent {
        0 => address: BluetoothAddrLE,
        1 => value: Bytes,
    }
}

record! {
    pub struct AvssProgramNotifiedEvent {
        0 => address: BluetoothAddrLE,
        1 => value: Bytes,
    }
}

record! {
    pub struct ScanNodesReceivedEvent {
        0 => address: BluetoothAddrLE,
        1 => rssi: i64,
        2 => data: Bytes,
    }
}

/// A server-pushed notification, dispatched by its type name.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    NodeConnected(NodeConnectedEvent),
    NodeDisconnected(NodeDisconnectedEvent),
    NodeServiceDiscovered(NodeServiceDiscoveredEvent),
    AvssReportNotified(AvssReportNotifiedEvent),
    AvssProgramNotified(AvssProgramNotifiedEvent),
    ScanNodesReceived(ScanNodesReceivedEvent),
    Unknown {
        notification_type: String,
        argument: Value,
    },
}

impl Notification {
    pub fn parse(notification_type: &str, argument: &Value) -> Result<Self, MarshalError> {
        Ok(match notification_type {
            "node_connected" => Notification::NodeConnected(Unmarshal::unmarshal(argument)?),
            "node_disconnected" => Notification::NodeDisconnected(Unmarshal::unmarshal(argument)?),
            "node_service_discovered" => {
                Notification::NodeServiceDiscovered(Unmarshal::unmarshal(argument)?)
            }
            "avss_report_notified" => {
                Notification::AvssReportNotified(Unmarshal::unmarshal(argument)?)
            }
            "avss_program_notified" => {
                Notification::AvssProgramNotified(Unmarshal::unmarshal(argument)?)
            }
            "scan_nodes_received" => {
                Notification::ScanNodesReceived(Unmarshal::unmarshal(argument)?)
            }
            _ => Notification::Unknown {
                notification_type: notification_type.to_string(),
                argument: argument.clone(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshal::Marshal;

    fn addr() -> BluetoothAddrLE {
        "a1:b2:c3:d4:e5:f6/random".parse().unwrap()
    }

    #[test]
    fn test_parse_known_notification() {
        let event = NodeConnectedEvent { address: addr() };
        let parsed = Notification::parse("node_connected", &event.marshal()).unwrap();
        assert_eq!(parsed, Notification::NodeConnected(event));
    }

    #[test]
    fn test_parse_unknown_notification() {
        let parsed = Notification::parse("battery_low", &Value::Int(7)).unwrap();
        assert_eq!(
            parsed,
            Notification::Unknown {
                notification_type: "battery_low".into(),
                argument: Value::Int(7),
            }
        );
    }

    #[test]
    fn test_assigned_nodes_roundtrip() {
        let args = SetAssignedNodesArgs {
            nodes: vec![AssignedNode { address: addr() }],
        };
        let value = args.marshal();
        assert_eq!(SetAssignedNodesArgs::unmarshal(&value).unwrap(), args);
    }
}
