//! Direct-BLE binding of the AVSS session, using the host's own Bluetooth
//! adapter through btleplug.

use std::sync::Mutex as StdMutex;
use std::time::Duration;

use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::addr::BluetoothAddrLE;
use crate::error::AvssError;

use super::client::{AvssChannel, AvssClient};
use super::uuids;

const SCAN_TIMEOUT: Duration = Duration::from_secs(30);
const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// An AVSS session carried directly over a GATT connection.
pub type BleAvssClient = AvssClient<BleChannel>;

pub struct BleChannel {
    peripheral: Peripheral,
    control_point: Characteristic,
    program: Characteristic,
    cp_responses: Mutex<mpsc::Receiver<Bytes>>,
    dispatch_task: StdMutex<Option<JoinHandle<()>>>,
}

impl AvssClient<BleChannel> {
    /// Scan for the node, connect and subscribe to the AVSS characteristics.
    pub async fn connect_ble(address: &BluetoothAddrLE) -> Result<Self, AvssError> {
        let adapter = default_adapter().await?;
        let peripheral = find_peripheral(&adapter, address).await?;

        info!("Connecting to {address}");
        peripheral.connect().await?;
        peripheral.discover_services().await?;

        let characteristics = peripheral.characteristics();
        let find = |uuid| {
            characteristics
                .iter()
                .find(|c| c.uuid == uuid)
                .cloned()
                .ok_or_else(|| {
                    AvssError::Protocol(format!("AVSS characteristic {uuid} not found"))
                })
        };
        let report = find(uuids::REPORT)?;
        let control_point = find(uuids::CONTROL_POINT)?;
        let program = find(uuids::PROGRAM)?;

        peripheral.subscribe(&report).await?;
        peripheral.subscribe(&control_point).await?;
        peripheral.subscribe(&program).await?;

        let mut notifications = peripheral.notifications().await?;
        let mut events = adapter.events().await?;
        let peripheral_id = peripheral.id();

        // The control point indicates exactly one response per request; the
        // slot holds a single frame.
        let (cp_tx, cp_rx) = mpsc::channel(1);

        let client = AvssClient::new(BleChannel {
            peripheral,
            control_point,
            program,
            cp_responses: Mutex::new(cp_rx),
            dispatch_task: StdMutex::new(None),
        });

        let session = client.session();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    notification = notifications.next() => match notification {
                        Some(n) if n.uuid == uuids::REPORT => {
                            session.handle_report_segment(&n.value);
                        }
                        Some(n) if n.uuid == uuids::CONTROL_POINT => {
                            if cp_tx.try_send(Bytes::from(n.value)).is_err() {
                                warn!("Unsolicited control point indication dropped");
                            }
                        }
                        Some(n) if n.uuid == uuids::PROGRAM => {
                            session.handle_program_notify(&n.value);
                        }
                        Some(n) => debug!("Notification for unknown characteristic {}", n.uuid),
                        None => break,
                    },
                    event = events.next() => match event {
                        Some(CentralEvent::DeviceDisconnected(id)) if id == peripheral_id => {
                            info!("Node disconnected");
                            break;
                        }
                        Some(_) => {}
                        None => break,
                    },
                }
            }
            session.set_disconnected();
        });
        client.channel().dispatch_task.lock().unwrap().replace(task);

        Ok(client)
    }
}

impl AvssChannel for BleChannel {
    async fn request_raw(&self, frame: Bytes) -> Result<Bytes, AvssError> {
        let mut responses = self.cp_responses.lock().await;
        while responses.try_recv().is_ok() {
            warn!("Flushing lingering responses");
        }
        self.peripheral
            .write(&self.control_point, &frame, WriteType::WithResponse)
            .await?;
        responses.recv().await.ok_or(AvssError::Disconnected)
    }

    async fn program_write(&self, frame: Bytes) -> Result<(), AvssError> {
        self.peripheral
            .write(&self.program, &frame, WriteType::WithoutResponse)
            .await?;
        Ok(())
    }

    async fn close(&self) {
        if let Some(task) = self.dispatch_task.lock().unwrap().take() {
            task.abort();
        }
        if let Err(e) = self.peripheral.disconnect().await {
            debug!("Disconnect failed: {e}");
        }
    }
}

async fn default_adapter() -> Result<Adapter, AvssError> {
    let manager = Manager::new().await?;
    manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| AvssError::Protocol("no Bluetooth adapter found".into()))
}

async fn find_peripheral(
    adapter: &Adapter,
    address: &BluetoothAddrLE,
) -> Result<Peripheral, AvssError> {
    let target = btleplug::api::BDAddr::from(address.address);

    adapter
        .start_scan(ScanFilter {
            services: vec![uuids::SERVICE],
        })
        .await?;

    let deadline = tokio::time::Instant::now() + SCAN_TIMEOUT;
    let found = 'scan: loop {
        for peripheral in adapter.peripherals().await? {
            if let Some(props) = peripheral.properties().await? {
                if props.address == target {
                    break 'scan Some(peripheral);
                }
            }
        }
        if tokio::time::Instant::now() >= deadline {
            break None;
        }
        sleep(SCAN_POLL_INTERVAL).await;
    };

    adapter.stop_scan().await?;
    found.ok_or_else(|| AvssError::Protocol(format!("node {address} not found")))
}

/// Scan for advertising AVSS nodes, invoking the callback for every newly
/// discovered node. Runs until the caller drops the future.
pub async fn scan_nodes(
    mut on_found: impl FnMut(String, Option<String>),
) -> Result<(), AvssError> {
    let adapter = default_adapter().await?;
    let mut events = adapter.events().await?;

    adapter
        .start_scan(ScanFilter {
            services: vec![uuids::SERVICE],
        })
        .await?;

    while let Some(event) = events.next().await {
        if let CentralEvent::DeviceDiscovered(id) = event {
            let Ok(peripheral) = adapter.peripheral(&id).await else {
                continue;
            };
            if let Ok(Some(props)) = peripheral.properties().await {
                on_found(props.address.to_string(), props.local_name);
            }
        }
    }

    Ok(())
}
