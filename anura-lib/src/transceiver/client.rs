//! Session-oriented CBOR-RPC client for transceivers.
//!
//! One background task receives and dispatches incoming messages (response
//! correlation by token, notification fan-out), another keeps the
//! connection alive with a periodic ping. Method names are translated to
//! server-assigned integer ids discovered during the connect handshake.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{broadcast, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::addr::BluetoothAddrLE;
use crate::cbor::{self, Value};
use crate::error::{RpcError, TransportError};
use crate::marshal::{Marshal, Unmarshal};

use super::models::{
    msg_type, AvssProgramWriteArgs, AvssRequestArgs, DfuApplyArgs, DfuPrepareArgs, DfuWriteArgs,
    GetAssignedNodesResult, GetConnectedNodesResult, GetDeviceInfoResult, GetDeviceStatusResult,
    GetFirmwareInfoResult, GetPtpStatusResult, GetTimeResult, Notification, SetAssignedNodesArgs,
    SetTimeArgs,
};
use super::models::AssignedNode;
use super::transport::{TargetSpec, Transport, TransportReader, TransportWriter};

/// Default TCP port of the transceiver RPC service.
pub const DEFAULT_PORT: u16 = 7645;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);
const NOTIFICATION_QUEUE_CAPACITY: usize = 256;

/// DFU image writes travel in chunks of this many bytes.
const DFU_CHUNK_SIZE: usize = 300;

/// ASCII "PERM", marking a permanent DFU apply.
const DFU_PERMANENT_MAGIC: u32 = 0x5045_524D;

struct PendingEntry {
    method: String,
    tx: oneshot::Sender<Result<Value, RpcError>>,
}

fn lowest_free_token(pending: &HashMap<u32, PendingEntry>) -> u32 {
    let mut token = 0;
    while pending.contains_key(&token) {
        token += 1;
    }
    token
}

struct Inner {
    writer: Mutex<TransportWriter>,
    pending: StdMutex<HashMap<u32, PendingEntry>>,
    methods: StdMutex<HashMap<String, i64>>,
    notify_tx: broadcast::Sender<Notification>,
    disconnected: watch::Sender<bool>,
}

impl Inner {
    /// Fail every outstanding request and resolve the disconnection future.
    fn shutdown(&self) {
        let entries: Vec<PendingEntry> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            let _ = entry.tx.send(Err(RpcError::Disconnected));
        }
        self.disconnected.send_replace(true);
    }

    async fn request(&self, method: &str, arg: Value) -> Result<Value, RpcError> {
        // Substitute the discovered integer id where we have one; the
        // server accepts either form.
        let method_id = match self.methods.lock().unwrap().get(method) {
            Some(id) => Value::Int(*id),
            None => Value::Text(method.to_string()),
        };

        let (token, rx) = {
            let mut pending = self.pending.lock().unwrap();
            let token = lowest_free_token(&pending);
            let (tx, rx) = oneshot::channel();
            pending.insert(
                token,
                PendingEntry {
                    method: method.to_string(),
                    tx,
                },
            );
            (token, rx)
        };
        let mut guard = TokenGuard {
            pending: &self.pending,
            token,
            armed: true,
        };

        let message = Value::Array(vec![
            Value::Int(msg_type::REQUEST),
            Value::Int(token as i64),
            method_id,
            arg,
        ]);
        let payload = cbor::to_vec(&message)?;
        self.writer.lock().await.send(&payload).await?;

        let result = rx.await.map_err(|_| RpcError::Disconnected);
        // The entry is gone by now either way; disarm so a reused token is
        // not torn down by our drop.
        guard.armed = false;
        result?
    }
}

/// Releases a request token when the requesting future is dropped before
/// its response arrives.
struct TokenGuard<'a> {
    pending: &'a StdMutex<HashMap<u32, PendingEntry>>,
    token: u32,
    armed: bool,
}

impl Drop for TokenGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.pending.lock().unwrap().remove(&self.token).is_some() {
            debug!("Request with token {} cancelled", self.token);
        }
    }
}

/// A connected transceiver RPC session.
pub struct TransceiverClient {
    inner: Arc<Inner>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl TransceiverClient {
    /// Connect to `target_spec` (`host`, `tcp:host` or `usb:serial`),
    /// start the receiver and keep-alive tasks and discover method ids.
    pub async fn connect(target_spec: &str, port: u16) -> Result<Self, RpcError> {
        let spec: TargetSpec = target_spec.parse().map_err(RpcError::Transport)?;
        debug!("Connecting to {target_spec}");
        let (reader, writer) = Transport::open(&spec, port).await?;
        debug!("Connected");

        let inner = Arc::new(Inner {
            writer: Mutex::new(writer),
            pending: StdMutex::new(HashMap::new()),
            methods: StdMutex::new(HashMap::new()),
            notify_tx: broadcast::channel(NOTIFICATION_QUEUE_CAPACITY).0,
            disconnected: watch::channel(false).0,
        });

        let recv_task = tokio::spawn(recv_loop(inner.clone(), reader));
        let ping_task = tokio::spawn(ping_loop(inner.clone()));

        let client = TransceiverClient {
            inner,
            tasks: StdMutex::new(vec![recv_task, ping_task]),
        };

        if let Err(e) = client.discover_methods().await {
            client.close().await;
            return Err(e);
        }

        Ok(client)
    }

    /// Cancel the background tasks and close the transport. Outstanding
    /// requests fail with [`RpcError::Disconnected`].
    pub async fn close(&self) {
        debug!("Closing connection");
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        self.inner.writer.lock().await.close().await;
        self.inner.shutdown();
    }

    /// A watch that flips to `true` once the connection is gone.
    pub fn disconnected(&self) -> watch::Receiver<bool> {
        self.inner.disconnected.subscribe()
    }

    pub fn is_disconnected(&self) -> bool {
        *self.inner.disconnected.borrow()
    }

    /// Subscribe to server-pushed notifications.
    ///
    /// The subscription holds a bounded queue; if the consumer falls
    /// behind, the oldest notifications are dropped (and logged).
    pub fn notifications(&self) -> NotificationStream {
        NotificationStream {
            rx: self.inner.notify_tx.subscribe(),
            disconnected: self.inner.disconnected.subscribe(),
        }
    }

    /// Send a request and await its result.
    pub async fn request(&self, method: &str, arg: Value) -> Result<Value, RpcError> {
        self.inner.request(method, arg).await
    }

    /// Send a request and unmarshal the result into a typed record.
    pub async fn request_as<T: Unmarshal>(&self, method: &str, arg: Value) -> Result<T, RpcError> {
        let result = self.request(method, arg).await?;
        Ok(T::unmarshal(&result)?)
    }

    /// Fetch the server's method-name table. Called automatically on
    /// connect.
    pub async fn discover_methods(&self) -> Result<(), RpcError> {
        let result = self.request(".well-known/methods", Value::Null).await?;
        let entries = result
            .as_map()
            .ok_or_else(|| RpcError::Protocol("method table is not a map".into()))?;

        let mut methods = HashMap::with_capacity(entries.len());
        for (name, id) in entries {
            if let (Some(name), Some(id)) = (name.as_str(), id.as_int()) {
                methods.insert(name.to_string(), id);
            }
        }
        debug!("Discovered {} methods", methods.len());
        *self.inner.methods.lock().unwrap() = methods;
        Ok(())
    }

    pub async fn ping(&self) -> Result<(), RpcError> {
        self.request("ping", Value::Null).await?;
        Ok(())
    }

    pub async fn slow_ping(&self) -> Result<(), RpcError> {
        self.request("slow_ping", Value::Null).await?;
        Ok(())
    }

    pub async fn reboot(&self) -> Result<(), RpcError> {
        self.request("reboot", Value::Null).await?;
        Ok(())
    }

    pub async fn set_assigned_nodes(&self, addrs: &[BluetoothAddrLE]) -> Result<(), RpcError> {
        let args = SetAssignedNodesArgs {
            nodes: addrs
                .iter()
                .map(|addr| AssignedNode { address: *addr })
                .collect(),
        };
        self.request("set_assigned_nodes", args.marshal()).await?;
        Ok(())
    }

    pub async fn get_assigned_nodes(&self) -> Result<GetAssignedNodesResult, RpcError> {
        self.request_as("get_assigned_nodes", Value::Null).await
    }

    pub async fn get_connected_nodes(&self) -> Result<GetConnectedNodesResult, RpcError> {
        self.request_as("get_connected_nodes", Value::Null).await
    }

    pub async fn get_device_info(&self) -> Result<GetDeviceInfoResult, RpcError> {
        self.request_as("get_device_info", Value::Null).await
    }

    pub async fn get_device_status(&self) -> Result<GetDeviceStatusResult, RpcError> {
        self.request_as("get_device_status", Value::Null).await
    }

    pub async fn get_firmware_info(&self) -> Result<GetFirmwareInfoResult, RpcError> {
        self.request_as("get_firmware_info", Value::Null).await
    }

    pub async fn get_ptp_status(&self) -> Result<GetPtpStatusResult, RpcError> {
        self.request_as("get_ptp_status", Value::Null).await
    }

    pub async fn get_time(&self) -> Result<GetTimeResult, RpcError> {
        self.request_as("get_time", Value::Null).await
    }

    pub async fn set_time(&self, time_ns: i64) -> Result<(), RpcError> {
        let args = SetTimeArgs { time: time_ns };
        self.request("set_time", args.marshal()).await?;
        Ok(())
    }

    pub async fn scan_nodes(&self) -> Result<(), RpcError> {
        self.request("scan_nodes", Value::Null).await?;
        Ok(())
    }

    pub async fn scan_nodes_stop(&self) -> Result<(), RpcError> {
        self.request("scan_nodes_stop", Value::Null).await?;
        Ok(())
    }

    pub async fn dfu_prepare(&self, size: usize) -> Result<(), RpcError> {
        let args = DfuPrepareArgs { size: size as i64 };
        self.request("dfu_prepare", args.marshal()).await?;
        Ok(())
    }

    pub async fn dfu_write(&self, offset: usize, data: &[u8]) -> Result<(), RpcError> {
        let args = DfuWriteArgs {
            offset: offset as i64,
            data: bytes::Bytes::copy_from_slice(data),
        };
        self.request("dfu_write", args.marshal()).await?;
        Ok(())
    }

    /// Write a whole firmware image in [`DFU_CHUNK_SIZE`]-byte pieces.
    pub async fn dfu_write_image(&self, image: &[u8]) -> Result<(), RpcError> {
        let mut offset = 0;
        for chunk in image.chunks(DFU_CHUNK_SIZE) {
            info!(
                "Writing image offset={} ({}%)",
                offset,
                offset * 100 / image.len().max(1)
            );
            self.dfu_write(offset, chunk).await?;
            offset += chunk.len();
        }
        Ok(())
    }

    pub async fn dfu_apply(&self, permanent: bool) -> Result<(), RpcError> {
        let args = DfuApplyArgs {
            permanent: if permanent { DFU_PERMANENT_MAGIC } else { 0 },
        };
        self.request("dfu_apply", args.marshal()).await?;
        Ok(())
    }

    pub async fn dfu_confirm(&self) -> Result<(), RpcError> {
        self.request("dfu_confirm", Value::Null).await?;
        Ok(())
    }

    /// Forward an AVSS control point request to a node behind this
    /// transceiver. The result is the response frame wrapped in an array.
    pub async fn avss_request(
        &self,
        addr: &BluetoothAddrLE,
        data: &[u8],
    ) -> Result<Value, RpcError> {
        let args = AvssRequestArgs {
            address: *addr,
            data: bytes::Bytes::copy_from_slice(data),
        };
        self.request("avss_request", args.marshal()).await
    }

    pub async fn avss_program_write(
        &self,
        addr: &BluetoothAddrLE,
        data: &[u8],
    ) -> Result<Value, RpcError> {
        let args = AvssProgramWriteArgs {
            address: *addr,
            data: bytes::Bytes::copy_from_slice(data),
        };
        self.request("avss_program_write", args.marshal()).await
    }

    /// Wait until the given node is assigned, connected and its services
    /// are discovered. Returns `None` if the node is not assigned to this
    /// transceiver at all.
    pub async fn find_avss_node_by_address(
        &self,
        addr: &BluetoothAddrLE,
    ) -> Result<Option<BluetoothAddrLE>, RpcError> {
        let mut notifications = self.notifications();

        let assigned = self.get_assigned_nodes().await?;
        if !assigned.nodes.iter().any(|node| node.address == *addr) {
            return Ok(None);
        }

        let connected = self.get_connected_nodes().await?;
        if connected.nodes.iter().any(|node| node.address == *addr) {
            return Ok(Some(*addr));
        }

        loop {
            match notifications.recv().await? {
                Notification::NodeServiceDiscovered(event) if event.address == *addr => {
                    return Ok(Some(*addr));
                }
                _ => {}
            }
        }
    }
}

impl Drop for TransceiverClient {
    fn drop(&mut self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

/// A notification subscription; dropped on scope exit.
pub struct NotificationStream {
    rx: broadcast::Receiver<Notification>,
    disconnected: watch::Receiver<bool>,
}

impl NotificationStream {
    pub async fn recv(&mut self) -> Result<Notification, RpcError> {
        loop {
            tokio::select! {
                biased;
                received = self.rx.recv() => match received {
                    Ok(notification) => return Ok(notification),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Notification queue overflow, {n} notifications dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Err(RpcError::Disconnected),
                },
                _ = self.disconnected.wait_for(|d| *d) => return Err(RpcError::Disconnected),
            }
        }
    }
}

async fn recv_loop(inner: Arc<Inner>, mut reader: TransportReader) {
    loop {
        let payload = match reader.read().await {
            Ok(payload) => payload,
            Err(TransportError::Eof) => {
                debug!("Connection closed by peer");
                break;
            }
            Err(e) => {
                error!("Transport failure: {e}");
                break;
            }
        };
        let message = match cbor::from_slice(&payload) {
            Ok(message) => message,
            Err(e) => {
                error!("Undecodable message: {e}");
                break;
            }
        };
        if let Err(e) = dispatch_message(&inner, message) {
            error!("{e}");
            break;
        }
    }
    inner.shutdown();
    debug!("Connection closed");
}

fn dispatch_message(inner: &Inner, message: Value) -> Result<(), RpcError> {
    let invalid = || RpcError::Protocol("invalid message received".into());
    let items = message.as_array().ok_or_else(invalid)?;

    match items {
        [Value::Int(msg_type::RESPONSE), Value::Int(token), err, result] => {
            let token = u32::try_from(*token).map_err(|_| invalid())?;
            let entry = inner.pending.lock().unwrap().remove(&token);
            match entry {
                None => warn!("Response to unknown or cancelled request received"),
                Some(entry) => {
                    let outcome = if err.is_null() {
                        Ok(result.clone())
                    } else {
                        Err(RpcError::Request {
                            method: entry.method.clone(),
                            error: err.clone(),
                        })
                    };
                    if entry.tx.send(outcome).is_err() {
                        warn!("Response to cancelled request received");
                    }
                }
            }
            Ok(())
        }
        [Value::Int(msg_type::NOTIFICATION), Value::Text(notification_type), argument] => {
            match Notification::parse(notification_type, argument) {
                // Nobody subscribed is fine.
                Ok(notification) => {
                    let _ = inner.notify_tx.send(notification);
                }
                Err(e) => warn!("Undecodable {notification_type:?} notification skipped: {e}"),
            }
            Ok(())
        }
        _ => Err(invalid()),
    }
}

/// Keep the connection alive; the server drops sessions that go quiet.
async fn ping_loop(inner: Arc<Inner>) {
    let mut disconnected = inner.disconnected.subscribe();
    loop {
        tokio::select! {
            _ = sleep(KEEPALIVE_INTERVAL) => {
                if let Err(e) = inner.request("ping", Value::Null).await {
                    debug!("Keep-alive ping failed: {e}");
                    break;
                }
            }
            _ = disconnected.changed() => {
                if *disconnected.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> PendingEntry {
        PendingEntry {
            method: "test".into(),
            tx: oneshot::channel().0,
        }
    }

    #[test]
    fn test_token_allocation_lowest_free() {
        let mut pending = HashMap::new();
        assert_eq!(lowest_free_token(&pending), 0);

        pending.insert(0, entry());
        pending.insert(1, entry());
        pending.insert(2, entry());
        assert_eq!(lowest_free_token(&pending), 3);

        pending.remove(&1);
        assert_eq!(lowest_free_token(&pending), 1);
    }
}
