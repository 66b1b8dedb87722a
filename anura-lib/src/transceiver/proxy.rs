//! AVSS sessions proxied through a transceiver.
//!
//! The control point and program channels become `avss_request` /
//! `avss_program_write` RPC calls; report segments and program NACKs
//! arrive as notifications filtered by node address.

use std::sync::{Arc, Mutex as StdMutex};

use bytes::Bytes;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::addr::BluetoothAddrLE;
use crate::avss::client::{AvssChannel, AvssClient};
use crate::error::AvssError;

use super::client::TransceiverClient;
use super::models::Notification;

/// An AVSS session carried over a transceiver RPC connection.
pub type ProxyAvssClient = AvssClient<ProxyChannel>;

pub struct ProxyChannel {
    transceiver: Arc<TransceiverClient>,
    address: BluetoothAddrLE,
    filter_task: StdMutex<Option<JoinHandle<()>>>,
}

impl AvssClient<ProxyChannel> {
    /// Open a proxied session to the node with the given address.
    pub fn connect_proxy(
        transceiver: Arc<TransceiverClient>,
        address: BluetoothAddrLE,
    ) -> ProxyAvssClient {
        let mut notifications = transceiver.notifications();

        let client = AvssClient::new(ProxyChannel {
            transceiver,
            address,
            filter_task: StdMutex::new(None),
        });

        let session = client.session();
        let task = tokio::spawn(async move {
            loop {
                match notifications.recv().await {
                    Ok(Notification::AvssReportNotified(event)) if event.address == address => {
                        session.handle_report_segment(&event.value);
                    }
                    Ok(Notification::AvssProgramNotified(event)) if event.address == address => {
                        session.handle_program_notify(&event.value);
                    }
                    Ok(Notification::NodeDisconnected(event)) if event.address == address => {
                        debug!("Node {address} disconnected");
                        break;
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
            session.set_disconnected();
        });
        client.channel().filter_task.lock().unwrap().replace(task);

        client
    }
}

impl AvssChannel for ProxyChannel {
    async fn request_raw(&self, frame: Bytes) -> Result<Bytes, AvssError> {
        let result = self
            .transceiver
            .avss_request(&self.address, &frame)
            .await?;
        // The RPC result wraps the single response frame in an array.
        match result.as_array() {
            Some([response]) => match response.as_bytes() {
                Some(bytes) => Ok(bytes.clone()),
                None => Err(AvssError::Protocol(
                    "avss_request response is not a byte string".into(),
                )),
            },
            _ => Err(AvssError::Protocol(
                "avss_request returned an unexpected result shape".into(),
            )),
        }
    }

    async fn program_write(&self, frame: Bytes) -> Result<(), AvssError> {
        self.transceiver
            .avss_program_write(&self.address, &frame)
            .await?;
        Ok(())
    }

    async fn close(&self) {
        if let Some(task) = self.filter_task.lock().unwrap().take() {
            task.abort();
        }
    }
}
