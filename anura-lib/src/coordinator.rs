//! Supervised sessions across a fleet of transceivers and nodes.
//!
//! Each configured transceiver gets a connection task that retries every
//! second, assigns its nodes and spawns one session task per node. Node
//! tasks probe the node with `get_version` until it answers, run the
//! handler hooks and restart on any failure. Cancelling the coordinator
//! cancels everything below it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{error, info};

use crate::addr::BluetoothAddrLE;
use crate::avss::models::ParsedReport;
use crate::error::AvssError;
use crate::transceiver::client::{TransceiverClient, DEFAULT_PORT};
use crate::transceiver::proxy::ProxyAvssClient;
use crate::AvssClient;

const RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct TransceiverConfig {
    pub host: String,
    pub port: u16,
}

impl TransceiverConfig {
    pub fn new(host: impl Into<String>) -> Self {
        TransceiverConfig {
            host: host.into(),
            port: DEFAULT_PORT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub address: BluetoothAddrLE,
    /// Id of the transceiver this node is reached through.
    pub transceiver: String,
}

#[derive(Debug, Clone, Default)]
pub struct CoordinatorConfig {
    pub transceivers: BTreeMap<String, TransceiverConfig>,
    pub nodes: BTreeMap<String, NodeConfig>,
}

/// Application hooks invoked by the coordinator. The futures must be `Send`
/// since node sessions run as spawned tasks.
pub trait SessionHandler: Send + Sync + 'static {
    fn on_transceiver_connect(
        &self,
        transceiver: &Arc<TransceiverClient>,
    ) -> impl Future<Output = ()> + Send;

    /// Called once a node session is open and the node answers requests.
    fn on_open(
        &self,
        node: &ProxyAvssClient,
        node_id: &str,
    ) -> impl Future<Output = Result<(), AvssError>> + Send;

    /// Called for every parsed report streamed from the node.
    fn on_report(
        &self,
        node: &ProxyAvssClient,
        report: ParsedReport,
        node_id: &str,
    ) -> impl Future<Output = Result<(), AvssError>> + Send;
}

pub struct Coordinator<H> {
    config: CoordinatorConfig,
    handler: Arc<H>,
}

impl<H: SessionHandler> Coordinator<H> {
    pub fn new(config: CoordinatorConfig, handler: H) -> Self {
        Coordinator {
            config,
            handler: Arc::new(handler),
        }
    }

    /// Run all transceiver supervisors until the future is dropped.
    pub async fn run(&self) {
        let mut supervisors = JoinSet::new();
        for (transceiver_id, transceiver_config) in &self.config.transceivers {
            let nodes: BTreeMap<String, NodeConfig> = self
                .config
                .nodes
                .iter()
                .filter(|(_, node)| node.transceiver == *transceiver_id)
                .map(|(id, node)| (id.clone(), node.clone()))
                .collect();
            supervisors.spawn(transceiver_task(
                transceiver_id.clone(),
                transceiver_config.clone(),
                nodes,
                self.handler.clone(),
            ));
        }
        while supervisors.join_next().await.is_some() {}
    }
}

async fn transceiver_task<H: SessionHandler>(
    transceiver_id: String,
    config: TransceiverConfig,
    nodes: BTreeMap<String, NodeConfig>,
    handler: Arc<H>,
) {
    loop {
        let transceiver = connect_with_retry(&config).await;
        info!("Connected to transceiver {transceiver_id}");

        handler.on_transceiver_connect(&transceiver).await;

        let addresses: Vec<BluetoothAddrLE> =
            nodes.values().map(|node| node.address).collect();
        if let Err(e) = transceiver.set_assigned_nodes(&addresses).await {
            error!("Error in transceiver task: {e}");
            transceiver.close().await;
            sleep(RETRY_DELAY).await;
            continue;
        }

        let mut sessions = JoinSet::new();
        for (node_id, node) in &nodes {
            sessions.spawn(node_task(
                transceiver.clone(),
                node_id.clone(),
                node.address,
                handler.clone(),
            ));
        }

        // Hold the sessions until the connection goes away, then tear them
        // all down and reconnect.
        let mut disconnected = transceiver.disconnected();
        let _ = disconnected.wait_for(|d| *d).await;
        error!("Lost connection to transceiver {transceiver_id}");
        sessions.abort_all();
        transceiver.close().await;
        sleep(RETRY_DELAY).await;
    }
}

async fn connect_with_retry(config: &TransceiverConfig) -> Arc<TransceiverClient> {
    loop {
        info!("Connecting to {}", config.host);
        match TransceiverClient::connect(&config.host, config.port).await {
            Ok(client) => return Arc::new(client),
            Err(e) => {
                info!("Could not connect to {}: {e}", config.host);
                sleep(RETRY_DELAY).await;
            }
        }
    }
}

async fn node_task<H: SessionHandler>(
    transceiver: Arc<TransceiverClient>,
    node_id: String,
    address: BluetoothAddrLE,
    handler: Arc<H>,
) {
    info!("Started task for node {node_id}");
    loop {
        if let Err(e) = run_node_session(&transceiver, &node_id, address, &handler).await {
            error!("Error in node task: {e}");
        }
        sleep(RETRY_DELAY).await;
    }
}

async fn run_node_session<H: SessionHandler>(
    transceiver: &Arc<TransceiverClient>,
    node_id: &str,
    address: BluetoothAddrLE,
    handler: &Arc<H>,
) -> Result<(), AvssError> {
    let node = AvssClient::connect_proxy(transceiver.clone(), address);

    info!("Waiting for node to become available");
    // Probe for node availability with periodic version requests.
    let version = loop {
        if node.is_disconnected() {
            return Err(AvssError::Disconnected);
        }
        match node.get_version().await {
            Ok(version) => break version,
            Err(_) => sleep(RETRY_DELAY).await,
        }
    };
    info!("Node is available: {} (build: {})", version.version, version.build_version);

    let mut reports = node.parsed_reports();
    handler.on_open(&node, node_id).await?;

    let result = loop {
        match reports.recv().await {
            Ok(report) => {
                if let Err(e) = handler.on_report(&node, report, node_id).await {
                    break Err(e);
                }
            }
            Err(e) => break Err(e),
        }
    };
    node.disconnect().await;
    result
}
