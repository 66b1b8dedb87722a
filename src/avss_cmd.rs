//! `anura avss` — commands addressing a single AVSS node, either directly
//! over BLE or proxied through a transceiver.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Subcommand};
use tokio::signal;
use tokio::time::{sleep, timeout, Instant};
use tracing::info;

use anura_lib::avss::ble::{self, BleAvssClient};
use anura_lib::avss::client::AvssChannel;
use anura_lib::avss::SettingsMapper;
use anura_lib::{
    AvssClient, AvssError, BluetoothAddrLE, ControlPointError, ParsedReport, ProxyAvssClient,
    TransceiverClient, Value, DEFAULT_PORT,
};

use crate::session::SessionFile;

/// The node maintains two firmware slots; we always stage into slot 0.
const UPGRADE_IMAGE_INDEX: i64 = 0;

const DEACTIVATE_KEY: u32 = 0xFEED_F00D;

#[derive(Args, Debug, Clone)]
pub struct NodeOpts {
    /// Hostname, IP address or usb:<serial> of a transceiver. Without it
    /// the node is reached over the local Bluetooth adapter.
    #[arg(long)]
    transceiver: Option<String>,

    /// TCP port number.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    transceiver_port: u16,

    /// Bluetooth address of the AVSS node.
    #[arg(long)]
    address: String,
}

#[derive(Subcommand, Debug)]
pub enum AvssCommand {
    /// Scan for AVSS nodes using the computer's Bluetooth adapter.
    Scan,

    /// Upgrade node firmware.
    Upgrade {
        #[command(flatten)]
        opts: NodeOpts,

        /// Path to firmware image.
        #[arg(long)]
        file: Option<PathBuf>,

        /// Run only the confirm step.
        #[arg(long)]
        confirm_only: bool,
    },

    /// Get the node firmware version.
    GetVersion {
        #[command(flatten)]
        opts: NodeOpts,
    },

    /// Reset a node.
    Reset {
        #[command(flatten)]
        opts: NodeOpts,
    },

    /// Perform a throughput test.
    Throughput {
        #[command(flatten)]
        opts: NodeOpts,

        /// Test duration in seconds.
        #[arg(long, default_value_t = 1)]
        duration: u64,
    },

    /// Read settings.
    ReadSettings {
        #[command(flatten)]
        opts: NodeOpts,
    },

    /// Write settings.
    WriteSettings {
        #[command(flatten)]
        opts: NodeOpts,

        /// Path to settings file.
        #[arg(long)]
        file: Option<PathBuf>,

        /// Reset default values.
        #[arg(long)]
        reset_defaults: bool,
    },

    /// Deactivate (decommission) a node.
    Deactivate {
        #[command(flatten)]
        opts: NodeOpts,
    },

    /// Request and print a health report.
    HealthReport {
        #[command(flatten)]
        opts: NodeOpts,
    },

    /// Get firmware info.
    GetFirmwareInfo {
        #[command(flatten)]
        opts: NodeOpts,
    },

    /// Trigger a measurement.
    TriggerMeasurement {
        #[command(flatten)]
        opts: NodeOpts,

        /// Measurement duration in seconds.
        #[arg(long, default_value_t = 2)]
        duration: u64,
    },

    /// Configure, trigger and record a measurement in one go.
    QuickMeasurement {
        #[command(flatten)]
        opts: NodeOpts,

        #[arg(long, default_value_t = 4)]
        duration: u64,

        /// Path to output session file.
        #[arg(long)]
        output: PathBuf,

        /// Fetch capture reports.
        #[arg(long)]
        captures: bool,

        /// Fetch snippet reports.
        #[arg(long)]
        snippets: bool,

        /// Fetch aggregated values reports.
        #[arg(long)]
        aggregates: bool,
    },
}

/// A node session over either binding, torn down after use.
enum NodeSession {
    Ble(BleAvssClient),
    Proxy {
        client: ProxyAvssClient,
        transceiver: Arc<TransceiverClient>,
    },
}

impl NodeSession {
    async fn connect(opts: &NodeOpts) -> Result<Self> {
        let address = parse_address(&opts.address)?;
        match &opts.transceiver {
            None => {
                info!("Connecting to {address}");
                let client = AvssClient::connect_ble(&address).await?;
                info!("Connected");
                Ok(NodeSession::Ble(client))
            }
            Some(host) => {
                let transceiver =
                    connect_transceiver_for(host, opts.transceiver_port, &address).await?;
                let client = AvssClient::connect_proxy(transceiver.clone(), address);
                Ok(NodeSession::Proxy {
                    client,
                    transceiver,
                })
            }
        }
    }

    async fn teardown(self) {
        match self {
            NodeSession::Ble(client) => client.disconnect().await,
            NodeSession::Proxy {
                client,
                transceiver,
            } => {
                client.disconnect().await;
                transceiver.close().await;
            }
        }
    }
}

fn parse_address(address: &str) -> Result<BluetoothAddrLE> {
    address
        .parse()
        .map_err(|e: anura_lib::InvalidAddressError| anyhow!(e))
}

/// Connect to a transceiver and verify the node is assigned to it.
async fn connect_transceiver_for(
    host: &str,
    port: u16,
    address: &BluetoothAddrLE,
) -> Result<Arc<TransceiverClient>> {
    info!("Connect to transceiver {host}");
    let transceiver = Arc::new(TransceiverClient::connect(host, port).await?);
    let assigned = transceiver.get_assigned_nodes().await?;
    if !assigned.nodes.iter().any(|node| node.address == *address) {
        transceiver.close().await;
        bail!("Transceiver not assigned to node {address}");
    }
    Ok(transceiver)
}

macro_rules! with_node {
    ($opts:expr, |$client:ident| $body:expr) => {{
        let session = NodeSession::connect($opts).await?;
        let result = match &session {
            NodeSession::Ble($client) => $body.await,
            NodeSession::Proxy { client: $client, .. } => $body.await,
        };
        session.teardown().await;
        result
    }};
}

pub async fn run(command: AvssCommand) -> Result<()> {
    match command {
        AvssCommand::Scan => scan().await,
        AvssCommand::Upgrade {
            opts,
            file,
            confirm_only,
        } => upgrade(&opts, file, confirm_only).await,
        AvssCommand::GetVersion { opts } => {
            with_node!(&opts, |client| get_version(client))
        }
        AvssCommand::Reset { opts } => with_node!(&opts, |client| reset(client)),
        AvssCommand::Throughput { opts, duration } => {
            with_node!(&opts, |client| throughput(client, duration))
        }
        AvssCommand::ReadSettings { opts } => {
            with_node!(&opts, |client| read_settings(client))
        }
        AvssCommand::WriteSettings {
            opts,
            file,
            reset_defaults,
        } => {
            let settings = load_settings(file.as_deref())?;
            with_node!(&opts, |client| write_settings(
                client,
                settings.clone(),
                reset_defaults
            ))
        }
        AvssCommand::Deactivate { opts } => with_node!(&opts, |client| deactivate(client)),
        AvssCommand::HealthReport { opts } => {
            with_node!(&opts, |client| health_report(client))
        }
        AvssCommand::GetFirmwareInfo { opts } => {
            with_node!(&opts, |client| get_firmware_info(client))
        }
        AvssCommand::TriggerMeasurement { opts, duration } => {
            with_node!(&opts, |client| trigger_measurement(client, duration))
        }
        AvssCommand::QuickMeasurement {
            opts,
            duration,
            output,
            captures,
            snippets,
            aggregates,
        } => {
            with_node!(&opts, |client| quick_measurement(
                client,
                duration,
                &output,
                captures,
                snippets,
                aggregates
            ))
        }
    }
}

async fn scan() -> Result<()> {
    let mut seen = HashSet::new();
    let scan = ble::scan_nodes(move |address, name| {
        if seen.insert(address.clone()) {
            println!("{} {}", address, name.unwrap_or_default());
        }
    });

    tokio::select! {
        result = scan => result.map_err(Into::into),
        _ = signal::ctrl_c() => Ok(()),
    }
}

async fn upgrade(opts: &NodeOpts, file: Option<PathBuf>, confirm_only: bool) -> Result<()> {
    if !confirm_only && file.is_none() {
        bail!("At least one of options '--file' and '--confirm-only' must be given.");
    }

    let image = match &file {
        Some(path) => std::fs::read(path)
            .with_context(|| format!("cannot read firmware image {}", path.display()))?,
        None => Vec::new(),
    };

    let address = parse_address(&opts.address)?;
    match &opts.transceiver {
        None => upgrade_ble(&address, &image, confirm_only).await,
        Some(host) => {
            upgrade_proxy(host, opts.transceiver_port, &address, &image, confirm_only).await
        }
    }
}

async fn upgrade_ble(address: &BluetoothAddrLE, image: &[u8], confirm_only: bool) -> Result<()> {
    if !confirm_only {
        let client = AvssClient::connect_ble(address).await?;
        client
            .prepare_upgrade(UPGRADE_IMAGE_INDEX, image.len() as i64)
            .await?;
        client.program_transfer(image).await?;
        client.apply_upgrade().await?;
        client.disconnect().await;

        println!("Waiting for node to reboot with new firmware image...");
        // Give the node time to actually reboot and start swapping images
        // before we try to find it again.
        sleep(Duration::from_secs(5)).await;
    }

    let deadline = Instant::now() + Duration::from_secs(60);
    let client = loop {
        match AvssClient::connect_ble(address).await {
            Ok(client) => break client,
            Err(e) if Instant::now() < deadline => {
                info!("Node not back yet: {e}");
                sleep(Duration::from_secs(1)).await;
            }
            Err(e) => return Err(e.into()),
        }
    };

    println!("Confirming new image");
    client.confirm_upgrade(UPGRADE_IMAGE_INDEX).await?;
    client.disconnect().await;
    Ok(())
}

async fn upgrade_proxy(
    host: &str,
    port: u16,
    address: &BluetoothAddrLE,
    image: &[u8],
    confirm_only: bool,
) -> Result<()> {
    let transceiver = connect_transceiver_for(host, port, address).await?;

    if !confirm_only {
        let client = AvssClient::connect_proxy(transceiver.clone(), *address);
        client
            .prepare_upgrade(UPGRADE_IMAGE_INDEX, image.len() as i64)
            .await?;
        client.program_transfer(image).await?;
        client.apply_upgrade().await?;
        client.disconnect().await;

        println!("Waiting for node to reboot with new firmware image...");
        sleep(Duration::from_secs(30)).await;
    }

    let client = AvssClient::connect_proxy(transceiver.clone(), *address);
    let version = loop {
        if client.is_disconnected() {
            bail!("disconnected while waiting for the node to come back");
        }
        match client.get_version().await {
            Ok(version) => break version,
            Err(_) => sleep(Duration::from_secs(1)).await,
        }
    };
    println!("Version: {} (build: {})", version.version, version.build_version);

    println!("Confirming new image");
    client.confirm_upgrade(UPGRADE_IMAGE_INDEX).await?;
    client.disconnect().await;
    transceiver.close().await;
    Ok(())
}

async fn get_version<C: AvssChannel>(client: &AvssClient<C>) -> Result<()> {
    let resp = client.get_version().await?;
    println!("Version: {} (build: {})", resp.version, resp.build_version);
    Ok(())
}

async fn reset<C: AvssChannel>(client: &AvssClient<C>) -> Result<()> {
    client.reboot().await?;
    println!("Resetting shortly.");
    Ok(())
}

async fn throughput<C: AvssChannel>(client: &AvssClient<C>, duration: u64) -> Result<()> {
    // Raw reports carry the transfer statistics we want here.
    let mut reports = client.reports();

    println!("Starting {duration} s throughput test...");
    client.test_throughput((duration * 1000) as i64).await?;

    let test = reports.recv().await?;
    let info = test
        .transfer_info
        .ok_or_else(|| anyhow!("report without transfer info"))?;

    println!(
        "Received {} B over {} segments in {:.2} s",
        info.num_bytes, info.num_segments, info.elapsed_time
    );
    if info.elapsed_time > 0.0 {
        println!(
            "Throughput:   {:.2} kB/s",
            info.num_bytes as f64 / info.elapsed_time / 1000.0
        );
    }
    if info.num_segments > 0 {
        println!(
            "Segment size: {} B",
            info.num_bytes.div_ceil(info.num_segments as usize)
        );
    }
    Ok(())
}

async fn read_settings<C: AvssChannel>(client: &AvssClient<C>) -> Result<()> {
    let mut reports = client.parsed_reports();

    info!("Requesting settings report from device");
    client.report_settings(true, false).await?;

    info!("Waiting for settings report");
    loop {
        if let ParsedReport::Settings(report) = reports.recv().await? {
            let settings = report.settings.unwrap_or(Value::Null);
            println!("{}", serde_json::to_string(&SettingsMapper::to_readable(&settings))?);
            return Ok(());
        }
    }
}

fn load_settings(file: Option<&std::path::Path>) -> Result<Value> {
    let json: serde_json::Value = match file {
        Some(path) => serde_json::from_str(
            &std::fs::read_to_string(path)
                .with_context(|| format!("cannot read settings file {}", path.display()))?,
        )?,
        None => serde_json::Value::Object(serde_json::Map::new()),
    };
    let object = json
        .as_object()
        .ok_or_else(|| anyhow!("settings file must contain a JSON object"))?;
    Ok(SettingsMapper::from_readable(object)?)
}

async fn write_settings<C: AvssChannel>(
    client: &AvssClient<C>,
    settings: Value,
    reset_defaults: bool,
) -> Result<()> {
    match client
        .write_settings_v2(settings.clone(), reset_defaults, true)
        .await
    {
        Ok(resp) => {
            println!("{resp:?}");
            Ok(())
        }
        Err(AvssError::ControlPoint(ControlPointError::OpCodeUnsupported)) => {
            info!("Write Settings v2 opcode not supported, using fallback...");
            let resp = client.write_settings(settings).await?;
            println!("{resp:?}");
            let resp = client.apply_settings(true).await?;
            println!("{resp:?}");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn deactivate<C: AvssChannel>(client: &AvssClient<C>) -> Result<()> {
    client.deactivate(DEACTIVATE_KEY).await?;
    println!("Deactivating shortly.");
    Ok(())
}

async fn health_report<C: AvssChannel>(client: &AvssClient<C>) -> Result<()> {
    let mut reports = client.parsed_reports();
    client.report_health(Some(1)).await?;

    info!("Waiting for health report");
    loop {
        if let ParsedReport::Health(report) = reports.recv().await? {
            println!("Health report: {report:?}");
            return Ok(());
        }
    }
}

fn format_version(version: u32) -> String {
    format!(
        "v{}.{}.{}.{}",
        (version >> 24) & 0xFF,
        (version >> 16) & 0xFF,
        (version >> 8) & 0xFF,
        version & 0xFF
    )
}

async fn get_firmware_info<C: AvssChannel>(client: &AvssClient<C>) -> Result<()> {
    let info = client.get_firmware_info().await?;
    println!(
        "App version: {}, build: {}, status: {}",
        format_version(info.app_version),
        info.app_build_version,
        info.app_status
    );
    println!(
        "Net version: {}, build: {}",
        format_version(info.net_version),
        info.net_build_version
    );
    Ok(())
}

async fn trigger_measurement<C: AvssChannel>(client: &AvssClient<C>, duration: u64) -> Result<()> {
    client.trigger_measurement((duration * 1000) as i64).await?;
    println!("Measurement triggered.");
    Ok(())
}

async fn quick_measurement<C: AvssChannel>(
    client: &AvssClient<C>,
    duration: u64,
    output: &std::path::Path,
    captures: bool,
    snippets: bool,
    aggregates: bool,
) -> Result<()> {
    let duration_ms = (duration * 1000) as i64;

    let mut settings = serde_json::Map::new();
    let mut set = |key: &str, value: serde_json::Value| {
        settings.insert(key.to_string(), value);
    };
    set("base_sample_rate_hz", 1024i64.into());
    set("snippet_mode", 0i64.into());
    set("capture_mode", 0i64.into());
    set("aggregates_mode", 0i64.into());

    if captures {
        set("capture_mode", 1i64.into());
        set("capture_buffer_length", 1024i64.into());
        set("events_motion_start_enable", true.into());
        set("events_motion_start_capture", true.into());
        set("events_motion_start_capture_duration_ms", duration_ms.into());
    }
    if snippets {
        set("snippet_length", 1024i64.into());
        set("snippet_mode", 2i64.into());
    }
    if aggregates {
        set("aggregates_mode", 1i64.into());
        set("aggregates_sample_rate_hz", 512i64.into());
        set("aggregates_interval_ms", 1000i64.into());
        set("aggregates_fft_mode", 0i64.into());
        set("aggregates_fft_length", 512i64.into());
        set("aggregates_param_enable_0_31", 0xFFFF_FFFFu32.into());
        set("aggregates_param_enable_32_63", 0xFFFF_FFFFu32.into());
    }

    client
        .write_settings(SettingsMapper::from_readable(&settings)?)
        .await?;
    let resp = client.apply_settings(true).await?;
    if resp.will_reboot {
        println!("Rebooting node to apply settings, re-run command to start measurement");
        return Ok(());
    }

    let mut reports = client.reports();

    if captures {
        client.report_capture(None, false).await?;
    }
    if snippets {
        client.report_snippets(None, false).await?;
    }
    if aggregates {
        client.report_aggregates(None, false).await?;
    }

    client.trigger_measurement(duration_ms).await?;

    println!("Waiting for reports");
    let file = SessionFile::create(output)?;
    file.update_session_info(now_ns())?;

    let collect = async {
        loop {
            match reports.recv().await {
                Ok(report) => {
                    file.insert_avss_report(
                        now_ns(),
                        "NODE",
                        report.report_type,
                        &report.payload_cbor,
                    )?;
                    println!("Report Type {}", report.report_type);
                }
                Err(e) => break Err(anyhow::Error::from(e)),
            }
        }
    };

    let result: Result<()> = match timeout(Duration::from_secs(duration), collect).await {
        Ok(result) => result,
        Err(_) => Ok(()), // collection window over
    };
    result
}

fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}
