//! `anura transceiver` — commands addressing a transceiver itself.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use tokio::signal;
use tokio::task::JoinSet;
use tokio::time::{sleep, Instant};
use tracing::info;

use anura_lib::transceiver::UsbTransport;
use anura_lib::{
    AvssClient, BluetoothAddrLE, Notification, TransceiverClient, DEFAULT_PORT,
};

#[derive(Args, Debug, Clone)]
pub struct HostOpts {
    /// Hostname, IP address or usb:<serial>.
    #[arg(long)]
    host: String,

    /// TCP port number.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,
}

#[derive(Subcommand, Debug)]
pub enum TransceiverCommand {
    /// List transceivers connected over USB.
    Browse,

    /// Set assigned nodes.
    SetAssignedNodes {
        #[command(flatten)]
        opts: HostOpts,

        /// Bluetooth addresses of the nodes to assign.
        addresses: Vec<String>,
    },

    /// Get assigned nodes.
    GetAssignedNodes {
        #[command(flatten)]
        opts: HostOpts,
    },

    /// Get connected nodes.
    GetConnectedNodes {
        #[command(flatten)]
        opts: HostOpts,
    },

    /// Measure concurrent AVSS throughput over all assigned nodes.
    AvssThroughput {
        #[command(flatten)]
        opts: HostOpts,

        /// Measure transfer speed for snippet reports instead of
        /// artificial test data.
        #[arg(long)]
        snippet_reports: bool,

        /// Duration of artificial test data in seconds.
        #[arg(long, default_value_t = 1)]
        duration: u64,
    },

    /// Get device info.
    GetDeviceInfo {
        #[command(flatten)]
        opts: HostOpts,
    },

    /// Get device status.
    GetDeviceStatus {
        #[command(flatten)]
        opts: HostOpts,
    },

    /// Get firmware info.
    GetFirmwareInfo {
        #[command(flatten)]
        opts: HostOpts,
    },

    /// Get Precision Time Protocol (PTP) status.
    GetPtpStatus {
        #[command(flatten)]
        opts: HostOpts,
    },

    /// Get current time from a transceiver.
    GetTime {
        #[command(flatten)]
        opts: HostOpts,
    },

    /// Set the time of a transceiver.
    ///
    /// Sends the specified time, or the current time if none is given. If
    /// the transceiver is acting as a PTP slave the command has no lasting
    /// result.
    SetTime {
        #[command(flatten)]
        opts: HostOpts,

        /// Time in seconds since the epoch.
        #[arg(long)]
        time: Option<i64>,
    },

    /// Reset a transceiver.
    Reset {
        #[command(flatten)]
        opts: HostOpts,
    },

    /// Upgrade transceiver firmware.
    Upgrade {
        #[command(flatten)]
        opts: HostOpts,

        /// Path to firmware image.
        #[arg(long)]
        file: Option<PathBuf>,

        /// Run only the confirm step.
        #[arg(long)]
        confirm_only: bool,
    },

    /// Scan for nodes using a transceiver.
    Scan {
        #[command(flatten)]
        opts: HostOpts,
    },
}

async fn with_client<F, Fut>(opts: &HostOpts, f: F) -> Result<()>
where
    F: FnOnce(Arc<TransceiverClient>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    info!("Connecting to {}:{}", opts.host, opts.port);
    let client = Arc::new(TransceiverClient::connect(&opts.host, opts.port).await?);
    info!("Connected");
    let result = f(client.clone()).await;
    client.close().await;
    result
}

pub async fn run(command: TransceiverCommand) -> Result<()> {
    match command {
        TransceiverCommand::Browse => browse().await,
        TransceiverCommand::SetAssignedNodes { opts, addresses } => {
            let mut nodes = Vec::new();
            for address in &addresses {
                match address.parse::<BluetoothAddrLE>() {
                    Ok(addr) => nodes.push(addr),
                    Err(_) => println!("Invalid node address {address}"),
                }
            }
            with_client(&opts, |client| async move {
                client.set_assigned_nodes(&nodes).await?;
                Ok(())
            })
            .await
        }
        TransceiverCommand::GetAssignedNodes { opts } => {
            with_client(&opts, |client| async move {
                for node in client.get_assigned_nodes().await?.nodes {
                    println!("{}", node.address);
                }
                Ok(())
            })
            .await
        }
        TransceiverCommand::GetConnectedNodes { opts } => {
            with_client(&opts, |client| async move {
                for node in client.get_connected_nodes().await?.nodes {
                    println!("{} RSSI: {}", node.address, node.rssi);
                }
                Ok(())
            })
            .await
        }
        TransceiverCommand::AvssThroughput {
            opts,
            snippet_reports,
            duration,
        } => {
            with_client(&opts, |client| async move {
                avss_throughput(client, snippet_reports, duration).await
            })
            .await
        }
        TransceiverCommand::GetDeviceInfo { opts } => {
            with_client(&opts, |client| async move {
                println!("{:#?}", client.get_device_info().await?);
                Ok(())
            })
            .await
        }
        TransceiverCommand::GetDeviceStatus { opts } => {
            with_client(&opts, |client| async move {
                println!("{:#?}", client.get_device_status().await?);
                Ok(())
            })
            .await
        }
        TransceiverCommand::GetFirmwareInfo { opts } => {
            with_client(&opts, |client| async move {
                println!("{:#?}", client.get_firmware_info().await?);
                Ok(())
            })
            .await
        }
        TransceiverCommand::GetPtpStatus { opts } => {
            with_client(&opts, |client| async move {
                println!("{:#?}", client.get_ptp_status().await?);
                Ok(())
            })
            .await
        }
        TransceiverCommand::GetTime { opts } => {
            with_client(&opts, |client| async move {
                println!("{}", client.get_time().await?.time);
                Ok(())
            })
            .await
        }
        TransceiverCommand::SetTime { opts, time } => {
            let time_ns = match time {
                Some(seconds) => seconds * 1_000_000_000,
                None => SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_nanos() as i64)
                    .unwrap_or_default(),
            };
            with_client(&opts, |client| async move {
                println!("Setting time to {time_ns} ns");
                client.set_time(time_ns).await?;
                Ok(())
            })
            .await
        }
        TransceiverCommand::Reset { opts } => {
            with_client(&opts, |client| async move {
                client.reboot().await?;
                println!("Resetting shortly.");
                Ok(())
            })
            .await
        }
        TransceiverCommand::Upgrade {
            opts,
            file,
            confirm_only,
        } => upgrade(&opts, file, confirm_only).await,
        TransceiverCommand::Scan { opts } => {
            with_client(&opts, |client| async move { scan(client).await }).await
        }
    }
}

async fn browse() -> Result<()> {
    for serial in UsbTransport::list_devices().await? {
        println!("usb:{serial}");
    }
    Ok(())
}

async fn avss_throughput(
    client: Arc<TransceiverClient>,
    snippet_reports: bool,
    duration: u64,
) -> Result<()> {
    let assigned = client.get_assigned_nodes().await?;
    if assigned.nodes.is_empty() {
        println!("No nodes are assigned to the transceiver. Assign nodes and try again.");
        return Ok(());
    }

    let mut sessions = JoinSet::new();
    for node in assigned.nodes {
        let client = client.clone();
        sessions.spawn(async move {
            if let Err(e) = node_throughput(client, node.address, snippet_reports, duration).await {
                println!("{}: {e:#}", node.address);
            }
        });
    }
    while sessions.join_next().await.is_some() {}
    Ok(())
}

async fn node_throughput(
    client: Arc<TransceiverClient>,
    address: BluetoothAddrLE,
    snippet_reports: bool,
    duration: u64,
) -> Result<()> {
    let node = AvssClient::connect_proxy(client, address);
    let mut reports = node.reports();

    if snippet_reports {
        println!("{address}: Requesting snippet reports...");
        node.report_snippets(None, true).await?;
    } else {
        println!("{address}: Starting {duration} s throughput test...");
        node.test_throughput((duration * 1000) as i64).await?;
    }

    loop {
        let test = reports.recv().await?;
        let Some(info) = test.transfer_info else {
            continue;
        };
        let throughput = if info.elapsed_time > 0.0 {
            format!("{:.2}", info.num_bytes as f64 / info.elapsed_time / 1000.0)
        } else {
            "??".to_string()
        };
        println!(
            "{address}: Received {} B over {} segments in {:.2} s ({throughput} kB/s)",
            info.num_bytes, info.num_segments, info.elapsed_time
        );

        if !snippet_reports {
            // Only one test report is generated per throughput test.
            node.disconnect().await;
            return Ok(());
        }
    }
}

async fn upgrade(opts: &HostOpts, file: Option<PathBuf>, confirm_only: bool) -> Result<()> {
    if !confirm_only && file.is_none() {
        bail!("At least one of options '--file' and '--confirm-only' must be given.");
    }

    if !confirm_only {
        let image = match &file {
            Some(path) => std::fs::read(path)
                .with_context(|| format!("cannot read firmware image {}", path.display()))?,
            None => Vec::new(),
        };
        let client = TransceiverClient::connect(&opts.host, opts.port).await?;
        client.dfu_prepare(image.len()).await?;
        client.dfu_write_image(&image).await?;
        client.dfu_apply(false).await?;
        client.close().await;

        println!("Waiting for transceiver to reboot with new firmware image...");
        // Give the device time to actually reboot and start swapping
        // images before we reconnect.
        sleep(Duration::from_secs(5)).await;
    }

    let deadline = Instant::now() + Duration::from_secs(55);
    while Instant::now() < deadline {
        match TransceiverClient::connect(&opts.host, opts.port).await {
            Ok(client) => {
                println!("Confirming new image");
                client.dfu_confirm().await?;
                client.close().await;
                return Ok(());
            }
            Err(e) => {
                info!("Transceiver not back yet: {e}");
                sleep(Duration::from_secs(1)).await;
            }
        }
    }
    bail!("Timed out");
}

async fn scan(client: Arc<TransceiverClient>) -> Result<()> {
    let mut notifications = client.notifications();
    client.scan_nodes().await?;

    let listen = async {
        loop {
            match notifications.recv().await {
                Ok(Notification::ScanNodesReceived(event)) => {
                    println!("Found {} RSSI: {} dBm", event.address, event.rssi);
                }
                Ok(_) => {}
                Err(e) => break Err(anyhow::Error::from(e)),
            }
        }
    };

    let result = tokio::select! {
        result = listen => result,
        _ = signal::ctrl_c() => Ok(()),
    };

    client.scan_nodes_stop().await?;
    result
}
