//! Transceiver RPC client, transports and the proxied AVSS binding.

pub mod client;
pub mod models;
pub mod proxy;
pub mod transport;

pub use client::{NotificationStream, TransceiverClient, DEFAULT_PORT};
pub use models::Notification;
pub use proxy::{ProxyAvssClient, ProxyChannel};
pub use transport::{TargetSpec, Transport, UsbTransport};
