//! OpenVPN-style backend adapter.
//!
//! The native engine keeps its own session lifecycle and reports it via
//! notifications; this adapter parses the text config into the engine's
//! profile, guards starts against the engine's asynchronous teardown,
//! and relays notifications onto the uniform streams.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use veil_common::config::OpenVpnConfig;

use crate::backend::{stream_pair, BackendStreams, VpnBackendAdapter};
use crate::error::{BackendError, EngineError};
use crate::types::{EndpointInfo, TrafficSample, TunnelProtocol, TunnelSignal};

/// Transport directive of an OpenVPN profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenVpnTransport {
    #[default]
    Udp,
    Tcp,
}

/// The engine's native profile, parsed from raw config text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenVpnProfile {
    pub remote_host: String,
    pub remote_port: u16,
    pub transport: OpenVpnTransport,
    pub device: String,
}

impl OpenVpnProfile {
    /// Parse the directives this client needs out of an `.ovpn` text.
    /// Unknown directives are the engine's business and are skipped;
    /// inline `<tag>…</tag>` blocks are passed over entirely.
    pub fn parse(text: &str) -> Result<Self, BackendError> {
        let mut remote: Option<(String, u16)> = None;
        let mut transport = OpenVpnTransport::default();
        let mut device = "tun".to_string();
        let mut default_port = 1194u16;
        let mut in_block: Option<String> = None;

        for raw_line in text.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(tag) = in_block.as_deref() {
                if line == format!("</{}>", tag) {
                    in_block = None;
                }
                continue;
            }
            if line.starts_with('<') && line.ends_with('>') && !line.starts_with("</") {
                in_block = Some(line[1..line.len() - 1].to_string());
                continue;
            }

            let mut parts = line.split_whitespace();
            let directive = parts.next().unwrap_or_default();
            match directive {
                "remote" => {
                    let host = parts
                        .next()
                        .ok_or_else(|| {
                            BackendError::ConfigParse("remote directive without host".to_string())
                        })?
                        .to_string();
                    let port = match parts.next() {
                        Some(p) => p.parse::<u16>().map_err(|_| {
                            BackendError::ConfigParse(format!("invalid remote port '{}'", p))
                        })?,
                        None => default_port,
                    };
                    if let Some(proto) = parts.next() {
                        transport = parse_transport(proto)?;
                    }
                    // First remote wins; engines treat the rest as fallbacks.
                    if remote.is_none() {
                        remote = Some((host, port));
                    }
                }
                "port" => {
                    let p = parts.next().ok_or_else(|| {
                        BackendError::ConfigParse("port directive without value".to_string())
                    })?;
                    default_port = p.parse::<u16>().map_err(|_| {
                        BackendError::ConfigParse(format!("invalid port '{}'", p))
                    })?;
                }
                "proto" => {
                    let p = parts.next().ok_or_else(|| {
                        BackendError::ConfigParse("proto directive without value".to_string())
                    })?;
                    transport = parse_transport(p)?;
                }
                "dev" => {
                    if let Some(d) = parts.next() {
                        device = d.to_string();
                    }
                }
                _ => {}
            }
        }

        let (remote_host, remote_port) = remote.ok_or_else(|| {
            BackendError::ConfigParse("config has no remote directive".to_string())
        })?;

        Ok(OpenVpnProfile {
            remote_host,
            remote_port,
            transport,
            device,
        })
    }

    pub fn remote_endpoint(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }
}

fn parse_transport(token: &str) -> Result<OpenVpnTransport, BackendError> {
    match token {
        "udp" | "udp4" | "udp6" => Ok(OpenVpnTransport::Udp),
        "tcp" | "tcp4" | "tcp6" | "tcp-client" => Ok(OpenVpnTransport::Tcp),
        other => Err(BackendError::ConfigParse(format!(
            "unknown proto '{}'",
            other
        ))),
    }
}

/// Notifications emitted by the native engine on its own thread.
#[derive(Debug, Clone)]
pub enum OpenVpnNotification {
    Connecting,
    Reconnecting,
    Connected {
        local_ip: Option<String>,
        remote_endpoint: Option<String>,
    },
    Bytes {
        bytes_in: u64,
        bytes_out: u64,
    },
    Disconnected,
    Error(String),
}

/// The opaque native engine behind this adapter.
#[async_trait]
pub trait OpenVpnEngine: Send + Sync {
    async fn start(&self, profile: &OpenVpnProfile) -> Result<(), EngineError>;
    async fn stop(&self) -> Result<(), EngineError>;
    async fn force_stop(&self) -> Result<(), EngineError>;
}

pub struct OpenVpnBackend {
    engine: Arc<dyn OpenVpnEngine>,
    settle_delay: Duration,
}

impl OpenVpnBackend {
    /// Wrap an engine and its notification stream. The relay task runs
    /// until the engine drops its notification sender.
    pub fn new(
        engine: Arc<dyn OpenVpnEngine>,
        notifications: mpsc::Receiver<OpenVpnNotification>,
        settings: &OpenVpnConfig,
    ) -> (Arc<Self>, BackendStreams) {
        let (senders, streams) = stream_pair();
        tokio::spawn(relay_notifications(notifications, senders));
        (
            Arc::new(OpenVpnBackend {
                engine,
                settle_delay: Duration::from_millis(settings.settle_delay_ms),
            }),
            streams,
        )
    }
}

async fn relay_notifications(
    mut notifications: mpsc::Receiver<OpenVpnNotification>,
    senders: crate::backend::StreamSenders,
) {
    while let Some(notification) = notifications.recv().await {
        let delivered = match notification {
            OpenVpnNotification::Connecting | OpenVpnNotification::Reconnecting => {
                senders.signals.send(TunnelSignal::Connecting).await.is_ok()
            }
            OpenVpnNotification::Connected {
                local_ip,
                remote_endpoint,
            } => {
                let _ = senders
                    .endpoints
                    .send(EndpointInfo {
                        local_ip,
                        remote_endpoint,
                    })
                    .await;
                senders.signals.send(TunnelSignal::Connected).await.is_ok()
            }
            OpenVpnNotification::Bytes {
                bytes_in,
                bytes_out,
            } => senders
                .traffic
                .send(TrafficSample {
                    bytes_in,
                    bytes_out,
                })
                .await
                .is_ok(),
            OpenVpnNotification::Disconnected => senders
                .signals
                .send(TunnelSignal::Disconnected)
                .await
                .is_ok(),
            OpenVpnNotification::Error(message) => senders
                .signals
                .send(TunnelSignal::Error(message))
                .await
                .is_ok(),
        };
        if !delivered {
            debug!("OpenVPN signal consumer gone, stopping relay");
            break;
        }
    }
}

#[async_trait]
impl VpnBackendAdapter for OpenVpnBackend {
    fn protocol(&self) -> TunnelProtocol {
        TunnelProtocol::OpenVpn
    }

    async fn start(&self, config: &str) -> Result<(), BackendError> {
        let profile = OpenVpnProfile::parse(config)?;
        info!(
            remote = %profile.remote_endpoint(),
            "Starting OpenVPN session"
        );

        // Teardown in the native engine is asynchronous; starting a new
        // session against a half-dead one corrupts it. Always force-stop
        // first and let the teardown settle.
        if let Err(e) = self.engine.force_stop().await {
            warn!(error = %e, "Pre-start force-stop failed");
        }
        tokio::time::sleep(self.settle_delay).await;

        self.engine
            .start(&profile)
            .await
            .map_err(BackendError::from_start)
    }

    async fn stop(&self) -> Result<(), BackendError> {
        self.engine
            .stop()
            .await
            .map_err(|e| BackendError::Engine(e.to_string()))
    }

    async fn force_stop(&self) -> Result<(), BackendError> {
        self.engine
            .force_stop()
            .await
            .map_err(|e| BackendError::Engine(e.to_string()))
    }
}
