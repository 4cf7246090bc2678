//! WireGuard-style backend adapter.
//!
//! The platform tunnel service can be slow to come up right after
//! consent is granted, so `start()` retries initialization-timeout
//! failures with a fixed backoff and a bounded attempt count, reparsing
//! the config each time. After every failed start and every stop the
//! engine handle is recreated so the next attempt begins from a clean
//! slate. Counters and endpoints are polled on a fixed interval while
//! connected; the poll task is aborted on disconnect.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use veil_common::config::WireGuardConfig;

use crate::backend::{stream_pair, BackendStreams, VpnBackendAdapter};
use crate::error::{BackendError, EngineError};
use crate::types::{EndpointInfo, TrafficSample, TunnelProtocol, TunnelSignal};

/// An INI-style wg-quick config, reduced to what this client reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WgQuickConfig {
    pub address: Option<String>,
    pub private_key: String,
    pub dns: Vec<String>,
    pub peer_public_key: String,
    pub endpoint: Option<String>,
    pub allowed_ips: Vec<String>,
    pub persistent_keepalive: Option<u16>,
}

impl WgQuickConfig {
    pub fn parse(text: &str) -> Result<Self, BackendError> {
        #[derive(PartialEq)]
        enum Section {
            None,
            Interface,
            Peer,
        }

        let mut section = Section::None;
        let mut address = None;
        let mut private_key = None;
        let mut dns = Vec::new();
        let mut peer_public_key = None;
        let mut endpoint = None;
        let mut allowed_ips = Vec::new();
        let mut persistent_keepalive = None;

        for (lineno, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if line.starts_with('[') {
                section = match line.to_ascii_lowercase().as_str() {
                    "[interface]" => Section::Interface,
                    "[peer]" => Section::Peer,
                    other => {
                        return Err(BackendError::ConfigParse(format!(
                            "unknown section {} on line {}",
                            other,
                            lineno + 1
                        )))
                    }
                };
                continue;
            }

            let (key, value) = line.split_once('=').ok_or_else(|| {
                BackendError::ConfigParse(format!("malformed line {} '{}'", lineno + 1, line))
            })?;
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim().to_string();

            match section {
                Section::Interface => match key.as_str() {
                    "address" => address = Some(value),
                    "privatekey" => private_key = Some(value),
                    "dns" => dns.extend(split_list(&value)),
                    _ => {}
                },
                Section::Peer => match key.as_str() {
                    "publickey" => peer_public_key = Some(value),
                    "endpoint" => endpoint = Some(value),
                    "allowedips" => allowed_ips.extend(split_list(&value)),
                    "persistentkeepalive" => {
                        persistent_keepalive = Some(value.parse::<u16>().map_err(|_| {
                            BackendError::ConfigParse(format!(
                                "invalid PersistentKeepalive '{}'",
                                value
                            ))
                        })?);
                    }
                    _ => {}
                },
                Section::None => {
                    return Err(BackendError::ConfigParse(format!(
                        "directive outside a section on line {}",
                        lineno + 1
                    )))
                }
            }
        }

        Ok(WgQuickConfig {
            address,
            private_key: private_key.ok_or_else(|| {
                BackendError::ConfigParse("missing [Interface] PrivateKey".to_string())
            })?,
            dns,
            peer_public_key: peer_public_key.ok_or_else(|| {
                BackendError::ConfigParse("missing [Peer] PublicKey".to_string())
            })?,
            endpoint,
            allowed_ips,
            persistent_keepalive,
        })
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Live counters and endpoints read from the engine.
#[derive(Debug, Clone, Default)]
pub struct WgRuntimeStats {
    pub traffic: TrafficSample,
    pub endpoint: EndpointInfo,
}

/// One engine handle. Handles are single-use on failure: the backend
/// discards and recreates them rather than reusing a handle that failed.
#[async_trait]
pub trait WgTunnel: Send + Sync {
    async fn up(&self, config: &WgQuickConfig) -> Result<(), EngineError>;
    async fn down(&self) -> Result<(), EngineError>;
    async fn stats(&self) -> Result<WgRuntimeStats, EngineError>;
}

/// Creates fresh engine handles.
pub trait WgTunnelFactory: Send + Sync {
    fn create(&self) -> Arc<dyn WgTunnel>;
}

pub struct WireGuardBackend {
    factory: Arc<dyn WgTunnelFactory>,
    tunnel: Mutex<Arc<dyn WgTunnel>>,
    poll_task: StdMutex<Option<JoinHandle<()>>>,
    signals: mpsc::Sender<TunnelSignal>,
    traffic: mpsc::Sender<TrafficSample>,
    endpoints: mpsc::Sender<EndpointInfo>,
    init_retries: u32,
    retry_backoff: Duration,
    stats_interval: Duration,
}

impl WireGuardBackend {
    pub fn new(
        factory: Arc<dyn WgTunnelFactory>,
        settings: &WireGuardConfig,
    ) -> (Arc<Self>, BackendStreams) {
        let (senders, streams) = stream_pair();
        let tunnel = factory.create();
        (
            Arc::new(WireGuardBackend {
                factory,
                tunnel: Mutex::new(tunnel),
                poll_task: StdMutex::new(None),
                signals: senders.signals,
                traffic: senders.traffic,
                endpoints: senders.endpoints,
                init_retries: settings.init_retries,
                retry_backoff: Duration::from_millis(settings.retry_backoff_ms),
                stats_interval: Duration::from_millis(settings.stats_interval_ms),
            }),
            streams,
        )
    }

    async fn reset_tunnel(&self) {
        let mut tunnel = self.tunnel.lock().await;
        *tunnel = self.factory.create();
        debug!("WireGuard engine handle recreated");
    }

    fn abort_poll_task(&self) {
        if let Some(task) = self
            .poll_task
            .lock()
            .expect("poll task lock poisoned")
            .take()
        {
            task.abort();
        }
    }

    fn spawn_poll_task(&self, tunnel: Arc<dyn WgTunnel>) {
        let traffic = self.traffic.clone();
        let endpoints = self.endpoints.clone();
        let interval = self.stats_interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match tunnel.stats().await {
                    Ok(stats) => {
                        if traffic.send(stats.traffic).await.is_err() {
                            break;
                        }
                        let _ = endpoints.send(stats.endpoint).await;
                    }
                    Err(e) => debug!(error = %e, "WireGuard stats poll failed"),
                }
            }
        });

        let previous = self
            .poll_task
            .lock()
            .expect("poll task lock poisoned")
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }
}

#[async_trait]
impl VpnBackendAdapter for WireGuardBackend {
    fn protocol(&self) -> TunnelProtocol {
        TunnelProtocol::WireGuard
    }

    async fn start(&self, config: &str) -> Result<(), BackendError> {
        let _ = self.signals.send(TunnelSignal::Connecting).await;

        let mut attempt: u32 = 0;
        loop {
            // Reparse each attempt: the raw text is the source of truth.
            let parsed = WgQuickConfig::parse(config)?;
            let tunnel = self.tunnel.lock().await.clone();

            match tunnel.up(&parsed).await {
                Ok(()) => {
                    info!(
                        endpoint = parsed.endpoint.as_deref().unwrap_or("-"),
                        attempt, "WireGuard tunnel up"
                    );
                    let _ = self
                        .endpoints
                        .send(EndpointInfo {
                            local_ip: parsed.address.clone(),
                            remote_endpoint: parsed.endpoint.clone(),
                        })
                        .await;
                    self.spawn_poll_task(tunnel);
                    let _ = self.signals.send(TunnelSignal::Connected).await;
                    return Ok(());
                }
                Err(EngineError::InitTimeout(message)) if attempt < self.init_retries => {
                    attempt += 1;
                    warn!(
                        attempt,
                        max_retries = self.init_retries,
                        error = %message,
                        "Tunnel service not ready, backing off"
                    );
                    self.reset_tunnel().await;
                    tokio::time::sleep(self.retry_backoff).await;
                }
                Err(e) => {
                    self.reset_tunnel().await;
                    return Err(BackendError::from_start(e));
                }
            }
        }
    }

    async fn stop(&self) -> Result<(), BackendError> {
        self.abort_poll_task();
        let tunnel = self.tunnel.lock().await.clone();
        let result = tunnel.down().await;
        self.reset_tunnel().await;
        match result {
            Ok(()) => {
                let _ = self.signals.send(TunnelSignal::Disconnected).await;
                Ok(())
            }
            Err(e) => Err(BackendError::Engine(e.to_string())),
        }
    }

    async fn force_stop(&self) -> Result<(), BackendError> {
        // WireGuard has no separate hard teardown; a force-stop is a
        // down that tolerates nothing keeping the handle alive.
        self.stop().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[Interface]
PrivateKey = aBcDeFg=
Address = 10.10.0.2/32
DNS = 10.10.0.1, 10.10.0.53

[Peer]
PublicKey = hIjKlMn=
AllowedIPs = 0.0.0.0/0, ::/0
Endpoint = hub-1.example.net:51820
PersistentKeepalive = 25
"#;

    #[test]
    fn parses_a_typical_config() {
        let config = WgQuickConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.address.as_deref(), Some("10.10.0.2/32"));
        assert_eq!(config.private_key, "aBcDeFg=");
        assert_eq!(config.dns, vec!["10.10.0.1", "10.10.0.53"]);
        assert_eq!(config.peer_public_key, "hIjKlMn=");
        assert_eq!(config.endpoint.as_deref(), Some("hub-1.example.net:51820"));
        assert_eq!(config.allowed_ips.len(), 2);
        assert_eq!(config.persistent_keepalive, Some(25));
    }

    #[test]
    fn keys_are_case_insensitive() {
        let text = "[interface]\nPRIVATEKEY = k=\n[peer]\npublickey = p=\n";
        let config = WgQuickConfig::parse(text).unwrap();
        assert_eq!(config.private_key, "k=");
        assert_eq!(config.peer_public_key, "p=");
    }

    #[test]
    fn missing_private_key_is_a_parse_error() {
        let text = "[Interface]\nAddress = 10.0.0.2/32\n[Peer]\nPublicKey = p=\n";
        assert!(matches!(
            WgQuickConfig::parse(text),
            Err(BackendError::ConfigParse(_))
        ));
    }

    #[test]
    fn missing_peer_public_key_is_a_parse_error() {
        let text = "[Interface]\nPrivateKey = k=\n";
        assert!(matches!(
            WgQuickConfig::parse(text),
            Err(BackendError::ConfigParse(_))
        ));
    }

    #[test]
    fn directive_outside_section_is_rejected() {
        assert!(matches!(
            WgQuickConfig::parse("PrivateKey = k=\n"),
            Err(BackendError::ConfigParse(_))
        ));
    }

    #[test]
    fn unknown_section_is_rejected() {
        assert!(matches!(
            WgQuickConfig::parse("[Tunnel]\nKey = v\n"),
            Err(BackendError::ConfigParse(_))
        ));
    }

    #[test]
    fn malformed_line_is_rejected() {
        assert!(matches!(
            WgQuickConfig::parse("[Interface]\nPrivateKey\n"),
            Err(BackendError::ConfigParse(_))
        ));
    }
}
