//! Uniform backend adapter over the native VPN engines.
//!
//! The two engines are incompatible black boxes; each adapter maps its
//! engine onto the same `{start, stop, force_stop}` capability plus
//! three streams handed out at construction: state signals, traffic
//! samples, and endpoint info. The orchestrator selects an adapter by
//! the protocol tag of the fetched config.

pub mod openvpn;
pub mod wireguard;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::BackendError;
use crate::types::{EndpointInfo, TrafficSample, TunnelProtocol, TunnelSignal};

pub(crate) const STREAM_CAPACITY: usize = 64;

/// The receiving halves of a backend's streams.
pub struct BackendStreams {
    pub signals: mpsc::Receiver<TunnelSignal>,
    pub traffic: mpsc::Receiver<TrafficSample>,
    pub endpoints: mpsc::Receiver<EndpointInfo>,
}

pub(crate) struct StreamSenders {
    pub signals: mpsc::Sender<TunnelSignal>,
    pub traffic: mpsc::Sender<TrafficSample>,
    pub endpoints: mpsc::Sender<EndpointInfo>,
}

pub(crate) fn stream_pair() -> (StreamSenders, BackendStreams) {
    let (signal_tx, signal_rx) = mpsc::channel(STREAM_CAPACITY);
    let (traffic_tx, traffic_rx) = mpsc::channel(STREAM_CAPACITY);
    let (endpoint_tx, endpoint_rx) = mpsc::channel(STREAM_CAPACITY);
    (
        StreamSenders {
            signals: signal_tx,
            traffic: traffic_tx,
            endpoints: endpoint_tx,
        },
        BackendStreams {
            signals: signal_rx,
            traffic: traffic_rx,
            endpoints: endpoint_rx,
        },
    )
}

/// Uniform capability over a native VPN engine.
#[async_trait]
pub trait VpnBackendAdapter: Send + Sync {
    fn protocol(&self) -> TunnelProtocol;

    /// Start a tunnel from raw config text. Returns once the engine has
    /// accepted the session; the Connected signal arrives on the state
    /// stream.
    async fn start(&self, config: &str) -> Result<(), BackendError>;

    /// Graceful teardown. Confirmation arrives as a Disconnected signal.
    async fn stop(&self) -> Result<(), BackendError>;

    /// Hard teardown, used by the disconnect escalation ladder and when
    /// discarding a superseded tunnel.
    async fn force_stop(&self) -> Result<(), BackendError>;
}
