//! Type definitions for the connection core.

use std::fmt;

use serde::Serialize;

/// Tunnel protocol tag carried by a fetched gateway config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelProtocol {
    /// OpenVPN-style engine
    OpenVpn,
    /// WireGuard-style engine
    WireGuard,
}

impl fmt::Display for TunnelProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelProtocol::OpenVpn => write!(f, "openvpn"),
            TunnelProtocol::WireGuard => write!(f, "wireguard"),
        }
    }
}

/// What kind of server a target id names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    /// A gateway operated by the server
    Gateway,
    /// A mesh hub
    MeshHub,
}

/// The single orchestrator-level connection state exposed to callers,
/// reconciled from noisy backend-level signals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MacroState {
    /// No connection and none in progress
    Idle,
    /// The platform VPN consent dialog must be shown before the parked
    /// connect attempt can proceed
    PermissionRequired,
    /// A connect attempt is in flight
    Connecting { id: String, name: String },
    /// The tunnel is established
    Connected { id: String, name: String },
    /// A disconnect is awaiting engine confirmation
    Disconnecting,
    /// A terminal failure; cleared by the next connect or disconnect
    Error { message: String },
}

impl MacroState {
    pub fn is_idle(&self) -> bool {
        matches!(self, MacroState::Idle)
    }
}

/// Per-connection state, finer-grained than the macro state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Failed,
}

/// The connection record for the current target.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveConnection {
    pub id: String,
    pub name: String,
    pub kind: TargetKind,
    pub state: ConnectionState,
    /// Epoch millis when the backend confirmed the tunnel
    pub connected_at: Option<u64>,
    pub local_ip: Option<String>,
    pub remote_endpoint: Option<String>,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub protocol: Option<TunnelProtocol>,
}

impl ActiveConnection {
    pub fn new(id: String, name: String, kind: TargetKind) -> Self {
        ActiveConnection {
            id,
            name,
            kind,
            state: ConnectionState::Connecting,
            connected_at: None,
            local_ip: None,
            remote_endpoint: None,
            bytes_in: 0,
            bytes_out: 0,
            protocol: None,
        }
    }
}

/// Uniform state signal relayed from a backend engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelSignal {
    Connecting,
    Connected,
    Disconnected,
    Error(String),
}

/// Byte counters sampled from a live tunnel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficSample {
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// Addresses of a live tunnel, for display.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointInfo {
    pub local_ip: Option<String>,
    pub remote_endpoint: Option<String>,
}
