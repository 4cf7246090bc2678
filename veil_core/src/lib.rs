//! Connection orchestration core for the VeilLink client.
//!
//! Unifies two incompatible VPN engines (OpenVPN-style and
//! WireGuard-style) behind a single observable connection state. The
//! [`orchestrator::ConnectionOrchestrator`] owns the macro state machine;
//! the [`backend`] module wraps each native engine in a uniform adapter.

pub mod backend;
pub mod consent;
pub mod error;
pub mod gateway;
pub mod orchestrator;
pub mod types;

pub use backend::{BackendStreams, VpnBackendAdapter};
pub use consent::{ConsentGate, ConsentStatus};
pub use error::{BackendError, ConnectError, EngineError};
pub use gateway::{ConfigFetchError, GatewayConfigService, GatewayProfile};
pub use orchestrator::{BackendRegistration, ConnectionOrchestrator, OrchestratorSettings};
pub use types::{
    ActiveConnection, ConnectionState, EndpointInfo, MacroState, TargetKind, TrafficSample,
    TunnelProtocol, TunnelSignal,
};
