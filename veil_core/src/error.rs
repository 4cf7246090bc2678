//! Error types for the connection core.

use thiserror::Error;

use crate::types::TunnelProtocol;

/// Errors produced by a native engine behind an adapter.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The platform tunnel service did not come up in time. Retryable
    /// for WireGuard starts.
    #[error("initialization timed out: {0}")]
    InitTimeout(String),

    /// The platform refused the operation.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Any other engine failure.
    #[error("{0}")]
    Failure(String),
}

/// Errors produced by a backend adapter.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The raw config text could not be parsed into an engine profile.
    #[error("config parse error: {0}")]
    ConfigParse(String),

    /// The platform refused to start the tunnel.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Engine start failed on an initialization timeout (retries
    /// exhausted, or a non-retrying backend).
    #[error("engine initialization timed out: {0}")]
    InitTimeout(String),

    /// Engine start failed for any other reason.
    #[error("engine start failed: {0}")]
    EngineStart(String),

    /// A stop/teardown/stats operation failed.
    #[error("engine error: {0}")]
    Engine(String),
}

impl BackendError {
    /// Map an engine start failure onto the adapter taxonomy.
    pub fn from_start(err: EngineError) -> Self {
        match err {
            EngineError::InitTimeout(msg) => BackendError::InitTimeout(msg),
            EngineError::PermissionDenied(msg) => BackendError::PermissionDenied(msg),
            EngineError::Failure(msg) => BackendError::EngineStart(msg),
        }
    }
}

/// Orchestrator-level failures; these become `MacroState::Error`
/// messages.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Resolving the target's config failed; no backend was invoked.
    #[error("failed to fetch gateway config: {0}")]
    ConfigFetch(String),

    /// The user declined the platform VPN consent dialog.
    #[error("VPN permission denied")]
    PermissionDenied,

    /// The fetched config names a protocol with no registered backend.
    #[error("no backend registered for protocol {0}")]
    UnsupportedProtocol(TunnelProtocol),

    #[error(transparent)]
    Backend(#[from] BackendError),

    /// The disconnect escalation ladder was exhausted without an engine
    /// confirmation. Terminal: the tunnel state is unknown.
    #[error("disconnect was not confirmed by the VPN engine")]
    DisconnectTimeout,
}
