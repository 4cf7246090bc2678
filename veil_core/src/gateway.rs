//! Gateway config resolution seam.
//!
//! The directory/config-generation REST service lives outside this core;
//! the orchestrator only consumes this trait. Fetch errors surface
//! verbatim in the macro error state.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::TunnelProtocol;

/// A resolved connection profile for a target.
#[derive(Debug, Clone)]
pub struct GatewayProfile {
    /// Which backend the raw config is for.
    pub protocol: TunnelProtocol,
    /// Raw config text in the protocol's native format.
    pub config: String,
}

/// A failed config fetch, surfaced verbatim.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ConfigFetchError(pub String);

/// Resolves a target id to a connection profile.
#[async_trait]
pub trait GatewayConfigService: Send + Sync {
    /// Locally-known display name for a target, if any.
    fn display_name(&self, target_id: &str) -> Option<String>;

    /// Fetch the profile for a target.
    async fn resolve(&self, target_id: &str) -> Result<GatewayProfile, ConfigFetchError>;
}

/// A fixed in-memory directory, used by `veilctl` and tests.
#[derive(Default)]
pub struct StaticGatewayDirectory {
    targets: HashMap<String, (String, GatewayProfile)>,
}

impl StaticGatewayDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        target_id: impl Into<String>,
        name: impl Into<String>,
        profile: GatewayProfile,
    ) {
        self.targets
            .insert(target_id.into(), (name.into(), profile));
    }
}

#[async_trait]
impl GatewayConfigService for StaticGatewayDirectory {
    fn display_name(&self, target_id: &str) -> Option<String> {
        self.targets.get(target_id).map(|(name, _)| name.clone())
    }

    async fn resolve(&self, target_id: &str) -> Result<GatewayProfile, ConfigFetchError> {
        self.targets
            .get(target_id)
            .map(|(_, profile)| profile.clone())
            .ok_or_else(|| ConfigFetchError(format!("unknown target '{}'", target_id)))
    }
}
