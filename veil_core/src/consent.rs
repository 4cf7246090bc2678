//! Platform VPN consent seam.
//!
//! The platform exposes whether the system consent dialog must be shown
//! before a tunnel can start; the answer itself arrives asynchronously
//! through [`crate::orchestrator::ConnectionOrchestrator::consent_result`].

use std::sync::atomic::{AtomicBool, Ordering};

/// Whether the platform requires its consent dialog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentStatus {
    /// Consent was already granted; tunnels may start.
    Granted,
    /// The caller must show the system dialog and report back.
    Required,
}

pub trait ConsentGate: Send + Sync {
    fn status(&self) -> ConsentStatus;
}

/// Consent permanently granted (desktop builds, tests).
pub struct AlwaysGranted;

impl ConsentGate for AlwaysGranted {
    fn status(&self) -> ConsentStatus {
        ConsentStatus::Granted
    }
}

/// A settable gate mirroring the platform's consent flag.
pub struct SharedConsentFlag {
    granted: AtomicBool,
}

impl SharedConsentFlag {
    pub fn new(granted: bool) -> Self {
        SharedConsentFlag {
            granted: AtomicBool::new(granted),
        }
    }

    pub fn set_granted(&self, granted: bool) {
        self.granted.store(granted, Ordering::SeqCst);
    }
}

impl ConsentGate for SharedConsentFlag {
    fn status(&self) -> ConsentStatus {
        if self.granted.load(Ordering::SeqCst) {
            ConsentStatus::Granted
        } else {
            ConsentStatus::Required
        }
    }
}
