//! Trust-on-first-use certificate pinning for VeilLink.
//!
//! Every network call the connection core makes rides TLS to a gateway
//! whose certificate is pinned on first contact. This crate provides the
//! persistent pin store, the validation engine that classifies observed
//! pins, the coordinator that parks a blocked handshake thread until the
//! user decides, and a `rustls` verifier wiring it all into a TLS client
//! configuration.

pub mod coordinator;
pub mod engine;
pub mod error;
pub mod pin;
pub mod store;
pub mod verifier;

pub use coordinator::{TrustDecisionCoordinator, TrustPrompt};
pub use engine::{TrustValidationEngine, ValidationResult};
pub use error::{TrustError, TrustStoreError};
pub use pin::CertificatePin;
pub use store::{CertificateTrustStore, TrustedServer};
pub use verifier::PinnedServerVerifier;

/// A user's answer to a trust prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustDecision {
    /// Trust the observed pin for a first-contact host.
    Trust(CertificatePin),
    /// Replace a stored pin that no longer matches.
    UpdateTrust(CertificatePin),
    /// Refuse the connection.
    Reject,
}
