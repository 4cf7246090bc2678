//! Pin classification and the blocking validation path.
//!
//! `verify` runs synchronously inside a TLS handshake on a network
//! thread. It classifies the observed pin against the store, and when a
//! user decision is needed it parks the thread on the coordinator. It
//! must never run on the UI thread.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::coordinator::TrustDecisionCoordinator;
use crate::error::TrustError;
use crate::pin::CertificatePin;
use crate::store::{normalize_hostname, CertificateTrustStore};
use crate::TrustDecision;

/// Outcome of comparing a stored pin with an observed one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    /// No pin on record for this host.
    FirstUse,
    /// Stored pin matches the observed one.
    Trusted,
    /// Stored pin differs from the observed one.
    PinChanged {
        old: CertificatePin,
        new: CertificatePin,
    },
}

/// Pure classification of stored vs. observed pin.
pub fn classify(stored: Option<&CertificatePin>, observed: &CertificatePin) -> ValidationResult {
    match stored {
        None => ValidationResult::FirstUse,
        Some(stored) if stored == observed => ValidationResult::Trusted,
        Some(stored) => ValidationResult::PinChanged {
            old: stored.clone(),
            new: observed.clone(),
        },
    }
}

/// Gates TLS handshakes on the pin store and user decisions.
pub struct TrustValidationEngine {
    store: Arc<CertificateTrustStore>,
    coordinator: Arc<TrustDecisionCoordinator>,
    /// (hostname, pin) pairs granted this session. Recorded before the
    /// durable store write lands so concurrent handshakes for the same
    /// host pass without a second prompt. Never persisted.
    session_grants: Mutex<HashSet<(String, CertificatePin)>>,
}

impl TrustValidationEngine {
    pub fn new(
        store: Arc<CertificateTrustStore>,
        coordinator: Arc<TrustDecisionCoordinator>,
    ) -> Self {
        TrustValidationEngine {
            store,
            coordinator,
            session_grants: Mutex::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &Arc<CertificateTrustStore> {
        &self.store
    }

    /// Validate an observed pin for `hostname`, blocking for a user
    /// decision when the host is unknown or its pin changed.
    pub fn verify(&self, hostname: &str, observed: &CertificatePin) -> Result<(), TrustError> {
        let hostname = normalize_hostname(hostname);
        let stored = self.store.stored_pin(&hostname);
        let result = classify(stored.as_ref(), observed);

        match result {
            ValidationResult::Trusted => {
                debug!(hostname = %hostname, "Pinned certificate verified");
                self.store.mark_verified(&hostname)?;
                Ok(())
            }
            ValidationResult::FirstUse | ValidationResult::PinChanged { .. } => {
                if self.session_granted(&hostname, observed) {
                    debug!(hostname = %hostname, "Accepting via session grant");
                    return Ok(());
                }

                let decision = self.coordinator.await_decision(&hostname, result.clone());
                match decision {
                    TrustDecision::Trust(pin) | TrustDecision::UpdateTrust(pin) => {
                        // Session grant first: later handshakes must pass
                        // even before the durable write completes.
                        self.grant_session(&hostname, &pin);
                        self.store.trust_server(&hostname, &pin)?;
                        if pin == *observed {
                            info!(hostname = %hostname, "Handshake accepted after trust decision");
                            Ok(())
                        } else {
                            // The user approved a pin other than the one on
                            // the wire; the connection stays refused.
                            warn!(hostname = %hostname, "Approved pin does not match observed pin");
                            Err(self.rejection(&hostname, stored, observed))
                        }
                    }
                    TrustDecision::Reject => {
                        info!(hostname = %hostname, "Handshake rejected by trust decision");
                        Err(self.rejection(&hostname, stored, observed))
                    }
                }
            }
        }
    }

    fn rejection(
        &self,
        hostname: &str,
        stored: Option<CertificatePin>,
        observed: &CertificatePin,
    ) -> TrustError {
        match stored {
            None => TrustError::NotTrusted {
                hostname: hostname.to_string(),
            },
            Some(stored) => TrustError::PinMismatch {
                hostname: hostname.to_string(),
                stored: stored.to_string(),
                observed: observed.to_string(),
            },
        }
    }

    fn session_granted(&self, hostname: &str, pin: &CertificatePin) -> bool {
        self.session_grants
            .lock()
            .expect("session grants lock poisoned")
            .contains(&(hostname.to_string(), pin.clone()))
    }

    fn grant_session(&self, hostname: &str, pin: &CertificatePin) {
        self.session_grants
            .lock()
            .expect("session grants lock poisoned")
            .insert((hostname.to_string(), pin.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pin(label: &[u8]) -> CertificatePin {
        CertificatePin::from_spki_der(label)
    }

    #[test]
    fn classify_covers_all_three_outcomes() {
        let p1 = pin(b"one");
        let p2 = pin(b"two");

        assert_eq!(classify(None, &p1), ValidationResult::FirstUse);
        assert_eq!(classify(Some(&p1), &p1), ValidationResult::Trusted);
        assert_eq!(
            classify(Some(&p1), &p2),
            ValidationResult::PinChanged {
                old: p1.clone(),
                new: p2.clone()
            }
        );
    }
}
