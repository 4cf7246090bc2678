//! Cross-thread handoff between a blocked TLS handshake and the UI.
//!
//! Validation runs synchronously on a network thread; the decision is
//! produced asynchronously elsewhere. The coordinator parks the network
//! thread on a per-hostname slot until `resolve` (or `dismiss`) delivers
//! a decision. Concurrent validations for the same undecided hostname
//! coalesce onto one slot: a single prompt is emitted and the decision
//! fans out to every waiter. Different hostnames never block each other.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::engine::ValidationResult;
use crate::TrustDecision;

/// What the UI needs to render a trust prompt.
#[derive(Debug, Clone)]
pub struct TrustPrompt {
    /// Normalized hostname awaiting a decision.
    pub hostname: String,
    /// Why the handshake halted: first contact or a changed pin.
    pub result: ValidationResult,
}

struct PendingSlot {
    decision: Mutex<Option<TrustDecision>>,
    decided: Condvar,
}

/// Owns the in-flight wait slots. Never persisted.
pub struct TrustDecisionCoordinator {
    pending: Mutex<HashMap<String, Arc<PendingSlot>>>,
    prompt_tx: mpsc::UnboundedSender<TrustPrompt>,
}

impl TrustDecisionCoordinator {
    /// Create a coordinator and the prompt stream the UI consumes.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TrustPrompt>) {
        let (prompt_tx, prompt_rx) = mpsc::unbounded_channel();
        (
            Arc::new(TrustDecisionCoordinator {
                pending: Mutex::new(HashMap::new()),
                prompt_tx,
            }),
            prompt_rx,
        )
    }

    /// Block the calling thread until a decision arrives for `hostname`.
    ///
    /// Must not be called from an async task: it parks the OS thread.
    /// The first waiter for a hostname emits the prompt; later waiters
    /// for the same undecided hostname attach to the existing slot.
    pub fn await_decision(&self, hostname: &str, result: ValidationResult) -> TrustDecision {
        let slot = {
            let mut pending = self.pending.lock().expect("pending map lock poisoned");
            match pending.get(hostname) {
                Some(slot) => {
                    debug!(hostname = %hostname, "Coalescing onto pending trust prompt");
                    Arc::clone(slot)
                }
                None => {
                    let slot = Arc::new(PendingSlot {
                        decision: Mutex::new(None),
                        decided: Condvar::new(),
                    });
                    pending.insert(hostname.to_string(), Arc::clone(&slot));
                    info!(hostname = %hostname, result = ?result, "Trust decision required");
                    if self
                        .prompt_tx
                        .send(TrustPrompt {
                            hostname: hostname.to_string(),
                            result,
                        })
                        .is_err()
                    {
                        // No UI is listening; resolve via the dismiss path
                        // so the network thread cannot hang.
                        warn!(hostname = %hostname, "No trust prompt consumer, rejecting");
                        pending.remove(hostname);
                        return TrustDecision::Reject;
                    }
                    slot
                }
            }
        };

        let mut decision = slot.decision.lock().expect("decision slot lock poisoned");
        while decision.is_none() {
            decision = slot
                .decided
                .wait(decision)
                .expect("decision slot lock poisoned");
        }
        decision.clone().expect("decision present after wakeup")
    }

    /// Deliver a decision for `hostname`, waking every coalesced waiter.
    ///
    /// Returns `false` when nothing was pending (a stale or duplicate
    /// delivery, which is a no-op).
    pub fn resolve(&self, hostname: &str, decision: TrustDecision) -> bool {
        let slot = {
            let mut pending = self.pending.lock().expect("pending map lock poisoned");
            pending.remove(hostname)
        };
        match slot {
            Some(slot) => {
                info!(hostname = %hostname, decision = ?decision, "Trust decision delivered");
                let mut guard = slot.decision.lock().expect("decision slot lock poisoned");
                *guard = Some(decision);
                slot.decided.notify_all();
                true
            }
            None => {
                debug!(hostname = %hostname, "Ignoring decision with no pending prompt");
                false
            }
        }
    }

    /// The mandatory dismiss path: a prompt closed without a decision
    /// resolves to [`TrustDecision::Reject`] so the blocked thread can
    /// never hang indefinitely.
    pub fn dismiss(&self, hostname: &str) -> bool {
        self.resolve(hostname, TrustDecision::Reject)
    }

    /// Hostnames currently awaiting a decision.
    pub fn pending_hostnames(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .pending
            .lock()
            .expect("pending map lock poisoned")
            .keys()
            .cloned()
            .collect();
        hosts.sort();
        hosts
    }
}
