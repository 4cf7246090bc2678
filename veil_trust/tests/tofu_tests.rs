//! End-to-end TOFU flows: store, engine, and coordinator working
//! together the way a real handshake thread and UI would.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use veil_common::crypto::AesGcmCipher;
use veil_trust::{
    CertificatePin, CertificateTrustStore, TrustDecision, TrustDecisionCoordinator, TrustError,
    TrustValidationEngine, ValidationResult,
};

struct Harness {
    engine: Arc<TrustValidationEngine>,
    coordinator: Arc<TrustDecisionCoordinator>,
    prompts: tokio::sync::mpsc::UnboundedReceiver<veil_trust::TrustPrompt>,
    _dir: tempfile::TempDir,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let key = AesGcmCipher::generate_key();
    let store =
        Arc::new(CertificateTrustStore::open(dir.path().join("store.enc"), &key).unwrap());
    let (coordinator, prompts) = TrustDecisionCoordinator::new();
    let engine = Arc::new(TrustValidationEngine::new(store, Arc::clone(&coordinator)));
    Harness {
        engine,
        coordinator,
        prompts,
        _dir: dir,
    }
}

fn pin(label: &[u8]) -> CertificatePin {
    CertificatePin::from_spki_der(label)
}

/// The full pinning lifecycle: FirstUse, then Trusted after Trust(P1),
/// then PinChanged{P1,P2} when the server presents a different key.
#[test]
fn first_use_then_trusted_then_pin_changed() {
    let mut h = harness();
    let p1 = pin(b"key-one");
    let p2 = pin(b"key-two");

    // FirstUse: answer the prompt with Trust(P1) from a "UI" thread.
    let verify = {
        let engine = Arc::clone(&h.engine);
        let p1 = p1.clone();
        thread::spawn(move || engine.verify("gw-1.example.net", &p1))
    };
    let prompt = h.prompts.blocking_recv().unwrap();
    assert_eq!(prompt.hostname, "gw-1.example.net");
    assert_eq!(prompt.result, ValidationResult::FirstUse);
    h.coordinator
        .resolve("gw-1.example.net", TrustDecision::Trust(p1.clone()));
    verify.join().unwrap().unwrap();

    // Trusted: no prompt, immediate pass.
    h.engine.verify("gw-1.example.net", &p1).unwrap();
    assert!(h.prompts.try_recv().is_err());

    // PinChanged exposes both pins.
    let verify = {
        let engine = Arc::clone(&h.engine);
        let p2 = p2.clone();
        thread::spawn(move || engine.verify("gw-1.example.net", &p2))
    };
    let prompt = h.prompts.blocking_recv().unwrap();
    assert_eq!(
        prompt.result,
        ValidationResult::PinChanged {
            old: p1.clone(),
            new: p2.clone()
        }
    );
    h.coordinator.dismiss("gw-1.example.net");
    match verify.join().unwrap() {
        Err(TrustError::PinMismatch {
            hostname,
            stored,
            observed,
        }) => {
            assert_eq!(hostname, "gw-1.example.net");
            assert_eq!(stored, p1.to_string());
            assert_eq!(observed, p2.to_string());
        }
        other => panic!("expected PinMismatch, got {:?}", other),
    }

    // The stored pin was not touched by the rejected change.
    assert_eq!(h.engine.store().stored_pin("gw-1.example.net"), Some(p1));
}

#[test]
fn trust_get_remove_round_trip() {
    let h = harness();
    let p = pin(b"round-trip");

    h.engine.store().trust_server("hub.example.net", &p).unwrap();
    assert_eq!(h.engine.store().stored_pin("hub.example.net"), Some(p));

    assert!(h.engine.store().remove_trust("hub.example.net").unwrap());
    assert_eq!(h.engine.store().stored_pin("hub.example.net"), None);
}

#[test]
fn update_trust_replaces_changed_pin() {
    let mut h = harness();
    let p1 = pin(b"old-key");
    let p2 = pin(b"new-key");
    h.engine.store().trust_server("gw.example.net", &p1).unwrap();

    let verify = {
        let engine = Arc::clone(&h.engine);
        let p2 = p2.clone();
        thread::spawn(move || engine.verify("gw.example.net", &p2))
    };
    let _ = h.prompts.blocking_recv().unwrap();
    h.coordinator
        .resolve("gw.example.net", TrustDecision::UpdateTrust(p2.clone()));

    verify.join().unwrap().unwrap();
    assert_eq!(h.engine.store().stored_pin("gw.example.net"), Some(p2));
}

/// One prompt for concurrent validations of the same hostname; the
/// decision fans out, and a session grant covers followers even before
/// they attach.
#[test]
fn concurrent_validations_share_one_prompt() {
    let mut h = harness();
    let p = pin(b"shared-key");

    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let engine = Arc::clone(&h.engine);
            let p = p.clone();
            thread::spawn(move || engine.verify("gw.example.net", &p))
        })
        .collect();

    let _prompt = h.prompts.blocking_recv().unwrap();
    thread::sleep(Duration::from_millis(50));
    h.coordinator
        .resolve("gw.example.net", TrustDecision::Trust(p.clone()));

    for waiter in waiters {
        waiter.join().unwrap().unwrap();
    }
    assert!(h.prompts.try_recv().is_err(), "second prompt was emitted");

    // A request arriving after the decision passes on the session grant
    // (and by now the durable pin as well), still without a prompt.
    h.engine.verify("gw.example.net", &p).unwrap();
    assert!(h.prompts.try_recv().is_err());
}

#[test]
fn rejected_first_use_yields_not_trusted() {
    let mut h = harness();
    let p = pin(b"unwanted");

    let verify = {
        let engine = Arc::clone(&h.engine);
        let p = p.clone();
        thread::spawn(move || engine.verify("Gw.Example.Net", &p))
    };
    // Hostname in the prompt is normalized.
    let prompt = h.prompts.blocking_recv().unwrap();
    assert_eq!(prompt.hostname, "gw.example.net");

    h.coordinator.resolve("gw.example.net", TrustDecision::Reject);
    match verify.join().unwrap() {
        Err(TrustError::NotTrusted { hostname }) => assert_eq!(hostname, "gw.example.net"),
        other => panic!("expected NotTrusted, got {:?}", other),
    }
    // Nothing was stored.
    assert_eq!(h.engine.store().stored_pin("gw.example.net"), None);
}
