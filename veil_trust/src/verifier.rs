//! `rustls` integration for pin-gated handshakes.
//!
//! TOFU pinning deliberately replaces web-PKI chain validation for
//! gateway connections: no request proceeds on an unpinned server. The
//! verifier blocks its calling thread while a decision is pending, which
//! is the conservative default this client wants on network threads.

use std::sync::Arc;
use std::time::SystemTime;

use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ServerName};
use tracing::debug;

use crate::engine::TrustValidationEngine;
use crate::error::TrustError;
use crate::pin::CertificatePin;

/// Error message prefixes kept distinguishable from generic TLS
/// failures so callers can render a security-specific message.
pub const NOT_TRUSTED_PREFIX: &str = "veil-trust: certificate not trusted";
pub const PIN_MISMATCH_PREFIX: &str = "veil-trust: certificate pin mismatch";

/// A [`ServerCertVerifier`] that accepts exactly the certificates the
/// trust engine clears.
pub struct PinnedServerVerifier {
    engine: Arc<TrustValidationEngine>,
}

impl PinnedServerVerifier {
    pub fn new(engine: Arc<TrustValidationEngine>) -> Self {
        PinnedServerVerifier { engine }
    }

    /// A TLS client config routing all verification through this pin
    /// verifier.
    pub fn client_config(engine: Arc<TrustValidationEngine>) -> Arc<rustls::ClientConfig> {
        let mut config = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(rustls::RootCertStore::empty())
            .with_no_client_auth();
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(PinnedServerVerifier::new(engine)));
        Arc::new(config)
    }
}

fn server_name_to_host(name: &ServerName) -> Result<String, rustls::Error> {
    match name {
        ServerName::DnsName(dns) => Ok(dns.as_ref().to_string()),
        ServerName::IpAddress(ip) => Ok(ip.to_string()),
        _ => Err(rustls::Error::General(
            "unsupported server name type for pinning".to_string(),
        )),
    }
}

fn trust_error_to_tls(err: TrustError) -> rustls::Error {
    let message = match &err {
        TrustError::NotTrusted { .. } => format!("{}: {}", NOT_TRUSTED_PREFIX, err),
        TrustError::PinMismatch { .. } => format!("{}: {}", PIN_MISMATCH_PREFIX, err),
        other => format!("veil-trust: {}", other),
    };
    rustls::Error::General(message)
}

impl ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &Certificate,
        _intermediates: &[Certificate],
        server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let hostname = server_name_to_host(server_name)?;
        let pin = CertificatePin::from_certificate_der(&end_entity.0)
            .map_err(trust_error_to_tls)?;

        debug!(hostname = %hostname, pin = %pin, "Validating presented certificate pin");
        self.engine
            .verify(&hostname, &pin)
            .map_err(trust_error_to_tls)?;

        Ok(ServerCertVerified::assertion())
    }
}
