//! Certificate pin computation.
//!
//! A pin is the SHA-256 digest of the certificate's SubjectPublicKeyInfo
//! DER, rendered as `sha256/` followed by the standard-alphabet base64
//! digest. Pinning the public key rather than the whole certificate
//! survives reissues that keep the key pair.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x509_parser::prelude::FromDer;

use crate::error::TrustError;

const PIN_PREFIX: &str = "sha256/";

/// A server certificate pin, e.g. `sha256/47DEQpj8HBSa+/TImW+5JC…`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CertificatePin(String);

impl CertificatePin {
    /// Compute the pin of a DER-encoded X.509 certificate.
    pub fn from_certificate_der(der: &[u8]) -> Result<Self, TrustError> {
        let (_, cert) = x509_parser::certificate::X509Certificate::from_der(der)
            .map_err(|e| TrustError::BadCertificate(e.to_string()))?;
        let spki = cert.tbs_certificate.subject_pki.raw;
        Ok(Self::from_spki_der(spki))
    }

    /// Compute the pin of a raw SubjectPublicKeyInfo DER blob.
    pub fn from_spki_der(spki: &[u8]) -> Self {
        let digest = Sha256::digest(spki);
        CertificatePin(format!("{}{}", PIN_PREFIX, BASE64.encode(digest)))
    }

    /// Parse a stored pin string, validating the digest tag.
    pub fn parse(s: &str) -> Option<Self> {
        let encoded = s.strip_prefix(PIN_PREFIX)?;
        let digest = BASE64.decode(encoded).ok()?;
        if digest.len() != 32 {
            return None;
        }
        Some(CertificatePin(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CertificatePin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
