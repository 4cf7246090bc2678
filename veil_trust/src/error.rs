//! Error types for the trust subsystem.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use veil_common::crypto::CipherError;

/// Errors surfaced by trust validation.
///
/// `NotTrusted` and `PinMismatch` are deliberately distinct from any
/// generic TLS failure so callers can render a security-specific message.
#[derive(Debug, Error)]
pub enum TrustError {
    /// First contact with the host and the user rejected the pin.
    #[error("server certificate for {hostname} is not trusted")]
    NotTrusted { hostname: String },

    /// The stored pin no longer matches what the server presented.
    #[error("server certificate for {hostname} changed: pinned {stored}, presented {observed}")]
    PinMismatch {
        hostname: String,
        stored: String,
        observed: String,
    },

    /// The presented certificate could not be parsed for pinning.
    #[error("cannot compute certificate pin: {0}")]
    BadCertificate(String),

    /// Trust store failure during validation.
    #[error(transparent)]
    Store(#[from] TrustStoreError),
}

/// Errors from the persistent trust store.
#[derive(Debug, Error)]
pub enum TrustStoreError {
    #[error("I/O error on trust store {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The store file exists but cannot be decrypted or parsed. Never
    /// silently discarded; recovery is an explicit reset.
    #[error("trust store {path} is corrupt or encrypted with a different key")]
    Corrupt { path: PathBuf },

    #[error(transparent)]
    Cipher(#[from] CipherError),
}
