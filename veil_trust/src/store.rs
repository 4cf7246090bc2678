//! Persistent hostname → pin mapping.
//!
//! Records live in a single AES-256-GCM-encrypted JSON file. The store
//! never deletes a record on its own; removal is an explicit operation.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use veil_common::crypto::{AesGcmCipher, CipherError};
use veil_common::time::epoch_millis;

use crate::error::TrustStoreError;
use crate::pin::CertificatePin;

/// A pinned server record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedServer {
    /// Normalized (lowercase) hostname.
    pub hostname: String,
    /// Pinned public-key digest, `sha256/` + base64.
    pub pin: CertificatePin,
    /// When the host was first pinned, epoch millis.
    pub first_seen_at: u64,
    /// When the pin last matched a live handshake, epoch millis.
    pub last_verified_at: u64,
}

/// Encrypted persistent store of [`TrustedServer`] records.
///
/// All operations are synchronous: validation runs on a blocked TLS
/// thread and the file is small.
pub struct CertificateTrustStore {
    path: PathBuf,
    cipher: AesGcmCipher,
    entries: Mutex<HashMap<String, TrustedServer>>,
}

impl CertificateTrustStore {
    /// Open a store, reading and decrypting the backing file if present.
    ///
    /// A file that cannot be decrypted or parsed is reported as
    /// [`TrustStoreError::Corrupt`], never discarded.
    pub fn open(path: impl Into<PathBuf>, key: &[u8]) -> Result<Self, TrustStoreError> {
        let path = path.into();
        let cipher = AesGcmCipher::new(key)?;

        let entries = if path.exists() {
            let blob = fs::read(&path).map_err(|source| TrustStoreError::Io {
                path: path.clone(),
                source,
            })?;
            let plaintext = cipher.decrypt(&blob).map_err(|e| match e {
                CipherError::Decrypt | CipherError::TooShort => TrustStoreError::Corrupt {
                    path: path.clone(),
                },
                other => TrustStoreError::Cipher(other),
            })?;
            let records: Vec<TrustedServer> =
                serde_json::from_slice(&plaintext).map_err(|_| TrustStoreError::Corrupt {
                    path: path.clone(),
                })?;
            info!(path = %path.display(), servers = records.len(), "Loaded trust store");
            records
                .into_iter()
                .map(|r| (r.hostname.clone(), r))
                .collect()
        } else {
            debug!(path = %path.display(), "Trust store file absent, starting empty");
            HashMap::new()
        };

        Ok(CertificateTrustStore {
            path,
            cipher,
            entries: Mutex::new(entries),
        })
    }

    /// Pin `hostname` to `pin`. On re-trust of a known host the
    /// `first_seen_at` stamp is preserved.
    pub fn trust_server(
        &self,
        hostname: &str,
        pin: &CertificatePin,
    ) -> Result<(), TrustStoreError> {
        let hostname = normalize_hostname(hostname);
        let now = epoch_millis();
        {
            let mut entries = self.entries.lock().expect("trust store lock poisoned");
            let first_seen_at = entries
                .get(&hostname)
                .map(|e| e.first_seen_at)
                .unwrap_or(now);
            entries.insert(
                hostname.clone(),
                TrustedServer {
                    hostname: hostname.clone(),
                    pin: pin.clone(),
                    first_seen_at,
                    last_verified_at: now,
                },
            );
        }
        info!(hostname = %hostname, "Pinned server certificate");
        self.persist()
    }

    /// The stored pin for `hostname`, if any.
    pub fn stored_pin(&self, hostname: &str) -> Option<CertificatePin> {
        let hostname = normalize_hostname(hostname);
        self.entries
            .lock()
            .expect("trust store lock poisoned")
            .get(&hostname)
            .map(|e| e.pin.clone())
    }

    /// Update `last_verified_at` after a successful pinned handshake.
    pub fn mark_verified(&self, hostname: &str) -> Result<(), TrustStoreError> {
        let hostname = normalize_hostname(hostname);
        let updated = {
            let mut entries = self.entries.lock().expect("trust store lock poisoned");
            match entries.get_mut(&hostname) {
                Some(entry) => {
                    entry.last_verified_at = epoch_millis();
                    true
                }
                None => false,
            }
        };
        if updated {
            self.persist()
        } else {
            Ok(())
        }
    }

    /// Remove the pin for `hostname`. Returns whether a record existed.
    pub fn remove_trust(&self, hostname: &str) -> Result<bool, TrustStoreError> {
        let hostname = normalize_hostname(hostname);
        let removed = self
            .entries
            .lock()
            .expect("trust store lock poisoned")
            .remove(&hostname)
            .is_some();
        if removed {
            info!(hostname = %hostname, "Removed pinned certificate");
            self.persist()?;
        }
        Ok(removed)
    }

    /// Snapshot of all records, sorted by hostname.
    pub fn entries(&self) -> Vec<TrustedServer> {
        let mut records: Vec<TrustedServer> = self
            .entries
            .lock()
            .expect("trust store lock poisoned")
            .values()
            .cloned()
            .collect();
        records.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        records
    }

    fn persist(&self) -> Result<(), TrustStoreError> {
        let records = self.entries();
        let plaintext = serde_json::to_vec(&records).expect("trust records serialize");
        let blob = self.cipher.encrypt(&plaintext)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| TrustStoreError::Io {
                    path: self.path.clone(),
                    source,
                })?;
            }
        }

        // Write-to-temp then rename so a crash never leaves a torn file.
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &blob).map_err(|source| TrustStoreError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &self.path).map_err(|source| {
            warn!(path = %self.path.display(), error = %source, "Trust store rename failed");
            TrustStoreError::Io {
                path: self.path.clone(),
                source,
            }
        })?;
        debug!(path = %self.path.display(), servers = records.len(), "Trust store persisted");
        Ok(())
    }
}

/// Hostnames are case-normalized before every lookup and store.
pub fn normalize_hostname(hostname: &str) -> String {
    hostname.trim().to_ascii_lowercase()
}
