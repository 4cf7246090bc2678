//! AES-256-GCM cipher used to protect the trust store at rest.
//!
//! Nonces are a 4-byte random per-instance prefix followed by an 8-byte
//! big-endian counter, and are prepended to the ciphertext.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use rand::RngCore;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Key size for AES-256.
pub const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;

/// Errors from encryption or decryption.
#[derive(Debug, Error)]
pub enum CipherError {
    #[error("invalid key size: expected {KEY_SIZE} bytes, got {0}")]
    InvalidKeySize(usize),

    #[error("encryption failed")]
    Encrypt,

    #[error("ciphertext is too short to contain a nonce")]
    TooShort,

    #[error("decryption failed (wrong key or corrupted data)")]
    Decrypt,
}

pub struct AesGcmCipher {
    cipher: Aes256Gcm,
    nonce_prefix: [u8; 4],
    nonce_counter: AtomicU64,
}

impl fmt::Debug for AesGcmCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AesGcmCipher")
            .field("nonce_prefix", &self.nonce_prefix)
            .field("nonce_counter", &self.nonce_counter.load(Ordering::Relaxed))
            .finish()
    }
}

impl AesGcmCipher {
    pub fn new(key: &[u8]) -> Result<Self, CipherError> {
        if key.len() != KEY_SIZE {
            return Err(CipherError::InvalidKeySize(key.len()));
        }
        let key_array = Key::<Aes256Gcm>::from_slice(key);
        let cipher = Aes256Gcm::new(key_array);

        let mut nonce_prefix = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut nonce_prefix);

        Ok(Self {
            cipher,
            nonce_prefix,
            nonce_counter: AtomicU64::new(0),
        })
    }

    pub fn generate_key() -> [u8; KEY_SIZE] {
        let mut key = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        key
    }

    fn generate_nonce_bytes(&self) -> [u8; NONCE_SIZE] {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        let count = self.nonce_counter.fetch_add(1, Ordering::SeqCst);

        nonce_bytes[0..4].copy_from_slice(&self.nonce_prefix);
        nonce_bytes[4..12].copy_from_slice(&count.to_be_bytes());

        if count == u64::MAX {
            // Catastrophic for this instance; callers must re-key.
            tracing::error!("AES-GCM nonce counter wrapped, re-key required");
        }
        nonce_bytes
    }

    /// Encrypt, returning `nonce || ciphertext`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let nonce_bytes = self.generate_nonce_bytes();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CipherError::Encrypt)?;

        let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// Decrypt a `nonce || ciphertext` blob.
    pub fn decrypt(&self, ciphertext_with_nonce: &[u8]) -> Result<Vec<u8>, CipherError> {
        if ciphertext_with_nonce.len() < NONCE_SIZE {
            return Err(CipherError::TooShort);
        }

        let (nonce_bytes, ciphertext) = ciphertext_with_nonce.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CipherError::Decrypt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_round_trip() {
        let key = AesGcmCipher::generate_key();
        let cipher = AesGcmCipher::new(&key).unwrap();
        let plaintext = b"hostname records, nothing to see here";

        let encrypted = cipher.encrypt(plaintext).unwrap();
        let decrypted = cipher.decrypt(&encrypted).unwrap();

        assert_eq!(plaintext.to_vec(), decrypted);
    }

    #[test]
    fn decrypt_with_wrong_key_fails() {
        let cipher1 = AesGcmCipher::new(&AesGcmCipher::generate_key()).unwrap();
        let cipher2 = AesGcmCipher::new(&AesGcmCipher::generate_key()).unwrap();

        let encrypted = cipher1.encrypt(b"secret").unwrap();
        assert!(matches!(
            cipher2.decrypt(&encrypted),
            Err(CipherError::Decrypt)
        ));
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let key = AesGcmCipher::generate_key();
        let cipher = AesGcmCipher::new(&key).unwrap();

        let mut encrypted = cipher.encrypt(b"sensitive data").unwrap();
        encrypted[NONCE_SIZE + 1] ^= 0xff;

        assert!(cipher.decrypt(&encrypted).is_err());
    }

    #[test]
    fn invalid_key_size_is_rejected() {
        assert!(matches!(
            AesGcmCipher::new(&[0u8; 16]),
            Err(CipherError::InvalidKeySize(16))
        ));
    }

    #[test]
    fn too_short_ciphertext_is_rejected() {
        let key = AesGcmCipher::generate_key();
        let cipher = AesGcmCipher::new(&key).unwrap();
        assert!(matches!(
            cipher.decrypt(b"short"),
            Err(CipherError::TooShort)
        ));
    }

    #[test]
    fn nonces_are_unique_per_instance() {
        let key = AesGcmCipher::generate_key();
        let cipher = AesGcmCipher::new(&key).unwrap();

        let a = cipher.encrypt(b"one").unwrap();
        let b = cipher.encrypt(b"two").unwrap();

        assert_ne!(&a[0..NONCE_SIZE], &b[0..NONCE_SIZE]);
        // Same prefix, incremented counter
        assert_eq!(&a[0..4], &b[0..4]);
    }
}
