//! Cryptographic primitives shared by VeilLink components.

mod aes_gcm;

pub use aes_gcm::{AesGcmCipher, CipherError, KEY_SIZE};
