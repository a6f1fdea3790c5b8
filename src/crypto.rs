//! Password encryption adapter.
//!
//! Passwords are stored as opaque AES-256-GCM ciphertexts. The key and nonce
//! are generated once and persisted in the `encryption_keys` table; keeping
//! the nonce fixed makes encryption deterministic, so authentication is a
//! blob-equality lookup against the stored ciphertext. The rest of the
//! system never sees plaintext or key material.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid key material: expected {expected} bytes, got {got}")]
    InvalidKeyMaterial { expected: usize, got: usize },

    #[error("encryption failed")]
    EncryptionFailed,
}

/// AES-256-GCM cipher bound to the persisted key and nonce.
pub struct PasswordCipher {
    cipher: Aes256Gcm,
    nonce: [u8; NONCE_SIZE],
}

impl PasswordCipher {
    pub fn from_parts(key: &[u8], nonce: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyMaterial { expected: KEY_SIZE, got: key.len() });
        }
        if nonce.len() != NONCE_SIZE {
            return Err(CryptoError::InvalidKeyMaterial { expected: NONCE_SIZE, got: nonce.len() });
        }
        let mut fixed = [0u8; NONCE_SIZE];
        fixed.copy_from_slice(nonce);
        Ok(Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
            nonce: fixed,
        })
    }

    /// Generate a fresh `(key, nonce)` pair.
    pub fn generate_parts() -> (Vec<u8>, Vec<u8>) {
        let mut key = vec![0u8; KEY_SIZE];
        let mut nonce = vec![0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut key);
        OsRng.fill_bytes(&mut nonce);
        (key, nonce)
    }

    /// Encrypt a password into the opaque blob stored for the client.
    pub fn encrypt(&self, password: &str) -> Result<Vec<u8>, CryptoError> {
        self.cipher
            .encrypt(Nonce::from_slice(&self.nonce), password.as_bytes())
            .map_err(|_| CryptoError::EncryptionFailed)
    }
}
