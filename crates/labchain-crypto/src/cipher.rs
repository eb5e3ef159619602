use crate::error::{CryptoError, Result};
use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use rand::RngCore;

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;

/// AES-256-GCM with a random nonce prepended to every ciphertext.
#[derive(Debug, Clone, Copy, Default)]
pub struct PayloadCipher;

impl PayloadCipher {
    pub fn new() -> Self {
        Self
    }

    pub fn generate_key() -> [u8; KEY_SIZE] {
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        key
    }

    fn cipher_for(key: &[u8]) -> Result<Aes256Gcm> {
        if key.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeySize {
                expected: KEY_SIZE,
                actual: key.len(),
            });
        }
        Ok(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)))
    }

    pub fn encrypt(&self, plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>> {
        let cipher = Self::cipher_for(key)?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    pub fn decrypt(&self, sealed: &[u8], key: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_SIZE {
            return Err(CryptoError::DecryptionFailed("Ciphertext too short".into()));
        }
        let cipher = Self::cipher_for(key)?;

        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
    }
}
