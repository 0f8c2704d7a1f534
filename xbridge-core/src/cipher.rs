//! Symmetric cipher context: ChaCha20-Poly1305 under a session key/IV.
//!
//! Every ciphertext is `nonce (12) || sealed payload`. The nonce is random per
//! call; the IV is bound as associated data, so a payload only opens under the
//! same key and IV that sealed it.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 12;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Session (or per-file) key material.
#[derive(Clone, PartialEq, Eq)]
pub struct CipherContext {
    key: [u8; KEY_LEN],
    iv: [u8; IV_LEN],
}

impl std::fmt::Debug for CipherContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherContext").finish_non_exhaustive()
    }
}

impl CipherContext {
    /// Fresh random key and IV.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut key);
        OsRng.fill_bytes(&mut iv);
        Self { key, iv }
    }

    pub fn new(key: [u8; KEY_LEN], iv: [u8; IV_LEN]) -> Self {
        Self { key, iv }
    }

    /// Build from untrusted slices (peer-supplied key material).
    pub fn from_slices(key: &[u8], iv: &[u8]) -> Result<Self, CipherError> {
        let key: [u8; KEY_LEN] = key.try_into().map_err(|_| CipherError::KeyLength {
            expected: KEY_LEN,
            got: key.len(),
        })?;
        let iv: [u8; IV_LEN] = iv.try_into().map_err(|_| CipherError::KeyLength {
            expected: IV_LEN,
            got: iv.len(),
        })?;
        Ok(Self { key, iv })
    }

    pub fn key(&self) -> &[u8; KEY_LEN] {
        &self.key
    }

    pub fn iv(&self) -> &[u8; IV_LEN] {
        &self.iv
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let cipher = ChaCha20Poly1305::new_from_slice(&self.key).map_err(|_| CipherError::Key)?;
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let sealed = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &self.iv,
                },
            )
            .map_err(|_| CipherError::Encrypt)?;
        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        if ciphertext.len() < NONCE_LEN + TAG_LEN {
            return Err(CipherError::TooShort);
        }
        let cipher = ChaCha20Poly1305::new_from_slice(&self.key).map_err(|_| CipherError::Key)?;
        let (nonce, sealed) = ciphertext.split_at(NONCE_LEN);
        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: sealed,
                    aad: &self.iv,
                },
            )
            .map_err(|_| CipherError::Decrypt)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("invalid key")]
    Key,
    #[error("invalid key material length: expected {expected}, got {got}")]
    KeyLength { expected: usize, got: usize },
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("ciphertext too short")]
    TooShort,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let ctx = CipherContext::generate();
        let sealed = ctx.encrypt(b"hello xbridge").unwrap();
        assert_eq!(ctx.decrypt(&sealed).unwrap(), b"hello xbridge");
    }

    #[test]
    fn same_plaintext_different_ciphertext() {
        let ctx = CipherContext::generate();
        let a = ctx.encrypt(b"same").unwrap();
        let b = ctx.encrypt(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_ciphertext_rejected() {
        let ctx = CipherContext::generate();
        let mut sealed = ctx.encrypt(b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(ctx.decrypt(&sealed), Err(CipherError::Decrypt)));
    }

    #[test]
    fn iv_is_bound() {
        let ctx = CipherContext::generate();
        let other = CipherContext::new(*ctx.key(), [0xAA; IV_LEN]);
        let sealed = ctx.encrypt(b"payload").unwrap();
        assert!(other.decrypt(&sealed).is_err());
    }

    #[test]
    fn from_slices_checks_lengths() {
        assert!(CipherContext::from_slices(&[0u8; 31], &[0u8; 12]).is_err());
        assert!(CipherContext::from_slices(&[0u8; 32], &[0u8; 16]).is_err());
        let ctx = CipherContext::from_slices(&[1u8; 32], &[2u8; 12]).unwrap();
        assert_eq!(ctx.key(), &[1u8; 32]);
        assert_eq!(ctx.iv(), &[2u8; 12]);
    }

    #[test]
    fn short_input_rejected() {
        let ctx = CipherContext::generate();
        assert!(matches!(ctx.decrypt(&[0u8; 10]), Err(CipherError::TooShort)));
    }
}
