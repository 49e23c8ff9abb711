//! Authenticated encryption using XChaCha20-Poly1305
//!
//! The 24-byte nonce is safe to draw at random for every envelope, so no
//! per-peer nonce counters are kept.

use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    XChaCha20Poly1305, XNonce,
};
use thiserror::Error;

use super::keys::SessionKey;

/// Algorithm tag written into every envelope
pub const XCHACHA20_POLY1305: &str = "xchacha20-poly1305";

/// Nonce length for XChaCha20
pub const NONCE_LEN: usize = 24;

#[derive(Error, Debug)]
pub enum EncryptionError {
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed - data may be corrupted or key incorrect")]
    DecryptionFailed,
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("Invalid nonce length: {0}")]
    InvalidNonce(usize),
}

/// Encrypt `plaintext`, returning `(nonce, ciphertext || tag)`
pub fn seal(key: &SessionKey, plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>), EncryptionError> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| EncryptionError::EncryptionFailed)?;

    Ok((nonce.to_vec(), ciphertext))
}

/// Decrypt and authenticate a sealed payload
pub fn open(key: &SessionKey, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
    if nonce.len() != NONCE_LEN {
        return Err(EncryptionError::InvalidNonce(nonce.len()));
    }

    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| EncryptionError::DecryptionFailed)
}
