//! XChaCha20-Poly1305 sealing of envelope bodies for buyer-only delivery.

use crate::error::{ProtocolError, Result};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;

/// 256-bit key shared between seller and buyer.
pub type SealKey = [u8; 32];

pub const NONCE_LEN: usize = 24;

pub fn generate_key() -> SealKey {
    let mut key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

pub fn seal(key: &SealKey, nonce: &[u8; NONCE_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(key.into());
    cipher
        .encrypt(XNonce::from_slice(nonce), plaintext)
        .map_err(|e| ProtocolError::Crypto(format!("sealing failed: {}", e)))
}

/// Fails when the key is wrong or the ciphertext was altered.
pub fn open(key: &SealKey, nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|e| ProtocolError::Crypto(format!("opening failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let key = generate_key();
        let nonce = generate_nonce();
        let body = b"w-matrix layer weights";

        let sealed = seal(&key, &nonce, body).unwrap();
        assert_ne!(sealed.as_slice(), body.as_slice());
        assert_eq!(open(&key, &nonce, &sealed).unwrap(), body);
    }

    #[test]
    fn test_wrong_key_fails() {
        let nonce = generate_nonce();
        let sealed = seal(&[1u8; 32], &nonce, b"payload").unwrap();
        let err = open(&[2u8; 32], &nonce, &sealed).unwrap_err();
        assert!(matches!(err, ProtocolError::Crypto(_)));
    }
}
