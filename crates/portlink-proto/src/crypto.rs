//! Envelope cipher
//!
//! AES-256-GCM with the key derived from the node's shared secret via
//! SHA-256. Ciphertext layout is `nonce (12 bytes) || ciphertext`, transported
//! as base64 inside [`crate::Envelope::data`].

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("ciphertext too short")]
    TooShort,
    #[error("invalid base64 payload: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("cipher failure")]
    Cipher,
}

/// Symmetric cipher bound to one node's secret.
pub struct EnvelopeCipher {
    cipher: Aes256Gcm,
}

impl EnvelopeCipher {
    pub fn new(secret: &str) -> Self {
        // the 32-byte digest is exactly the AES-256 key size
        let digest = Sha256::digest(secret.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(&digest);
        EnvelopeCipher {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// Encrypt a serialized frame, returning base64 of nonce || ciphertext.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::Cipher)?;

        let mut out = Vec::with_capacity(12 + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(out))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<Vec<u8>, CryptoError> {
        let blob = BASE64.decode(encoded.trim())?;
        if blob.len() < 12 {
            return Err(CryptoError::TooShort);
        }
        let (nonce_bytes, ciphertext) = blob.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CryptoError::Cipher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_with_matching_secret() {
        let cipher = EnvelopeCipher::new("node-secret");
        let encoded = cipher.encrypt(b"{\"type\":\"TcpPing\"}").unwrap();
        let plain = cipher.decrypt(&encoded).unwrap();
        assert_eq!(plain, b"{\"type\":\"TcpPing\"}");
    }

    #[test]
    fn wrong_secret_fails_decrypt() {
        let encoded = EnvelopeCipher::new("secret-a").encrypt(b"payload").unwrap();
        let err = EnvelopeCipher::new("secret-b").decrypt(&encoded);
        assert!(matches!(err, Err(CryptoError::Cipher)));
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let cipher = EnvelopeCipher::new("s");
        let err = cipher.decrypt(&BASE64.encode([0u8; 4]));
        assert!(matches!(err, Err(CryptoError::TooShort)));
    }
}
