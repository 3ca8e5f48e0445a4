//! Authenticated encryption of single protocol frames.
//!
//! Every block exchanged after the handshake is sealed on its own with
//! AES-256-GCM under the connection's session key:
//!
//! ```text
//! [nonce (12B)][ciphertext (n bytes)][tag (16B)]
//! ```
//!
//! The nonce is drawn from the OS RNG for every call, so a (key, nonce) pair
//! is never reused within a session.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, Key, KeyInit};
use aes_gcm::Aes256Gcm;
use rand_core::{OsRng, RngCore};
use secrecy::{ExposeSecret, Secret};
use std::fmt;

/// AES-GCM nonce length
pub const NONCE_SIZE: usize = 12;
/// AES-GCM authentication tag length
pub const TAG_SIZE: usize = 16;
/// Bytes added to every plaintext block on the wire
pub const FRAME_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;
/// AES-256 key length
pub const SESSION_KEY_SIZE: usize = 32;

/// Errors produced while sealing or opening a frame.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Frame too short: {0} bytes, need at least {min}", min = FRAME_OVERHEAD)]
    FrameTooShort(usize),

    #[error("Frame authentication failed")]
    Authentication,

    #[error("Frame encryption failed")]
    Encryption,
}

/// Per-connection symmetric key, zeroized on drop.
pub struct SessionKey {
    inner: Secret<[u8; SESSION_KEY_SIZE]>,
}

impl SessionKey {
    /// Build a session key from unwrapped key material.
    ///
    /// Returns `None` unless `bytes` is exactly 32 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let key: [u8; SESSION_KEY_SIZE] = bytes.try_into().ok()?;
        Some(Self {
            inner: Secret::new(key),
        })
    }

    /// Generate a fresh random key (client side and tests).
    pub fn generate() -> Self {
        let mut key = [0u8; SESSION_KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Self {
            inner: Secret::new(key),
        }
    }

    /// Raw key bytes, for wrapping on the client side.
    pub fn expose(&self) -> &[u8; SESSION_KEY_SIZE] {
        self.inner.expose_secret()
    }

    fn cipher(&self) -> Aes256Gcm {
        let key = Key::<Aes256Gcm>::from_slice(self.inner.expose_secret());
        Aes256Gcm::new(key)
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionKey([REDACTED])")
    }
}

/// Seal one plaintext block into a `nonce || ciphertext || tag` blob.
pub fn encrypt_frame(plaintext: &[u8], key: &SessionKey) -> Result<Vec<u8>, CryptoError> {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);

    let sealed = key
        .cipher()
        .encrypt(GenericArray::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::Encryption)?;

    let mut blob = Vec::with_capacity(NONCE_SIZE + sealed.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&sealed);
    Ok(blob)
}

/// Open a blob produced by [`encrypt_frame`].
///
/// Tag verification happens before any plaintext is released; a tampered
/// blob yields `CryptoError::Authentication` and nothing else.
pub fn decrypt_frame(blob: &[u8], key: &SessionKey) -> Result<Vec<u8>, CryptoError> {
    if blob.len() < FRAME_OVERHEAD {
        return Err(CryptoError::FrameTooShort(blob.len()));
    }
    let (nonce, sealed) = blob.split_at(NONCE_SIZE);

    key.cipher()
        .decrypt(GenericArray::from_slice(nonce), sealed)
        .map_err(|_| CryptoError::Authentication)
}

/// Wire length of a frame carrying `plaintext_len` bytes.
pub const fn sealed_len(plaintext_len: usize) -> usize {
    plaintext_len + FRAME_OVERHEAD
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let key = SessionKey::generate();
        for plaintext in [&b""[..], b"x", b"{\"action\":1}", &[0xAB; 4096]] {
            let blob = encrypt_frame(plaintext, &key).unwrap();
            assert_eq!(blob.len(), sealed_len(plaintext.len()));
            assert_eq!(decrypt_frame(&blob, &key).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_nonce_is_fresh_per_call() {
        let key = SessionKey::generate();
        let a = encrypt_frame(b"same plaintext", &key).unwrap();
        let b = encrypt_frame(b"same plaintext", &key).unwrap();
        assert_ne!(a[..NONCE_SIZE], b[..NONCE_SIZE]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_bit_flip_is_rejected() {
        let key = SessionKey::generate();
        let blob = encrypt_frame(b"uploaded media bytes", &key).unwrap();

        // every byte after the nonce: ciphertext and tag
        for index in NONCE_SIZE..blob.len() {
            for bit in [0x01u8, 0x80] {
                let mut tampered = blob.clone();
                tampered[index] ^= bit;
                assert!(matches!(
                    decrypt_frame(&tampered, &key),
                    Err(CryptoError::Authentication)
                ));
            }
        }
    }

    #[test]
    fn test_wrong_key_is_rejected() {
        let blob = encrypt_frame(b"payload", &SessionKey::generate()).unwrap();
        assert!(matches!(
            decrypt_frame(&blob, &SessionKey::generate()),
            Err(CryptoError::Authentication)
        ));
    }

    #[test]
    fn test_short_blob() {
        let key = SessionKey::generate();
        assert!(matches!(
            decrypt_frame(&[0u8; FRAME_OVERHEAD - 1], &key),
            Err(CryptoError::FrameTooShort(27))
        ));
    }

    #[test]
    fn test_session_key_length() {
        assert!(SessionKey::from_slice(&[7u8; 32]).is_some());
        assert!(SessionKey::from_slice(&[7u8; 16]).is_none());
        assert!(SessionKey::from_slice(&[7u8; 33]).is_none());
    }

    #[test]
    fn test_debug_redacts_key() {
        let key = SessionKey::from_slice(&[0x41; 32]).unwrap();
        assert_eq!(format!("{:?}", key), "SessionKey([REDACTED])");
    }
}
