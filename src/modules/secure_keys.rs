//! Process-wide RSA keypair used to unwrap per-connection session keys.
//!
//! The keypair is generated once at startup and shared read-only (behind an
//! `Arc`) by every connection. Only the public half ever leaves the process.

use pem::{EncodeConfig, LineEnding, Pem};
use rand_core::OsRng;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use super::crypto::SessionKey;

/// Modulus size of the server keypair.
pub const SERVER_KEY_BITS: usize = 2048;

const SPKI_PEM_TAG: &str = "PUBLIC KEY";
const PKCS1_PEM_TAG: &str = "RSA PUBLIC KEY";

/// Error type for key operations.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("Key generation failed: {0}")]
    Generation(String),

    #[error("Invalid key format: {0}")]
    InvalidFormat(String),

    #[error("Session key unwrap failed: {0}")]
    Unwrap(String),

    #[error("Session key wrap failed: {0}")]
    Wrap(String),

    #[error("Invalid session key size: expected {expected}, got {got}")]
    InvalidKeySize { expected: usize, got: usize },
}

/// Server RSA keypair.
pub struct ServerKeyPair {
    private_key: RsaPrivateKey,
    public_key_pem: String,
}

impl ServerKeyPair {
    /// Generate a fresh 2048-bit keypair.
    pub fn generate() -> Result<Self, KeyError> {
        Self::generate_with_bits(SERVER_KEY_BITS)
    }

    /// Generate a keypair with a custom modulus size.
    pub fn generate_with_bits(bits: usize) -> Result<Self, KeyError> {
        let private_key = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| KeyError::Generation(e.to_string()))?;
        Self::from_private_key(private_key)
    }

    /// Wrap an existing private key.
    pub fn from_private_key(private_key: RsaPrivateKey) -> Result<Self, KeyError> {
        let public_key_pem = public_key_to_pem(&private_key.to_public_key())?;
        Ok(Self {
            private_key,
            public_key_pem,
        })
    }

    /// SPKI PEM of the public half, as sent during the handshake.
    pub fn public_key_pem(&self) -> &str {
        &self.public_key_pem
    }

    pub fn public_key(&self) -> RsaPublicKey {
        self.private_key.to_public_key()
    }

    /// Size in bytes of any ciphertext produced under this key.
    pub fn modulus_len(&self) -> usize {
        self.private_key.size()
    }

    /// Recover the session key from an RSA-OAEP (SHA-256 / MGF1-SHA-256) envelope.
    pub fn unwrap_session_key(&self, wrapped: &[u8]) -> Result<SessionKey, KeyError> {
        if wrapped.len() != self.modulus_len() {
            return Err(KeyError::Unwrap(format!(
                "ciphertext is {} bytes, modulus is {}",
                wrapped.len(),
                self.modulus_len()
            )));
        }

        let plaintext = self
            .private_key
            .decrypt(Oaep::new::<Sha256>(), wrapped)
            .map_err(|e| KeyError::Unwrap(e.to_string()))?;

        let got = plaintext.len();
        SessionKey::from_slice(&plaintext).ok_or(KeyError::InvalidKeySize {
            expected: super::crypto::SESSION_KEY_SIZE,
            got,
        })
    }
}

/// Wrap a session key under a peer's public key (client side of the handshake).
pub fn wrap_session_key(public_key: &RsaPublicKey, key: &SessionKey) -> Result<Vec<u8>, KeyError> {
    public_key
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), key.expose())
        .map_err(|e| KeyError::Wrap(e.to_string()))
}

/// Parse a PEM-formatted RSA public key (SPKI or PKCS#1).
pub fn parse_pem_public_key(pem_bytes: &[u8]) -> Result<RsaPublicKey, KeyError> {
    let parsed = pem::parse(pem_bytes).map_err(|e| KeyError::InvalidFormat(e.to_string()))?;

    match parsed.tag() {
        SPKI_PEM_TAG => RsaPublicKey::from_public_key_der(parsed.contents())
            .map_err(|e| KeyError::InvalidFormat(e.to_string())),
        PKCS1_PEM_TAG => RsaPublicKey::from_pkcs1_der(parsed.contents())
            .map_err(|e| KeyError::InvalidFormat(e.to_string())),
        other => Err(KeyError::InvalidFormat(format!(
            "Expected {}, got {}",
            SPKI_PEM_TAG, other
        ))),
    }
}

/// Convert an RSA public key to SPKI PEM format.
pub fn public_key_to_pem(public_key: &RsaPublicKey) -> Result<String, KeyError> {
    let der = public_key
        .to_public_key_der()
        .map_err(|e| KeyError::InvalidFormat(e.to_string()))?;
    let encoded = Pem::new(SPKI_PEM_TAG, der.as_bytes().to_vec());
    Ok(pem::encode_config(
        &encoded,
        EncodeConfig::new().set_line_ending(LineEnding::LF),
    ))
}
