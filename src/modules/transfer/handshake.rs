//! Server side of the RSA handshake that establishes the session key.
//!
//! ```text
//! C -> S  [len][client public key PEM]
//! S -> C  [len][server public key PEM]
//! C -> S  [len][RSA-OAEP-SHA256(session key)]
//! ```
//!
//! Any failure here ends the connection silently: without a session key
//! there is no way to authenticate an error report.

use rsa::traits::PublicKeyParts;
use tokio::io::{AsyncRead, AsyncWrite};

use super::channel::FrameChannel;
use super::error::SessionError;
use crate::modules::crypto::SessionKey;
use crate::modules::secure_keys::{parse_pem_public_key, ServerKeyPair};

/// Upper bound for either length-prefixed handshake blob.
pub const MAX_HANDSHAKE_BLOB: usize = 16 * 1024;

/// Outcome of a completed handshake. The client key is only validated;
/// responses are sealed under the session key alone.
pub struct Handshake {
    pub session_key: SessionKey,
}

/// Run the three handshake steps against `keypair`.
pub async fn perform_handshake<S: AsyncRead + AsyncWrite + Unpin>(
    channel: &mut FrameChannel<S>,
    keypair: &ServerKeyPair,
) -> Result<Handshake, SessionError> {
    // ReceivePeerKey
    let peer_pem = channel.recv_length_prefixed(MAX_HANDSHAKE_BLOB).await?;
    let peer_public_key = parse_pem_public_key(&peer_pem)
        .map_err(|e| SessionError::protocol(format!("client public key: {}", e)))?;
    log::debug!(
        "Client public key loaded ({} bits)",
        peer_public_key.size() * 8
    );

    // SendOwnKey
    channel
        .send_frame(keypair.public_key_pem().as_bytes())
        .await?;
    log::debug!("Server public key sent");

    // UnwrapSessionKey
    let wrapped = channel.recv_length_prefixed(MAX_HANDSHAKE_BLOB).await?;
    let session_key = keypair.unwrap_session_key(&wrapped)?;

    Ok(Handshake { session_key })
}
