//! Frame transport over a byte stream.
//!
//! Outbound frames are written as `[len u32 BE][blob]`. Inbound frames after
//! the handshake carry no prefix; their size is always implied by a field
//! the peer sent earlier, so the receiver asks for an exact byte count.

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::error::SessionError;
use crate::modules::crypto::{self, SessionKey};

/// Size of the big-endian length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

const DRAIN_BUFFER_SIZE: usize = 64 * 1024;

/// Framed, byte-counting wrapper around one connection.
pub struct FrameChannel<S> {
    stream: S,
    io_timeout: Option<Duration>,
    bytes_received: u64,
    bytes_sent: u64,
}

impl<S: AsyncRead + AsyncWrite + Unpin> FrameChannel<S> {
    pub fn new(stream: S, io_timeout: Option<Duration>) -> Self {
        FrameChannel {
            stream,
            io_timeout,
            bytes_received: 0,
            bytes_sent: 0,
        }
    }

    /// Total bytes consumed from the peer so far.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Total bytes handed to the transport so far.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Read exactly `len` bytes.
    ///
    /// Loops over partial reads; EOF before `len` bytes arrived is
    /// `ConnectionClosed`. Bytes read before the failure are still counted.
    pub async fn recv_exact(&mut self, len: usize) -> Result<Vec<u8>, SessionError> {
        let mut buf = vec![0u8; len];
        let mut filled = 0;

        while filled < len {
            let n = match self.io_timeout {
                Some(limit) => tokio::time::timeout(limit, self.stream.read(&mut buf[filled..]))
                    .await
                    .map_err(|_| SessionError::TimedOut)??,
                None => self.stream.read(&mut buf[filled..]).await?,
            };
            if n == 0 {
                return Err(SessionError::ConnectionClosed {
                    expected: len,
                    received: filled,
                });
            }
            filled += n;
            self.bytes_received += n as u64;
        }

        Ok(buf)
    }

    /// Receive an unprefixed frame carrying `plaintext_len` bytes.
    pub async fn recv_frame(&mut self, plaintext_len: usize) -> Result<Vec<u8>, SessionError> {
        self.recv_exact(crypto::sealed_len(plaintext_len)).await
    }

    /// Receive and open an unprefixed frame.
    pub async fn recv_decrypted(
        &mut self,
        plaintext_len: usize,
        key: &SessionKey,
    ) -> Result<Vec<u8>, SessionError> {
        let blob = self.recv_frame(plaintext_len).await?;
        Ok(crypto::decrypt_frame(&blob, key)?)
    }

    /// Receive a `[len u32 BE][blob]` message (handshake only).
    ///
    /// `max_len` bounds the untrusted length field before anything is
    /// allocated for it.
    pub async fn recv_length_prefixed(&mut self, max_len: usize) -> Result<Vec<u8>, SessionError> {
        let prefix = self.recv_exact(LENGTH_PREFIX_SIZE).await?;
        let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;

        if len == 0 || len > max_len {
            return Err(SessionError::protocol(format!(
                "length prefix {} outside 1..={}",
                len, max_len
            )));
        }

        self.recv_exact(len).await
    }

    /// Write `[len u32 BE][blob]` and flush.
    pub async fn send_frame(&mut self, blob: &[u8]) -> Result<(), SessionError> {
        let len = u32::try_from(blob.len())
            .map_err(|_| SessionError::protocol(format!("frame of {} bytes", blob.len())))?;

        self.stream.write_all(&len.to_be_bytes()).await?;
        self.bytes_sent += LENGTH_PREFIX_SIZE as u64;
        self.stream.write_all(blob).await?;
        self.bytes_sent += blob.len() as u64;
        self.stream.flush().await?;
        Ok(())
    }

    /// Seal `plaintext` under `key` and send it as one prefixed frame.
    pub async fn send_encrypted(
        &mut self,
        plaintext: &[u8],
        key: &SessionKey,
    ) -> Result<(), SessionError> {
        let blob = crypto::encrypt_frame(plaintext, key).map_err(SessionError::Crypto)?;
        self.send_frame(&blob).await
    }

    /// Discard up to `len` bytes from the peer. Stops early on EOF or error.
    ///
    /// Returns the number of bytes actually discarded.
    pub async fn drain(&mut self, len: u64) -> u64 {
        let mut remaining = len;
        let mut buf = vec![0u8; DRAIN_BUFFER_SIZE.min(len as usize)];

        while remaining > 0 {
            let want = buf.len().min(remaining as usize);
            let read = match self.io_timeout {
                Some(limit) => {
                    match tokio::time::timeout(limit, self.stream.read(&mut buf[..want])).await {
                        Ok(result) => result,
                        Err(_) => break,
                    }
                }
                None => self.stream.read(&mut buf[..want]).await,
            };
            match read {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    remaining -= n as u64;
                    self.bytes_received += n as u64;
                }
            }
        }

        len - remaining
    }

    /// Shut down the write side; errors are irrelevant at this point.
    pub async fn close(&mut self) {
        if let Err(e) = self.stream.shutdown().await {
            log::debug!("Shutdown after session returned: {}", e);
        }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}
