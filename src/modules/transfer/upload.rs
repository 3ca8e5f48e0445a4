//! Chunked, encrypted upload receiver.
//!
//! The client sends `file_size` plaintext bytes as consecutive unprefixed
//! frames of `min(chunk_size, remaining)` bytes each. On failure the
//! outstanding wire bytes are drained so the stream stays aligned.

use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter};

use super::channel::FrameChannel;
use super::error::{ErrorCode, ErrorInfo, SessionError};
use crate::modules::crypto::{self, SessionKey};

/// Plaintext lengths of the chunks carrying `declared_size` bytes.
///
/// Yields `ceil(declared / chunk)` items; all but the last equal
/// `chunk_size`.
pub fn chunk_plan(declared_size: u64, chunk_size: usize) -> impl Iterator<Item = usize> {
    let chunk = chunk_size.max(1) as u64;
    let mut remaining = declared_size;
    std::iter::from_fn(move || {
        if remaining == 0 {
            return None;
        }
        let len = remaining.min(chunk);
        remaining -= len;
        Some(len as usize)
    })
}

/// Wire bytes a client sends for an upload of `declared_size` bytes.
pub fn expected_wire_len(declared_size: u64, chunk_size: usize) -> u64 {
    let chunk = chunk_size.max(1) as u64;
    let chunks = declared_size.div_ceil(chunk);
    declared_size + chunks * crypto::FRAME_OVERHEAD as u64
}

/// Failed upload, with how much of it reached the file and how many
/// outstanding wire bytes were drained afterwards.
#[derive(Debug)]
pub struct UploadFailure {
    pub error: SessionError,
    pub bytes_written: u64,
    pub drained: u64,
}

impl UploadFailure {
    pub fn to_error_info(&self) -> ErrorInfo {
        ErrorInfo::new(ErrorCode::Upload, &self.error)
    }
}

/// Receives one upload into a file.
pub struct UploadReceiver<'a> {
    key: &'a SessionKey,
    chunk_size: usize,
}

impl<'a> UploadReceiver<'a> {
    pub fn new(key: &'a SessionKey, chunk_size: usize) -> Self {
        UploadReceiver { key, chunk_size }
    }

    /// Receive `declared_size` bytes into `dest`.
    ///
    /// Returns the number of bytes written, which always equals
    /// `declared_size` on success.
    pub async fn receive<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        channel: &mut FrameChannel<S>,
        dest: &Path,
        declared_size: u64,
    ) -> Result<u64, UploadFailure> {
        let start_offset = channel.bytes_received();
        let mut written: u64 = 0;

        match self
            .receive_chunks(channel, dest, declared_size, &mut written)
            .await
        {
            Ok(()) => {
                log::info!("File upload completed: {} bytes", written);
                Ok(written)
            }
            Err(error) => {
                log::warn!("File storage error after {} bytes: {}", written, error);

                let consumed = channel.bytes_received() - start_offset;
                let outstanding =
                    expected_wire_len(declared_size, self.chunk_size).saturating_sub(consumed);
                let drained = if error.is_disconnect() || outstanding == 0 {
                    0
                } else {
                    channel.drain(outstanding).await
                };
                if drained > 0 {
                    log::debug!("Drained {} of {} outstanding upload bytes", drained, outstanding);
                }

                Err(UploadFailure {
                    error,
                    bytes_written: written,
                    drained,
                })
            }
        }
    }

    async fn receive_chunks<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        channel: &mut FrameChannel<S>,
        dest: &Path,
        declared_size: u64,
        written: &mut u64,
    ) -> Result<(), SessionError> {
        let file = File::create(dest).await?;
        let mut writer = BufWriter::new(file);

        for chunk_len in chunk_plan(declared_size, self.chunk_size) {
            let blob = channel.recv_frame(chunk_len).await?;
            let plaintext = crypto::decrypt_frame(&blob, self.key)?;
            if plaintext.len() != chunk_len {
                return Err(SessionError::protocol(format!(
                    "chunk decrypted to {} bytes, expected {}",
                    plaintext.len(),
                    chunk_len
                )));
            }
            writer.write_all(&plaintext).await?;
            *written += chunk_len as u64;
        }

        writer.flush().await?;
        writer.into_inner().sync_all().await?;
        Ok(())
    }
}
