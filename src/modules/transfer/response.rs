//! Encrypted response frames: status byte, metadata, then output chunks.

use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

use super::channel::FrameChannel;
use super::error::{ErrorInfo, SessionError};
use super::request::{ResponseStatus, SuccessInfo};
use crate::modules::crypto::SessionKey;

/// Where a send failed, relative to the first byte hitting the wire.
#[derive(Debug, thiserror::Error)]
pub enum SendFailure {
    /// Nothing was written; an error report can still be sent.
    #[error("before any response frame: {0}")]
    BeforeWrite(SessionError),

    /// Frames were partially written; the connection must be torn down.
    #[error("mid-stream: {0}")]
    MidStream(SessionError),
}

/// Sends one response under the session key.
pub struct ResponseSender<'a> {
    key: &'a SessionKey,
}

impl<'a> ResponseSender<'a> {
    pub fn new(key: &'a SessionKey) -> Self {
        ResponseSender { key }
    }

    /// Send status `0x01`, success metadata, then the file in chunks.
    ///
    /// Returns the number of payload bytes sent.
    pub async fn send_success<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        channel: &mut FrameChannel<S>,
        output_path: &Path,
        chunk_size: usize,
    ) -> Result<u64, SendFailure> {
        let mut file = File::open(output_path)
            .await
            .map_err(|e| SendFailure::BeforeWrite(e.into()))?;
        let file_size = file
            .metadata()
            .await
            .map_err(|e| SendFailure::BeforeWrite(e.into()))?
            .len();
        let metadata = SuccessInfo::new(output_path, file_size)
            .to_json()
            .map_err(|e| SendFailure::BeforeWrite(SessionError::Io(e.into())))?;

        let start = channel.bytes_sent();
        if let Err(e) = channel
            .send_encrypted(&[ResponseStatus::Success as u8], self.key)
            .await
        {
            return Err(if channel.bytes_sent() == start {
                SendFailure::BeforeWrite(e)
            } else {
                SendFailure::MidStream(e)
            });
        }
        channel
            .send_encrypted(&metadata, self.key)
            .await
            .map_err(SendFailure::MidStream)?;

        log::info!("Sending processed file ({} bytes)", file_size);

        let mut buf = vec![0u8; chunk_size.max(1)];
        let mut total_sent: u64 = 0;
        loop {
            let n = fill_chunk(&mut file, &mut buf)
                .await
                .map_err(|e| SendFailure::MidStream(e.into()))?;
            if n == 0 {
                break;
            }
            channel
                .send_encrypted(&buf[..n], self.key)
                .await
                .map_err(SendFailure::MidStream)?;
            total_sent += n as u64;
        }

        if total_sent != file_size {
            return Err(SendFailure::MidStream(SessionError::protocol(format!(
                "output size changed while sending: announced {}, sent {}",
                file_size, total_sent
            ))));
        }
        log::info!("Processed file transmission completed");
        Ok(total_sent)
    }

    /// Send status `0x00` followed by the error metadata.
    pub async fn send_error<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        channel: &mut FrameChannel<S>,
        info: &ErrorInfo,
    ) -> Result<(), SessionError> {
        let metadata = info
            .to_json()
            .map_err(|e| SessionError::Io(e.into()))?;

        channel
            .send_encrypted(&[ResponseStatus::Error as u8], self.key)
            .await?;
        channel.send_encrypted(&metadata, self.key).await?;

        log::info!("Encrypted error response sent: {}", info.error_code);
        Ok(())
    }
}

/// Read until `buf` is full or the file ends. Only the final chunk of a
/// file comes back short.
async fn fill_chunk(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]).await? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}
