//! Request header, media type and response metadata wire types.

use serde::Serialize;
use std::path::Path;

use super::error::SessionError;

/// Plaintext size of the fixed request header.
pub const REQUEST_HEADER_SIZE: usize = 8;

/// Largest value representable in the 40-bit file size field.
pub const MAX_FILE_SIZE_FIELD: u64 = (1 << 40) - 1;

/// Longest accepted media type / extension string.
pub const MAX_EXTENSION_LEN: usize = 16;

/// Decrypted request header: `[json_size u16][media_type_len u8][file_size u40]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub json_size: u16,
    pub media_type_len: u8,
    pub file_size: u64,
}

impl RequestHeader {
    /// Parse and validate a decrypted header block.
    ///
    /// `file_size` must be in `1..=max_upload_size`.
    pub fn parse(block: &[u8], max_upload_size: u64) -> Result<Self, SessionError> {
        if block.len() != REQUEST_HEADER_SIZE {
            return Err(SessionError::protocol(format!(
                "request header is {} bytes, expected {}",
                block.len(),
                REQUEST_HEADER_SIZE
            )));
        }

        let json_size = u16::from_be_bytes([block[0], block[1]]);
        let media_type_len = block[2];
        let file_size = block[3..]
            .iter()
            .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));

        if file_size == 0 {
            return Err(SessionError::protocol("Invalid file size: 0"));
        }
        if file_size > max_upload_size {
            return Err(SessionError::protocol(format!(
                "Invalid file size: {} exceeds limit of {} bytes",
                file_size, max_upload_size
            )));
        }
        if json_size == 0 {
            return Err(SessionError::protocol("Empty request parameters"));
        }
        if media_type_len == 0 {
            return Err(SessionError::protocol("Empty media type"));
        }

        Ok(RequestHeader {
            json_size,
            media_type_len,
            file_size,
        })
    }

    /// Encode the header block (client side and tests).
    pub fn encode(&self) -> [u8; REQUEST_HEADER_SIZE] {
        let mut block = [0u8; REQUEST_HEADER_SIZE];
        block[..2].copy_from_slice(&self.json_size.to_be_bytes());
        block[2] = self.media_type_len;
        block[3..].copy_from_slice(&self.file_size.to_be_bytes()[3..]);
        block
    }
}

/// Validate a file extension that will become part of a stored path.
pub fn validate_extension(raw: &str) -> Result<&str, String> {
    if raw.is_empty() || raw.len() > MAX_EXTENSION_LEN {
        return Err(format!("extension must be 1..={} characters", MAX_EXTENSION_LEN));
    }
    if !raw.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return Err(format!("extension {:?} contains unsupported characters", raw));
    }
    Ok(raw)
}

/// Decode and validate the media type block.
pub fn parse_media_type(block: Vec<u8>) -> Result<String, SessionError> {
    let media_type = String::from_utf8(block)
        .map_err(|_| SessionError::protocol("media type is not valid UTF-8"))?;
    validate_extension(&media_type).map_err(SessionError::Protocol)?;
    Ok(media_type)
}

/// Status byte that opens every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Error = 0x00,
    Success = 0x01,
}

/// Success metadata frame payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SuccessInfo {
    pub status_code: &'static str,
    pub file_extension: String,
    pub file_size: u64,
}

impl SuccessInfo {
    pub fn new(output_path: &Path, file_size: u64) -> Self {
        let file_extension = output_path
            .extension()
            .map(|ext| ext.to_string_lossy().into_owned())
            .unwrap_or_default();

        SuccessInfo {
            status_code: "success",
            file_extension,
            file_size,
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
