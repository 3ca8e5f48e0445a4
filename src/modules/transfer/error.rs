//! Error types for the transfer protocol.
//!
//! [`SessionError`] is the internal taxonomy used while driving a
//! connection. [`ErrorInfo`] is what the client sees once a session key
//! exists: a stable code, a description carrying the cause, and a remedy.

use serde::Serialize;
use thiserror::Error;

use crate::modules::crypto::CryptoError;
use crate::modules::secure_keys::KeyError;

/// Errors that end a session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Key exchange failed: {0}")]
    KeyExchange(#[from] KeyError),

    #[error("Frame crypto error: {0}")]
    Crypto(CryptoError),

    #[error("Connection closed by peer after {received} of {expected} bytes")]
    ConnectionClosed { expected: usize, received: usize },

    #[error("Timed out waiting for peer")]
    TimedOut,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    pub fn protocol(reason: impl Into<String>) -> Self {
        SessionError::Protocol(reason.into())
    }

    /// Returns `true` when the peer is gone and nothing more can be exchanged.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            SessionError::ConnectionClosed { .. } | SessionError::TimedOut
        )
    }
}

impl From<CryptoError> for SessionError {
    fn from(e: CryptoError) -> Self {
        SessionError::Authentication(e.to_string())
    }
}

/// Codes reported to the client in the error metadata frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidRequest = 1000,
    Upload = 1001,
    Compression = 1002,
    Resolution = 1003,
    AspectRatio = 1004,
    AudioConversion = 1005,
    ClipExtraction = 1006,
    ClipOutOfRange = 1007,
    Transmission = 1008,
}

impl ErrorCode {
    pub fn code(self) -> u16 {
        self as u16
    }

    fn prefix(self) -> &'static str {
        match self {
            ErrorCode::InvalidRequest => "Invalid request",
            ErrorCode::Upload => "Error during file storage",
            ErrorCode::Compression => "Error during video compression",
            ErrorCode::Resolution => "Error during resolution change",
            ErrorCode::AspectRatio => "Error during video aspect ratio change",
            ErrorCode::AudioConversion => "Error during audio conversion",
            ErrorCode::ClipExtraction => "Error during clip extraction",
            ErrorCode::ClipOutOfRange => "The specified end time exceeds the video duration",
            ErrorCode::Transmission => "File transmission error",
        }
    }

    /// Suggested remedy shown to the user.
    pub fn solution(self) -> &'static str {
        match self {
            ErrorCode::InvalidRequest => {
                "Please update the client and retry. If the issue persists, contact the administrator."
            }
            ErrorCode::Upload => "If the issue persists, please contact the administrator.",
            ErrorCode::Compression | ErrorCode::Resolution => {
                "Please verify that FFmpeg is properly installed."
            }
            ErrorCode::AspectRatio | ErrorCode::AudioConversion => {
                "Please check the uploaded video and try uploading and processing again. If the issue persists, contact the administrator."
            }
            ErrorCode::ClipExtraction => "Please check the uploaded video again and retry.",
            ErrorCode::ClipOutOfRange => {
                "Please set the specified range to a value that does not exceed the video duration."
            }
            ErrorCode::Transmission => "Please check your network connection.",
        }
    }
}

/// Error metadata frame payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorInfo {
    #[serde(skip)]
    pub code: ErrorCode,
    pub error_code: String,
    pub description: String,
    pub solution: String,
}

impl ErrorInfo {
    /// Build a report whose description is `"<prefix>: <cause>"`.
    pub fn new(code: ErrorCode, cause: impl std::fmt::Display) -> Self {
        Self::with_description(code, format!("{}: {}", code.prefix(), cause))
    }

    /// Build a report with a fixed description and no cause.
    pub fn bare(code: ErrorCode) -> Self {
        Self::with_description(code, code.prefix().to_string())
    }

    fn with_description(code: ErrorCode, description: String) -> Self {
        ErrorInfo {
            code,
            error_code: code.code().to_string(),
            description,
            solution: code.solution().to_string(),
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.error_code, self.description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_distinct() {
        let all = [
            ErrorCode::InvalidRequest,
            ErrorCode::Upload,
            ErrorCode::Compression,
            ErrorCode::Resolution,
            ErrorCode::AspectRatio,
            ErrorCode::AudioConversion,
            ErrorCode::ClipExtraction,
            ErrorCode::ClipOutOfRange,
            ErrorCode::Transmission,
        ];
        let mut codes: Vec<u16> = all.iter().map(|c| c.code()).collect();
        codes.dedup();
        assert_eq!(codes.len(), all.len());
        assert_ne!(ErrorCode::Transmission.code(), ErrorCode::AspectRatio.code());
    }

    #[test]
    fn test_error_info_json_shape() {
        let info = ErrorInfo::new(ErrorCode::Upload, "Connection closed unexpectedly");
        let value: serde_json::Value = serde_json::from_slice(&info.to_json().unwrap()).unwrap();

        assert_eq!(value["error_code"], "1001");
        assert_eq!(
            value["description"],
            "Error during file storage: Connection closed unexpectedly"
        );
        assert_eq!(
            value["solution"],
            "If the issue persists, please contact the administrator."
        );
        assert_eq!(value.as_object().unwrap().len(), 3);
    }

    #[test]
    fn test_bare_error_info() {
        let info = ErrorInfo::bare(ErrorCode::ClipOutOfRange);
        assert_eq!(info.error_code, "1007");
        assert!(info.description.contains("exceeds the video duration"));
    }

    #[test]
    fn test_session_error_classification() {
        let closed = SessionError::ConnectionClosed {
            expected: 36,
            received: 10,
        };
        assert!(closed.is_disconnect());
        assert!(closed.to_string().contains("10 of 36"));
        assert!(SessionError::TimedOut.is_disconnect());
        assert!(!SessionError::protocol("bad header").is_disconnect());

        let auth: SessionError = CryptoError::Authentication.into();
        assert!(matches!(auth, SessionError::Authentication(_)));
    }

    #[test]
    fn test_seal_failure_is_crypto_error() {
        let sealing = SessionError::Crypto(CryptoError::Encryption);
        assert!(!sealing.is_disconnect());
        assert_eq!(sealing.to_string(), "Frame crypto error: Frame encryption failed");
    }
}
