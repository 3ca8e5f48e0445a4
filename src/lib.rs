//! Encrypted media upload and processing server.
//!
//! Clients upload a media file over an encrypted TCP session, ask for one
//! transformation (compression, resolution or aspect ratio change, audio
//! extraction, clipping) and receive the result on the same connection.

pub mod config;
pub mod modules;

pub use config::{ConfigError, ServerSettings};
pub use modules::processor::{DurationProbe, FfmpegProcessor, MediaJob, MediaProcessor};
pub use modules::secure_keys::ServerKeyPair;
pub use modules::transfer::{SessionOutcome, TransferServer, TransferSession};
