//! Encrypted media transfer protocol.
//!
//! A client performs an RSA handshake to establish an AES-256-GCM session
//! key, uploads one file in encrypted chunks together with the requested
//! transformation, and receives either the processed file or an error
//! report over the same connection.
//!
//! ## Architecture
//!
//! - `server.rs` - TCP listener, one session at a time
//! - `session.rs` - Per-connection state machine
//! - `handshake.rs` - RSA-OAEP session key exchange
//! - `channel.rs` - Framed, byte-counting transport
//! - `request.rs` - Request header and metadata wire types
//! - `upload.rs` - Chunked upload receiver
//! - `response.rs` - Success and error responses
//! - `storage.rs` - Upload naming and deletion
//! - `error.rs` - Session errors and client-facing error codes

pub mod channel;
pub mod error;
pub mod handshake;
pub mod request;
pub mod response;
pub mod server;
pub mod session;
pub mod storage;
pub mod upload;

pub use error::{ErrorCode, ErrorInfo, SessionError};
pub use server::{ServerError, TransferServer};
pub use session::{SessionOutcome, SessionState, TransferSession};
