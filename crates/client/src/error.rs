//! Client-level error type.
//!
//! Transport-level failures have their own [`TransportError`] in the
//! transport module; tool failures never surface here at all — they
//! travel back to the control plane inside an error-flagged
//! `CallToolResult`.

use crate::client::ConnectionState;
use crate::transport::TransportError;

/// Errors surfaced to the embedding process.
///
/// Only two of these ever come out of `start()`: `Config` (fatal, not
/// retried) and whatever the very first handshake attempt produced.
/// Later failures are handled internally by the reconnect loop and are
/// visible only as state transitions and logs.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("config: {0}")]
    Config(String),

    #[error("handshake: {0}")]
    Handshake(String),

    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("cannot start in state {0:?}")]
    InvalidState(ConnectionState),

    #[error("client is stopped")]
    Stopped,
}
