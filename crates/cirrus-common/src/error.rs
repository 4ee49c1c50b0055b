//! Common error types for the Cirrus relay.

use thiserror::Error;

use crate::protocol::DecodeError;

/// Result type alias using Cirrus' error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for relay operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (socket bind, accept, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Inbound envelope could not be decoded
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Underlying websocket send/receive failed
    #[error("transport error: {0}")]
    Transport(String),

    /// Registry bookkeeping broke a hard invariant (e.g. duplicate player id)
    #[error("registry invariant violated: {0}")]
    RegistryInvariantViolation(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a transport error from any displayable type.
    pub fn transport(msg: impl std::fmt::Display) -> Self {
        Self::Transport(msg.to_string())
    }

    /// Create a registry invariant violation from any displayable type.
    pub fn invariant(msg: impl std::fmt::Display) -> Self {
        Self::RegistryInvariantViolation(msg.to_string())
    }

    /// Create a config error from any displayable type.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// Create an internal error from any displayable type.
    pub fn internal(msg: impl std::fmt::Display) -> Self {
        Self::Internal(msg.to_string())
    }
}
