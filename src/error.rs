//! Error types for creature-client.

use thiserror::Error;

use crate::classify::Operation;

/// Main error type for all session operations.
///
/// Only two kinds of failure ever reach a caller: local precondition
/// violations (bad address, bad configuration, failure to dial) and
/// status codes that the protocol contract says can never occur.
/// Everything else is absorbed at the session boundary and only shows
/// up in logs.
#[derive(Debug, Error)]
pub enum CreatureError {
    /// The session address failed local validation.
    #[error("Invalid address {address:?}: {reason}")]
    InvalidAddress {
        /// The address as supplied by the caller.
        address: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// The server reported a status code that should be impossible for this operation.
    #[error("Unexpected status {code:?} on {operation}: {message}")]
    Unexpected {
        /// Which path observed the status.
        operation: Operation,
        /// The offending status code.
        code: tonic::Code,
        /// Status message from the transport.
        message: String,
    },

    /// Channel setup failed.
    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// I/O error while loading configuration or certificates.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON configuration could not be parsed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The channel was closed before the call could be opened.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The inbound loop died without reaching its own exit.
    #[error("Inbound loop aborted")]
    LoopAborted,

    /// Configuration value out of range.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl CreatureError {
    /// Build an [`CreatureError::Unexpected`] from a transport status.
    pub fn unexpected(operation: Operation, status: &tonic::Status) -> Self {
        Self::Unexpected {
            operation,
            code: status.code(),
            message: status.message().to_string(),
        }
    }

    /// Whether this error is a contract violation reported by the server.
    pub fn is_unexpected(&self) -> bool {
        matches!(self, Self::Unexpected { .. })
    }
}

/// Result type alias using CreatureError.
pub type Result<T> = std::result::Result<T, CreatureError>;
