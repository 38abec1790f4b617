use std::fmt;

use thiserror::Error;

/// Cause code carried by an error value node.
///
/// Error values are ordinary nodes in the value graph: they are heap
/// allocated, reference counted, and released like every other kind. The
/// cause code is the only payload they carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The peer is gone: the socket closed, a send failed, or the
    /// connection was cancelled.
    ConnectionInvalid,
    /// Reserved for transient tear-down.
    ConnectionInterrupted,
    /// Reserved.
    TerminationImminent,
}

impl ErrorCode {
    /// Human-readable description of the cause.
    pub fn message(&self) -> &'static str {
        match self {
            ErrorCode::ConnectionInvalid => "connection invalid",
            ErrorCode::ConnectionInterrupted => "connection interrupted",
            ErrorCode::TerminationImminent => "termination imminent",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Errors surfaced by the codec, the transports, and the connection
/// machinery.
///
/// Typed getters on the value graph never error; they fall back to a zero
/// value instead. The connection is the only component that converts one of
/// these into a user-visible error *value* (an [`ErrorCode`] node delivered
/// to a handler).
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u64, actual: u64 },

    #[error("frame payload of {length} bytes exceeds the {limit}-byte cap")]
    FrameTooLarge { length: u64, limit: usize },

    #[error("connection has been cancelled")]
    Cancelled,

    #[error("message must be a dictionary")]
    NotADictionary,

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, IpcError>;
