//! Protocol error types and error codes.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors raised while decoding the inbound byte stream.
///
/// All of these are recoverable at the connection level: the parser has
/// already discarded the offending frame and reset by the time the error is
/// surfaced, so the caller reports it to the peer and keeps reading.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unable to parse header: {line:?}")]
    InvalidHeader { line: String },

    #[error("invalid content-length: {0:?}")]
    InvalidContentLength(String),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("frame missing NUL terminator after {command} body")]
    MissingTerminator { command: String },

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("unable to parse heart-beat header must be <cx>,<cy>: {0:?}")]
    InvalidHeartBeat(String),
}

impl ProtocolError {
    /// Short text placed in the `message` header of the ERROR frame.
    pub fn summary(&self) -> &'static str {
        match self {
            ProtocolError::InvalidHeader { .. } => "unable to parse header",
            ProtocolError::InvalidContentLength(_) => "invalid content-length",
            ProtocolError::FrameTooLarge { .. } => "frame too large",
            ProtocolError::MissingTerminator { .. } => "frame missing terminator",
            ProtocolError::InvalidUtf8(_) => "invalid utf-8",
            ProtocolError::InvalidHeartBeat(_) => {
                "unable to parse heart-beat header must be <cx>,<cy>"
            }
        }
    }

    /// Returns the stable error code for this error.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ProtocolError::InvalidHeartBeat(_) => ErrorCode::BadHeartBeat,
            _ => ErrorCode::MalformedFrame,
        }
    }
}

/// Stable error codes attached to ERROR frames.
///
/// These are emitted in the `code` header and must remain stable across
/// versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Framing
    MalformedFrame,
    BadHeartBeat,

    // Session
    NotConnected,
    AuthFailed,
    HeartBeatTimeout,

    // Commands
    MissingHeader,
    InvalidDestination,
    InvalidAckMode,
    InvalidPrefetch,
    DuplicateSubscription,
    SubscriptionNotFound,
    MessageNotFound,
    TransactionNotFound,
    UnknownCommand,

    // System
    InternalError,
}

impl ErrorCode {
    /// Returns whether the connection is torn down after reporting this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ErrorCode::NotConnected
                | ErrorCode::AuthFailed
                | ErrorCode::BadHeartBeat
                | ErrorCode::HeartBeatTimeout
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::MalformedFrame => "MALFORMED_FRAME",
            ErrorCode::BadHeartBeat => "BAD_HEART_BEAT",
            ErrorCode::NotConnected => "NOT_CONNECTED",
            ErrorCode::AuthFailed => "AUTH_FAILED",
            ErrorCode::HeartBeatTimeout => "HEART_BEAT_TIMEOUT",
            ErrorCode::MissingHeader => "MISSING_HEADER",
            ErrorCode::InvalidDestination => "INVALID_DESTINATION",
            ErrorCode::InvalidAckMode => "INVALID_ACK_MODE",
            ErrorCode::InvalidPrefetch => "INVALID_PREFETCH",
            ErrorCode::DuplicateSubscription => "DUPLICATE_SUBSCRIPTION",
            ErrorCode::SubscriptionNotFound => "SUBSCRIPTION_NOT_FOUND",
            ErrorCode::MessageNotFound => "MESSAGE_NOT_FOUND",
            ErrorCode::TransactionNotFound => "TRANSACTION_NOT_FOUND",
            ErrorCode::UnknownCommand => "UNKNOWN_COMMAND",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        };
        f.write_str(name)
    }
}
