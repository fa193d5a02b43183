//! Server error types.

use stompd_protocol::{Command, ErrorCode};
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] stompd_protocol::ProtocolError),

    #[error("core error: {0}")]
    Core(#[from] stompd_core::CoreError),

    #[error("must send CONNECT first")]
    NotConnected,

    #[error("missing login")]
    MissingLogin,

    #[error("must specify login")]
    EmptyLogin,

    #[error("missing passcode")]
    MissingPasscode,

    #[error("{command} missing {header} header")]
    MissingHeader {
        command: Command,
        header: &'static str,
    },

    #[error("invalid subscription id")]
    InvalidSubscriptionId,

    #[error("invalid prefetch: {0:?}")]
    InvalidPrefetch(String),

    #[error("heart-beat timeout")]
    HeartBeatTimeout,

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("server shutting down")]
    ShuttingDown,
}

impl ServerError {
    pub fn missing_header(command: Command, header: &'static str) -> Self {
        ServerError::MissingHeader { command, header }
    }

    /// Converts to protocol error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ServerError::Io(_) => ErrorCode::InternalError,
            ServerError::Protocol(e) => e.error_code(),
            ServerError::Core(e) => e.error_code(),
            ServerError::NotConnected => ErrorCode::NotConnected,
            ServerError::MissingLogin | ServerError::EmptyLogin | ServerError::MissingPasscode => {
                ErrorCode::AuthFailed
            }
            ServerError::MissingHeader { .. } => ErrorCode::MissingHeader,
            ServerError::InvalidSubscriptionId => ErrorCode::MissingHeader,
            ServerError::InvalidPrefetch(_) => ErrorCode::InvalidPrefetch,
            ServerError::HeartBeatTimeout => ErrorCode::HeartBeatTimeout,
            ServerError::UnknownCommand(_) => ErrorCode::UnknownCommand,
            ServerError::ShuttingDown => ErrorCode::InternalError,
        }
    }

    /// Returns whether the connection must be closed after reporting.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ServerError::ShuttingDown | ServerError::Io(_))
            || self.error_code().is_fatal()
    }

    /// Short text for the `message` header of an ERROR frame.
    pub fn summary(&self) -> String {
        match self {
            ServerError::Protocol(e) => e.summary().to_string(),
            ServerError::Core(e) => e.summary().to_string(),
            ServerError::MissingHeader { command, header } => missing_header_text(*command, header),
            ServerError::UnknownCommand(command) => format!("unknown command; {}", command),
            other => other.to_string(),
        }
    }
}

fn missing_header_text(command: Command, header: &str) -> String {
    match (command, header) {
        (Command::Subscribe, "id") => "required id field missing".to_string(),
        (Command::Unsubscribe, "id") => "unsubscribe missing session id".to_string(),
        (Command::Ack | Command::Nack, _) => format!("ack missing {}", header),
        (Command::Begin | Command::Commit | Command::Abort, _) => {
            format!("missing {} header", header)
        }
        _ => format!(
            "{} missing {}",
            command.as_str().to_ascii_lowercase(),
            header
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stompd_core::CoreError;
    use stompd_protocol::ProtocolError;

    #[test]
    fn test_fatal_classification() {
        assert!(ServerError::NotConnected.is_fatal());
        assert!(ServerError::MissingPasscode.is_fatal());
        assert!(ServerError::HeartBeatTimeout.is_fatal());
        assert!(ServerError::Protocol(ProtocolError::InvalidHeartBeat("x".into())).is_fatal());

        assert!(!ServerError::Protocol(ProtocolError::InvalidHeader { line: "x".into() }).is_fatal());
        assert!(!ServerError::missing_header(Command::Send, "destination").is_fatal());
        assert!(!ServerError::UnknownCommand("FROB".into()).is_fatal());
        assert!(!ServerError::Core(CoreError::SubscriptionNotFound { id: "s".into() }).is_fatal());
    }

    #[test]
    fn test_summaries() {
        assert_eq!(
            ServerError::missing_header(Command::Send, "destination").summary(),
            "send missing destination"
        );
        assert_eq!(
            ServerError::missing_header(Command::Subscribe, "destination").summary(),
            "subscribe missing destination"
        );
        assert_eq!(
            ServerError::missing_header(Command::Subscribe, "id").summary(),
            "required id field missing"
        );
        assert_eq!(
            ServerError::missing_header(Command::Unsubscribe, "id").summary(),
            "unsubscribe missing session id"
        );
        assert_eq!(
            ServerError::missing_header(Command::Nack, "message-id").summary(),
            "ack missing message-id"
        );
        assert_eq!(
            ServerError::missing_header(Command::Commit, "transaction").summary(),
            "missing transaction header"
        );
        assert_eq!(
            ServerError::UnknownCommand("FROB".into()).summary(),
            "unknown command; FROB"
        );
        assert_eq!(ServerError::NotConnected.summary(), "must send CONNECT first");
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(ServerError::MissingLogin.error_code(), ErrorCode::AuthFailed);
        assert_eq!(
            ServerError::InvalidPrefetch("x".into()).error_code(),
            ErrorCode::InvalidPrefetch
        );
        assert_eq!(
            ServerError::Core(CoreError::InvalidAckMode("x".into())).error_code(),
            ErrorCode::InvalidAckMode
        );
    }
}
