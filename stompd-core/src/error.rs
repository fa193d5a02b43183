//! Core error types.

use stompd_protocol::ErrorCode;
use thiserror::Error;

/// Errors from the routing and subscription engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("destination invalid: {destination:?}")]
    InvalidDestination { destination: String },

    #[error("destination must be a topic or queue: {destination:?}")]
    UnknownDestinationType { destination: String },

    #[error("ack must be auto or client: {0:?}")]
    InvalidAckMode(String),

    #[error("subscription id already in use: {id}")]
    DuplicateSubscription { id: String },

    #[error("subscription not found: {id}")]
    SubscriptionNotFound { id: String },

    #[error("message {message_id} not awaiting ack on subscription {subscription}")]
    MessageNotFound {
        subscription: String,
        message_id: String,
    },

    #[error("transaction not found: {transaction}")]
    TransactionNotFound { transaction: String },
}

impl CoreError {
    /// Short text for the `message` header of an ERROR frame.
    pub fn summary(&self) -> &'static str {
        match self {
            CoreError::InvalidDestination { .. } => "destination invalid",
            CoreError::UnknownDestinationType { .. } => "destination must be a topic or queue",
            CoreError::InvalidAckMode(_) => "ack must be auto or client",
            CoreError::DuplicateSubscription { .. } => "subscription id already in use",
            CoreError::SubscriptionNotFound { .. } => "subscription not found",
            CoreError::MessageNotFound { .. } => "message not found",
            CoreError::TransactionNotFound { .. } => "transaction not found",
        }
    }

    /// Returns an error code suitable for protocol responses.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            CoreError::InvalidDestination { .. } => ErrorCode::InvalidDestination,
            CoreError::UnknownDestinationType { .. } => ErrorCode::InvalidDestination,
            CoreError::InvalidAckMode(_) => ErrorCode::InvalidAckMode,
            CoreError::DuplicateSubscription { .. } => ErrorCode::DuplicateSubscription,
            CoreError::SubscriptionNotFound { .. } => ErrorCode::SubscriptionNotFound,
            CoreError::MessageNotFound { .. } => ErrorCode::MessageNotFound,
            CoreError::TransactionNotFound { .. } => ErrorCode::TransactionNotFound,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_and_code() {
        let err = CoreError::UnknownDestinationType {
            destination: "exchange/a".to_string(),
        };
        assert_eq!(err.summary(), "destination must be a topic or queue");
        assert_eq!(err.error_code(), ErrorCode::InvalidDestination);
        assert!(err.to_string().contains("exchange/a"));

        let err = CoreError::TransactionNotFound {
            transaction: "tx-1".to_string(),
        };
        assert_eq!(err.summary(), "transaction not found");
        assert!(!err.error_code().is_fatal());
    }
}
