//! Error types for the broker.

use crate::types::SubscriptionId;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Main error type for broker operations.
///
/// Argument and configuration errors reject a whole command. Per-subscription
/// failures inside a batched poll or unsubscribe are reported as [`ErrorCode`]s
/// instead, so a single bad id never fails the batch.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("The command requires a channel argument")]
    NoChannel,

    #[error("The channel argument must be a string but was a {found}")]
    BadChannel { found: &'static str },

    #[error("The publish command requires a message argument")]
    NoMessage,

    #[error("The message for the publish command must be a document but was a {found}")]
    BadMessage { found: &'static str },

    #[error("The filter argument must be a document but was a {found}")]
    BadFilterType { found: &'static str },

    #[error("Invalid filter: {0}")]
    BadFilter(String),

    #[error("The projection argument must be a document but was a {found}")]
    BadProjectionType { found: &'static str },

    #[error("Invalid projection: {0}")]
    BadProjection(String),

    #[error("The command requires a subscriptionId argument")]
    NoSubscriptionId,

    #[error("The subscriptionId argument must be an ObjectId or array but was a {found}")]
    BadSubscriptionIdType { found: &'static str },

    #[error("Each subscriptionId in the array must be an ObjectId but found a {found}")]
    BadSubscriptionIdArrayType { found: &'static str },

    #[error("The timeout argument must be a number but was a {found}")]
    BadTimeout { found: &'static str },

    #[error("Publishing data events is disabled")]
    EventsDisabled,

    #[error("Subscription not found: {0}")]
    InvalidSubscriptionId(SubscriptionId),

    #[error("Poll currently active: {0}")]
    PollActive(SubscriptionId),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Unknown parameter: {0}")]
    UnknownParameter(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Command failed with code {code}: {message}")]
    CommandFailed { code: i32, message: String },
}

impl BrokerError {
    /// Stable numeric code reported by the command protocol.
    pub fn code(&self) -> i32 {
        match self {
            BrokerError::NoChannel => 18551,
            BrokerError::BadChannel { .. } => 18527,
            BrokerError::NoMessage => 18552,
            BrokerError::BadMessage { .. } => 18528,
            BrokerError::BadFilterType { .. } => 18529,
            BrokerError::BadProjectionType { .. } => 18530,
            BrokerError::BadFilter(_) => 18533,
            BrokerError::BadProjection(_) => 18534,
            BrokerError::NoSubscriptionId => 18550,
            BrokerError::BadSubscriptionIdType { .. } => 18543,
            BrokerError::BadSubscriptionIdArrayType { .. } => 18544,
            BrokerError::BadTimeout { .. } => 18535,
            BrokerError::EventsDisabled => 18560,
            BrokerError::InvalidSubscriptionId(_) => 18540,
            BrokerError::PollActive(_) => 18541,
            BrokerError::UnknownCommand(_) => 59,
            BrokerError::UnknownParameter(_) => 2,
            BrokerError::Serialization(_)
            | BrokerError::Deserialization(_)
            | BrokerError::Corruption(_)
            | BrokerError::Transport(_) => 18538,
            BrokerError::CommandFailed { code, .. } => *code,
        }
    }

    /// Per-id code for errors that belong in a batch `errors` map.
    pub fn per_id_code(&self) -> Option<ErrorCode> {
        match self {
            BrokerError::InvalidSubscriptionId(_) => Some(ErrorCode::InvalidSubscriptionId),
            BrokerError::PollActive(_) => Some(ErrorCode::PollActive),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(e: serde_json::Error) -> Self {
        BrokerError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for BrokerError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        BrokerError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for BrokerError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        BrokerError::Deserialization(e.to_string())
    }
}

/// Per-subscription failure reported inside poll and unsubscribe results.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Unknown, expired, or removed subscription.
    InvalidSubscriptionId,
    /// Another poll is already running for the subscription.
    PollActive,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidSubscriptionId => "InvalidSubscriptionId",
            ErrorCode::PollActive => "PollActive",
        }
    }

    /// Parse a code name as it appears in a command response.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "InvalidSubscriptionId" => Some(ErrorCode::InvalidSubscriptionId),
            "PollActive" => Some(ErrorCode::PollActive),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argument_codes_are_stable() {
        assert_eq!(BrokerError::NoChannel.code(), 18551);
        assert_eq!(BrokerError::BadChannel { found: "object" }.code(), 18527);
        assert_eq!(BrokerError::NoMessage.code(), 18552);
        assert_eq!(BrokerError::BadMessage { found: "string" }.code(), 18528);
        assert_eq!(BrokerError::BadTimeout { found: "string" }.code(), 18535);
        assert_eq!(BrokerError::EventsDisabled.code(), 18560);
    }

    #[test]
    fn test_per_id_codes() {
        let id = SubscriptionId::from_parts(1, 2, 3);
        assert_eq!(
            BrokerError::InvalidSubscriptionId(id).per_id_code(),
            Some(ErrorCode::InvalidSubscriptionId)
        );
        assert_eq!(BrokerError::PollActive(id).per_id_code(), Some(ErrorCode::PollActive));
        assert_eq!(BrokerError::NoChannel.per_id_code(), None);
    }

    #[test]
    fn test_error_code_names_round_trip() {
        for code in [ErrorCode::InvalidSubscriptionId, ErrorCode::PollActive] {
            assert_eq!(ErrorCode::parse(code.as_str()), Some(code));
        }
        assert_eq!(ErrorCode::parse("nope"), None);
    }

    #[test]
    fn test_messages_name_the_offending_type() {
        let msg = format!("{}", BrokerError::BadChannel { found: "object" });
        assert!(msg.contains("string"));
        assert!(msg.contains("object"));
    }
}
