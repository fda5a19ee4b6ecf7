use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error codes shared by the HTTP API, the realtime transport and
/// the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AuthError,
    ProtocolContractViolation,
    CursorContractViolation,
    ForbiddenMuted,
    NotAMember,
    QueueUnavailable,
    AckTimeout,
    TransportUnavailable,
    NotAuthenticated,
    BadRequest,
    NotFound,
    RateLimited,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthError => "AUTH_ERROR",
            Self::ProtocolContractViolation => "PROTOCOL_CONTRACT_VIOLATION",
            Self::CursorContractViolation => "CURSOR_CONTRACT_VIOLATION",
            Self::ForbiddenMuted => "FORBIDDEN_MUTED",
            Self::NotAMember => "NOT_A_MEMBER",
            Self::QueueUnavailable => "QUEUE_UNAVAILABLE",
            Self::AckTimeout => "ACK_TIMEOUT",
            Self::TransportUnavailable => "TRANSPORT_UNAVAILABLE",
            Self::NotAuthenticated => "NOT_AUTHENTICATED",
            Self::BadRequest => "BAD_REQUEST",
            Self::NotFound => "NOT_FOUND",
            Self::RateLimited => "RATE_LIMITED",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatIdError {
    #[error("Empty chat id")]
    Empty,

    #[error("Malformed chat id: {0}")]
    Malformed(String),

    #[error("Unknown chat kind in id: {0}")]
    UnknownKind(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown message kind: {0}")]
pub struct UnknownMessageKind(pub String);

/// Sync response declared a different protocol generation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContractError {
    #[error("Sync protocol version mismatch: expected {expected}, got {actual:?}")]
    ProtocolVersion { expected: u32, actual: Option<u32> },

    #[error("Sync watermark field mismatch: expected {expected}, got {actual:?}")]
    WatermarkField {
        expected: &'static str,
        actual: Option<String>,
    },

    #[error("Malformed sync body: {0}")]
    MalformedBody(String),
}

/// A cursor page that must not be applied.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CursorError {
    #[error("Cursor protocol mismatch: expected {expected}, got {actual}")]
    Protocol { expected: u32, actual: u32 },

    #[error("Page belongs to chat {actual}, requested {expected}")]
    ChatMismatch { expected: String, actual: String },

    #[error("Page seq not strictly ascending at index {index}")]
    NonMonotonic { index: usize },

    #[error("Duplicate message id {0} in page")]
    DuplicateId(String),

    #[error("Malformed page body: {0}")]
    MalformedBody(String),
}
