//! Error types shared across the protocol boundary.
//!
//! Each crate in Ensemble defines its own error enum, but callers need to
//! tell failures apart the same way regardless of which layer produced
//! them. [`ErrorKind`] is that common vocabulary: every crate-level error
//! can report its kind, and the kind is what goes on the wire.

use serde::{Deserialize, Serialize};

/// Classification of every failure a caller can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// A session, participant, or join request id could not be resolved.
    NotFound,
    /// The caller lacks the role the operation needs.
    PermissionDenied,
    /// The session's lifecycle state does not allow the operation.
    InvalidTransition,
    /// The session is at its participant limit.
    SessionFull,
    /// A host-gated session was joined without a prior approval.
    ApprovalRequired,
    /// A join request for the same key is already pending.
    AlreadyPending,
    /// The operation needs the participant to be online.
    NotOnline,
    /// The RTC provider, the expiring store, or the project directory
    /// failed or timed out.
    ExternalProviderFailure,
    /// The request itself was malformed.
    InvalidRequest,
    /// The connection carries no usable identity for the operation.
    Unauthenticated,
    /// Anything else.
    Internal,
}

impl ErrorKind {
    /// HTTP-style status code used in `ServerEvent::Error`.
    pub fn code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::Unauthenticated => 401,
            Self::PermissionDenied => 403,
            Self::NotFound => 404,
            Self::InvalidTransition
            | Self::SessionFull
            | Self::AlreadyPending => 409,
            Self::NotOnline => 412,
            Self::ApprovalRequired => 428,
            Self::Internal => 500,
            Self::ExternalProviderFailure => 503,
        }
    }
}

/// Errors that can occur in the protocol layer.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed.
    #[cfg(feature = "json")]
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// Deserialization failed: malformed JSON, an unknown frame `type`,
    /// or a missing field.
    #[cfg(feature = "json")]
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// The frame decoded but violates protocol rules (empty chat content,
    /// oversized payload).
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

impl ProtocolError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::InvalidRequest
    }
}
