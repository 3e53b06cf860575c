//! Errors from the participant layer.

use std::time::Duration;

use ensemble_protocol::{ErrorKind, SessionId, UserId};
use ensemble_session::SessionError;

use crate::StoreError;

/// Errors from the join-request coordinator.
#[derive(Debug, thiserror::Error)]
pub enum JoinRequestError {
    /// No live request under this key: never filed, already resolved and
    /// consumed, denied, or expired.
    #[error("no join request for user {user_id} in session {session_id}")]
    NotFound { session_id: SessionId, user_id: UserId },

    #[error("user {user_id} already has a pending join request for session {session_id}")]
    AlreadyPending { session_id: SessionId, user_id: UserId },

    /// The request was already approved; it cannot be resolved twice.
    #[error("join request for user {user_id} in session {session_id} is already resolved")]
    AlreadyResolved { session_id: SessionId, user_id: UserId },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("corrupt join request record under {key}: {source}")]
    Corrupt {
        key: String,
        source: serde_json::Error,
    },
}

impl JoinRequestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::AlreadyPending { .. } => ErrorKind::AlreadyPending,
            Self::AlreadyResolved { .. } => ErrorKind::InvalidTransition,
            Self::Store(_) => ErrorKind::ExternalProviderFailure,
            Self::Corrupt { .. } => ErrorKind::Internal,
        }
    }
}

/// Errors from the RTC provider.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("rtc provider rejected the request: {0}")]
    Rejected(String),

    #[error("rtc provider unavailable: {0}")]
    Unavailable(String),
}

/// Errors from issuing a credential.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("rtc provider timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl CredentialError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::ExternalProviderFailure
    }
}

/// Errors from [`ParticipantManager`](crate::ParticipantManager)
/// operations.
#[derive(Debug, thiserror::Error)]
pub enum ParticipantError {
    /// Session lookup, authorization, or lifecycle state.
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    JoinRequest(#[from] JoinRequestError),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error("user {user_id} is not a participant of session {session_id}")]
    NotFound { session_id: SessionId, user_id: UserId },

    #[error("session {session_id} is full ({max} participants)")]
    SessionFull { session_id: SessionId, max: usize },

    /// The session is host-gated and the user has no approval yet. A
    /// pending request has been filed on their behalf.
    #[error("user {user_id} needs host approval to join session {session_id}")]
    ApprovalRequired { session_id: SessionId, user_id: UserId },

    #[error("user {user_id} is not online in session {session_id}")]
    NotOnline { session_id: SessionId, user_id: UserId },

    #[error("user {user_id} was removed from session {session_id}")]
    Removed { session_id: SessionId, user_id: UserId },

    /// Host-gated sessions are not open to unidentified connections.
    #[error("session {session_id} requires an identified user")]
    AnonymousNotAllowed { session_id: SessionId },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ParticipantError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Session(e) => e.kind(),
            Self::JoinRequest(e) => e.kind(),
            Self::Credential(e) => e.kind(),
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::SessionFull { .. } => ErrorKind::SessionFull,
            Self::ApprovalRequired { .. } => ErrorKind::ApprovalRequired,
            Self::NotOnline { .. } => ErrorKind::NotOnline,
            Self::Removed { .. } | Self::AnonymousNotAllowed { .. } => ErrorKind::PermissionDenied,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
        }
    }
}
