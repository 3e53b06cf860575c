//! Errors from the session layer.

use ensemble_protocol::{ErrorKind, SessionId, UserId};

use crate::{DirectoryError, SessionState};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session {0} not found")]
    NotFound(SessionId),

    /// `action` names the operation, e.g. `"pause"`.
    #[error("user {user_id} may not {action}")]
    PermissionDenied { user_id: UserId, action: &'static str },

    #[error("cannot {action} session {session_id} while it is {from}")]
    InvalidTransition {
        session_id: SessionId,
        from: SessionState,
        action: &'static str,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::Directory(_) => ErrorKind::ExternalProviderFailure,
        }
    }
}
