//! Unified error type for the Ensemble server.

use ensemble_participant::{JoinRequestError, ParticipantError};
use ensemble_protocol::{ErrorKind, ProtocolError};
use ensemble_session::SessionError;
use ensemble_transport::TransportError;

use crate::ConfigError;

/// Top-level error that wraps all crate-specific errors.
///
/// The `#[from]` attribute on each variant auto-generates `From` impls,
/// so `?` converts layer errors as they bubble up to the coordinator and
/// the connection handler.
#[derive(Debug, thiserror::Error)]
pub enum EnsembleError {
    /// A transport-level error (bind, accept, send, recv).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A frame could not be encoded or decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A lifecycle or authorization failure.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// A participant operation failed.
    #[error(transparent)]
    Participant(#[from] ParticipantError),

    /// A join-request operation failed outside of a participant call.
    #[error(transparent)]
    JoinRequest(#[from] JoinRequestError),

    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The connection has no identity for an operation that needs one.
    #[error("{0}")]
    Unauthenticated(String),
}

impl EnsembleError {
    /// The taxonomy entry reported to clients.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(_) | Self::Config(_) => ErrorKind::Internal,
            Self::Protocol(e) => e.kind(),
            Self::Session(e) => e.kind(),
            Self::Participant(e) => e.kind(),
            Self::JoinRequest(e) => e.kind(),
            Self::Unauthenticated(_) => ErrorKind::Unauthenticated,
        }
    }
}

#[cfg(test)]
mod tests {
    use ensemble_protocol::{SessionId, UserId};

    use super::*;

    #[test]
    fn test_from_transport_error() {
        let err = TransportError::ConnectionClosed("gone".into());
        let ensemble_err: EnsembleError = err.into();
        assert!(matches!(ensemble_err, EnsembleError::Transport(_)));
        assert!(ensemble_err.to_string().contains("gone"));
        assert_eq!(ensemble_err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_from_protocol_error() {
        let err = ProtocolError::InvalidMessage("bad".into());
        let ensemble_err: EnsembleError = err.into();
        assert!(matches!(ensemble_err, EnsembleError::Protocol(_)));
        assert_eq!(ensemble_err.kind(), ErrorKind::InvalidRequest);
    }

    #[test]
    fn test_from_session_error_keeps_kind() {
        let err = SessionError::NotFound(SessionId::new("nope"));
        let ensemble_err: EnsembleError = err.into();
        assert!(matches!(ensemble_err, EnsembleError::Session(_)));
        assert_eq!(ensemble_err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_from_participant_error_keeps_kind() {
        let err = ParticipantError::SessionFull {
            session_id: SessionId::new("s"),
            max: 2,
        };
        let ensemble_err: EnsembleError = err.into();
        assert_eq!(ensemble_err.kind(), ErrorKind::SessionFull);
    }

    #[test]
    fn test_from_join_request_error_keeps_kind() {
        let err = JoinRequestError::NotFound {
            session_id: SessionId::new("s"),
            user_id: UserId(3),
        };
        let ensemble_err: EnsembleError = err.into();
        assert_eq!(ensemble_err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_from_config_error() {
        let err = ConfigError::MissingVar("ENSEMBLE_RTC_SECRET".into());
        let ensemble_err: EnsembleError = err.into();
        assert!(matches!(ensemble_err, EnsembleError::Config(_)));
        assert!(ensemble_err.to_string().contains("ENSEMBLE_RTC_SECRET"));
    }
}
