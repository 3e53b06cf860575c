//! The participant record.

use chrono::{DateTime, Utc};
use ensemble_protocol::{CredentialGrant, Permissions, Role, SessionId, UserId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParticipantStatus {
    /// Invited by the host, never joined.
    Invited,
    /// Has joined at least once. May be online or offline.
    Active,
}

/// One user's membership in one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub role: Role,
    pub status: ParticipantStatus,
    pub permissions: Permissions,
    pub online: bool,
    pub joined_at: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub invited_by: Option<UserId>,
    pub invite_message: Option<String>,
    /// The credential issued on the latest join or refresh. Cleared when
    /// the participant goes offline.
    pub credential: Option<CredentialGrant>,
}

impl Participant {
    pub(crate) fn invited(
        session_id: SessionId,
        user_id: UserId,
        invited_by: UserId,
        message: Option<String>,
    ) -> Self {
        Self {
            session_id,
            user_id,
            role: Role::Member,
            status: ParticipantStatus::Invited,
            permissions: Permissions::member(),
            online: false,
            joined_at: None,
            last_seen: None,
            invited_by: Some(invited_by),
            invite_message: message,
            credential: None,
        }
    }

    pub(crate) fn joining(session_id: SessionId, user_id: UserId, role: Role) -> Self {
        let permissions = match role {
            Role::Host => Permissions::host(),
            Role::Member => Permissions::member(),
        };
        Self {
            session_id,
            user_id,
            role,
            status: ParticipantStatus::Active,
            permissions,
            online: false,
            joined_at: None,
            last_seen: None,
            invited_by: None,
            invite_message: None,
            credential: None,
        }
    }

    pub fn is_host(&self) -> bool {
        self.role == Role::Host
    }
}
