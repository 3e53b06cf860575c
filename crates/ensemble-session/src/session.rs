//! The session model and its state machine.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use ensemble_protocol::{ProjectId, Role, SessionId, UserId};
use serde::{Deserialize, Serialize};

/// Where a session is in its lifecycle.
///
/// ```text
///              start             pause
/// SCHEDULED ──────────► LIVE ◄──────────► PAUSED
///     │                  │     resume       │
///     │                  │ end          end │
///     │                  ▼                  │
///     │                ENDED ◄──────────────┘
///     │
///     └── cancel (also from LIVE / PAUSED) ──► CANCELLED
/// ```
///
/// `ENDED` and `CANCELLED` are terminal: nothing leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Scheduled,
    Live,
    Paused,
    Ended,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::Cancelled)
    }

    /// Whether joins (and join requests) are accepted in this state.
    pub fn accepts_participants(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether the state machine has an edge from `self` to `target`.
    pub fn can_transition_to(&self, target: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, target),
            (Scheduled, Live)
                | (Live, Paused)
                | (Paused, Live)
                | (Live | Paused, Ended)
                | (Scheduled | Live | Paused, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "SCHEDULED",
            Self::Live => "LIVE",
            Self::Paused => "PAUSED",
            Self::Ended => "ENDED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What kind of work the session is for. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionType {
    #[default]
    Recording,
    Mixing,
    Review,
    Rehearsal,
}

/// Limits applied when sessions are created.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Upper bound for `max_participants`.
    pub participant_limit: usize,
    /// How far in the past a scheduled start may lie and still be
    /// accepted. Covers clock skew between client and server.
    pub schedule_grace: Duration,
    pub max_title_len: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            participant_limit: 100,
            schedule_grace: Duration::minutes(5),
            max_title_len: 200,
        }
    }
}

/// Everything the caller supplies to create a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub project_id: ProjectId,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub session_type: SessionType,
    /// `None` means "now".
    #[serde(default)]
    pub scheduled_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub recording_enabled: bool,
    pub max_participants: usize,
    /// Whether non-hosts need the host's approval before joining.
    #[serde(default = "default_requires_approval")]
    pub requires_approval: bool,
}

fn default_requires_approval() -> bool {
    true
}

impl CreateSessionRequest {
    /// A request with defaults: recording type, starts now, ten seats,
    /// host approval required.
    pub fn new(project_id: ProjectId, title: impl Into<String>) -> Self {
        Self {
            project_id,
            title: title.into(),
            description: None,
            session_type: SessionType::default(),
            scheduled_start: None,
            recording_enabled: false,
            max_participants: 10,
            requires_approval: true,
        }
    }

    pub fn with_max_participants(mut self, max: usize) -> Self {
        self.max_participants = max;
        self
    }

    pub fn with_scheduled_start(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_start = Some(at);
        self
    }

    pub fn with_approval(mut self, requires_approval: bool) -> Self {
        self.requires_approval = requires_approval;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_session_type(mut self, session_type: SessionType) -> Self {
        self.session_type = session_type;
        self
    }
}

/// A collaboration session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub project_id: ProjectId,
    /// The creator. Fixed for the session's lifetime.
    pub host_id: UserId,
    pub title: String,
    pub description: Option<String>,
    pub session_type: SessionType,
    pub state: SessionState,
    pub scheduled_start: DateTime<Utc>,
    pub actual_start: Option<DateTime<Utc>>,
    pub actual_end: Option<DateTime<Utc>>,
    pub recording_enabled: bool,
    pub max_participants: usize,
    pub requires_approval: bool,
    pub created_at: DateTime<Utc>,
    pub cancel_reason: Option<String>,
}

impl Session {
    pub fn is_host(&self, user: UserId) -> bool {
        self.host_id == user
    }

    /// The role `user` has in this session. Derived from the host id,
    /// never stored.
    pub fn role_of(&self, user: UserId) -> Role {
        if self.is_host(user) {
            Role::Host
        } else {
            Role::Member
        }
    }

    /// Time between going live and ending, once both have happened.
    pub fn duration(&self) -> Option<Duration> {
        match (self.actual_start, self.actual_end) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

/// Returned by `end`: what the session amounted to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: DateTime<Utc>,
    pub duration_secs: i64,
    /// Most participants online at the same time.
    pub peak_participants: usize,
    /// Distinct participants the session ever had.
    pub total_participants: usize,
}
