//! Frames clients send, events the server publishes, and the small value
//! types both sides share.
//!
//! Inbound traffic is a bare [`ClientFrame`]. Outbound traffic is always
//! wrapped in an [`Envelope`] carrying a per-session sequence number, a
//! server timestamp, and the topic it was published on.
//!
//! Note what inbound frames do NOT carry: a sender. Whoever is on the
//! other end of the connection is known from the handshake, and the
//! router stamps that identity onto everything it fans out. A client that
//! puts `"senderId"` in a chat frame simply has the field ignored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ErrorKind, ProjectId, SessionId, Topic, UserId};

/// Display name stamped on messages from connections without a user id.
pub const ANONYMOUS_SENDER: &str = "Anonymous";

// ---------------------------------------------------------------------------
// Roles and permissions
// ---------------------------------------------------------------------------

/// A participant's role within one session.
///
/// Exactly one user per session is the `Host`: the one recorded as the
/// session's host id. Everybody else is a `Member`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Host,
    Member,
}

/// The role a credential grants on the RTC provider's media channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RtcRole {
    /// May publish audio/video.
    Publisher,
    /// Receive-only.
    Subscriber,
}

impl RtcRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Publisher => "publisher",
            Self::Subscriber => "subscriber",
        }
    }
}

/// What a participant is allowed to do inside a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permissions {
    pub can_share_audio: bool,
    pub can_share_video: bool,
    pub can_control_playback: bool,
    pub can_approve_files: bool,
}

impl Permissions {
    /// Everything allowed. Always what the host gets.
    pub fn host() -> Self {
        Self {
            can_share_audio: true,
            can_share_video: true,
            can_control_playback: true,
            can_approve_files: true,
        }
    }

    /// Default for members: on mic and camera, hands off the transport
    /// and the file approvals until the host says otherwise.
    pub fn member() -> Self {
        Self {
            can_share_audio: true,
            can_share_video: true,
            can_control_playback: false,
            can_approve_files: false,
        }
    }

    /// Applies a partial update. Fields the patch leaves as `None` keep
    /// their current value.
    pub fn apply(&mut self, patch: &PermissionsPatch) {
        if let Some(v) = patch.can_share_audio {
            self.can_share_audio = v;
        }
        if let Some(v) = patch.can_share_video {
            self.can_share_video = v;
        }
        if let Some(v) = patch.can_control_playback {
            self.can_control_playback = v;
        }
        if let Some(v) = patch.can_approve_files {
            self.can_approve_files = v;
        }
    }

    /// The media role a credential should carry for these permissions.
    pub fn rtc_role(&self) -> RtcRole {
        if self.can_share_audio || self.can_share_video {
            RtcRole::Publisher
        } else {
            RtcRole::Subscriber
        }
    }
}

impl Default for Permissions {
    fn default() -> Self {
        Self::member()
    }
}

/// A partial permission update. Absent fields are left unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionsPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_share_audio: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_share_video: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_control_playback: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_approve_files: Option<bool>,
}

impl PermissionsPatch {
    /// Returns `true` if the patch would change nothing.
    pub fn is_empty(&self) -> bool {
        self.can_share_audio.is_none()
            && self.can_share_video.is_none()
            && self.can_control_playback.is_none()
            && self.can_approve_files.is_none()
    }
}

// ---------------------------------------------------------------------------
// RTC credentials
// ---------------------------------------------------------------------------

/// A time-boxed credential scoping one user to one session's media channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialGrant {
    /// Opaque token produced by the RTC provider.
    pub token: String,
    /// Media channel name. Always the session id.
    pub channel: String,
    pub uid: UserId,
    pub role: RtcRole,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CredentialGrant {
    /// Seconds between issue and expiry.
    pub fn ttl_secs(&self) -> i64 {
        (self.expires_at - self.issued_at).num_seconds()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// Transport-control actions. Clients reconcile playback state from the
/// latest event they received, so these are applied last-write-wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackAction {
    Play,
    Pause,
    Stop,
    Seek,
    Rewind,
    FastForward,
    Loop,
}

/// A frame sent by a client over its session connection.
///
/// `#[serde(tag = "type")]` gives the internally tagged form clients send:
/// `{ "type": "Chat", "content": "nice take" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    /// Keep-alive. Echoed back with the server's clock.
    Heartbeat { client_time: u64 },

    /// Join the session this connection was opened for.
    Join,

    /// Leave gracefully. The participant record is kept.
    Leave,

    /// Ask for a fresh RTC credential before the current one lapses.
    RefreshToken,

    /// Chat message to everybody in the session.
    Chat { content: String },

    /// Transport control for everybody in the session.
    Playback {
        action: PlaybackAction,
        #[serde(default)]
        position_ms: Option<u64>,
        #[serde(default)]
        track_id: Option<String>,
    },

    /// Typing indicator.
    Typing { is_typing: bool },

    /// "I'm going away." The server acknowledges and closes.
    Disconnect {
        #[serde(default)]
        reason: String,
    },

    // ---- Session management ----
    //
    // Everything below acts on the connection's own session (except
    // `CreateSession`) on behalf of the connection's own user. Host-only
    // actions from anyone else fail with a permission error.
    /// Schedule a new session hosted by this connection's user. Needs a
    /// user id but no session id.
    CreateSession {
        project_id: ProjectId,
        title: String,
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        max_participants: Option<usize>,
        #[serde(default)]
        requires_approval: Option<bool>,
    },

    StartSession,

    PauseSession,

    ResumeSession,

    EndSession,

    CancelSession {
        #[serde(default)]
        reason: String,
    },

    Invite {
        user_id: UserId,
        #[serde(default)]
        message: Option<String>,
    },

    /// Approve or deny a pending join request.
    ResolveJoinRequest { user_id: UserId, approve: bool },

    /// Remove a participant from the session.
    Kick { user_id: UserId },

    UpdatePermissions {
        user_id: UserId,
        permissions: PermissionsPatch,
    },
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// A chat message after the router stamped the sender onto it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// `None` for anonymous connections.
    pub sender_id: Option<UserId>,
    pub sender_name: String,
    pub content: String,
    pub sent_at: DateTime<Utc>,
}

/// A playback-control event after the router stamped the trigger onto it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackEvent {
    pub action: PlaybackAction,
    pub position_ms: Option<u64>,
    pub track_id: Option<String>,
    pub triggered_by: Option<UserId>,
    pub triggered_by_name: String,
    pub triggered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingIndicator {
    pub user_id: Option<UserId>,
    pub display_name: String,
    pub is_typing: bool,
}

/// Everything the server sends to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// Sent once, right after the connection is accepted. `anonymous`
    /// means the handshake lacked a usable user id or session id; such a
    /// connection can chat but cannot join.
    ConnectAck {
        user_id: Option<UserId>,
        session_id: Option<SessionId>,
        anonymous: bool,
        /// Whether the connection follows its session's events. A user
        /// the host removed, or an outsider, is not subscribed.
        #[serde(default)]
        subscribed: bool,
    },

    /// Reply to `ClientFrame::Disconnect`, sent just before closing.
    DisconnectAck { reason: String },

    HeartbeatAck { client_time: u64, server_time: u64 },

    /// Reply to a successful `Join`.
    Joined {
        user_id: UserId,
        role: Role,
        permissions: Permissions,
        credential: CredentialGrant,
    },

    /// Reply to `Leave`.
    Left { user_id: UserId },

    /// Reply to `RefreshToken`.
    TokenRefreshed { credential: CredentialGrant },

    /// Reply to `CreateSession`.
    SessionCreated {
        session_id: SessionId,
        project_id: ProjectId,
        state: String,
    },

    /// Reply to `Invite`.
    Invited { user_id: UserId },

    Chat(ChatMessage),

    Playback(PlaybackEvent),

    Typing(TypingIndicator),

    /// A participant came online or went offline.
    Presence {
        user_id: UserId,
        online: bool,
        at: DateTime<Utc>,
    },

    /// A non-host asked to join a host-gated session.
    JoinRequested {
        user_id: UserId,
        expires_at: DateTime<Utc>,
    },

    /// The host approved or denied a join request.
    JoinResolved { user_id: UserId, approved: bool },

    PermissionsUpdated {
        user_id: UserId,
        permissions: Permissions,
    },

    ParticipantRemoved { user_id: UserId, removed_by: UserId },

    /// The session moved to a new lifecycle state.
    SessionStateChanged { state: String, changed_by: UserId },

    /// Something the client asked for failed.
    Error {
        code: u16,
        kind: ErrorKind,
        message: String,
    },
}

impl ServerEvent {
    /// Builds an `Error` event from a kind and message.
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            code: kind.code(),
            kind,
            message: message.into(),
        }
    }
}

/// The outbound wrapper around every [`ServerEvent`].
///
/// `seq` increases monotonically per session, so a client can tell it
/// missed events (the fan-out is best effort). Direct replies that are
/// not published on a session topic carry `seq: 0` and no topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub seq: u64,
    /// Server wall clock, milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<Topic>,
    pub payload: ServerEvent,
}

impl Envelope {
    /// A reply addressed to one connection only.
    pub fn direct(payload: ServerEvent) -> Self {
        Self {
            seq: 0,
            timestamp_ms: Utc::now().timestamp_millis(),
            topic: None,
            payload,
        }
    }
}
