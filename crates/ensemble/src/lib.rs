//! # Ensemble
//!
//! Real-time coordinator for collaborative audio/video production sessions.
//!
//! Ensemble tracks sessions through their lifecycle, admits participants
//! (with host approval when the session asks for it), issues RTC join
//! credentials, keeps per-session presence, and fans chat, playback, and
//! typing events out to every connected participant.
//!
//! ```text
//!   client ──ws──► transport ──► hooks (identity, name, subscription, presence)
//!                                  │
//!                                  ▼
//!                               router ──► coordinator ──► participants ──► sessions
//!                                  │                          │
//!                                  ▼                          ▼
//!                              session hub ◄─────────── presence store
//!                                  │
//!   client ◄──ws── writer ◄── outbox
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ensemble::prelude::*;
//!
//! # async fn run() -> Result<(), EnsembleError> {
//! let config = EnsembleConfig::from_env()?;
//! ensemble::logging::init(config.log_json);
//!
//! let server = EnsembleServer::builder(config)
//!     .directory(StaticDirectory::new().with_member(ProjectId(1), UserId(1)))
//!     .build()
//!     .await?;
//! server.run().await
//! # }
//! ```

mod config;
mod coordinator;
mod error;
mod handler;
mod hooks;
pub mod logging;
mod router;
mod server;

pub use config::{
    ConfigError, DEFAULT_BIND_ADDRESS, DirectoryEntry, DEFAULT_IDLE_TIMEOUT_SECONDS, DEFAULT_JOIN_REQUEST_TTL_SECONDS,
    DEFAULT_OUTBOX_CAPACITY, DEFAULT_RTC_PROVIDER_TIMEOUT_MS, DEFAULT_RTC_TOKEN_TTL_SECONDS,
    DEFAULT_SWEEP_INTERVAL_SECONDS, EnsembleConfig, MIN_RTC_SECRET_LEN,
};
pub use coordinator::Coordinator;
pub use error::EnsembleError;
pub use hooks::{
    ConnectionAttributes, ConnectionContext, ConnectionHook, ConnectionLifecycleHooks,
    DisplayNameHook, IdentityStampHook, PresenceCleanupHook, SESSION_ID_HEADER, SubscriptionHook,
    USER_ID_HEADER,
};
pub use router::{Dispatch, MAX_CHAT_CHARS, RealtimeBroadcastRouter};
pub use server::{EnsembleServer, EnsembleServerBuilder};

pub mod prelude {
    pub use crate::{
        Coordinator, EnsembleConfig, EnsembleError, EnsembleServer, EnsembleServerBuilder,
        SESSION_ID_HEADER, USER_ID_HEADER,
    };
    pub use ensemble_participant::{
        JoinRequestStatus, Participant, ParticipantManager, ParticipantStatus, Standalone,
    };
    pub use ensemble_presence::ConnectionHandle;
    pub use ensemble_protocol::{
        ChatMessage, ClientFrame, CredentialGrant, Envelope, ErrorKind, Permissions,
        PermissionsPatch, PlaybackAction, PlaybackEvent, ProjectId, Role, ServerEvent, SessionId,
        Topic, TopicKind, TypingIndicator, UserId,
    };
    pub use ensemble_session::{
        Clock, CreateSessionRequest, ManualClock, ProjectDirectory, ProjectRole, Session,
        SessionState, SessionSummary, SessionType, StaticDirectory, SystemClock,
    };
}
