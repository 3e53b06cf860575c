//! Per-session topic addressing.
//!
//! Every event the coordinator publishes belongs to exactly one session,
//! and within that session to one logical channel. The textual form
//! mirrors the familiar broker layout:
//!
//! ```text
//! /topic/session/{session_id}/{kind}
//! ```
//!
//! Only connections subscribed to a session ever receive its topics.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::SessionId;

/// The logical channel inside a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicKind {
    /// Chat messages.
    Chat,
    /// Transport control (play, pause, seek...).
    Playback,
    /// "User is typing" indicators.
    Typing,
    /// Online/offline transitions.
    Presence,
    /// Membership changes: join requests, permission updates, removals.
    Participants,
    /// Session lifecycle changes.
    Lifecycle,
}

impl TopicKind {
    /// The path segment used in the textual topic form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Playback => "playback",
            Self::Typing => "typing",
            Self::Presence => "presence",
            Self::Participants => "participants",
            Self::Lifecycle => "lifecycle",
        }
    }
}

/// A fully qualified topic: one channel of one session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Topic {
    pub session_id: SessionId,
    pub kind: TopicKind,
}

impl Topic {
    pub fn new(session_id: SessionId, kind: TopicKind) -> Self {
        Self { session_id, kind }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "/topic/session/{}/{}",
            self.session_id,
            self.kind.as_str()
        )
    }
}
