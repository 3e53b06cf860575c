//! Participants for Ensemble.
//!
//! The [`ParticipantManager`] is what the rest of the system calls into
//! for anything about *who* is in a session. It composes:
//!
//! - the session lifecycle (is the session open? who is host?),
//! - the presence store and session hub (who is online, who hears about
//!   it),
//! - the [`JoinRequestCoordinator`] (host-gated admission over an
//!   [`ExpiringStore`]),
//! - the [`RtcCredentialIssuer`] (media tokens through an
//!   [`RtcProvider`]),
//! - a [`Notifier`] for invites and removals.
//!
//! The manager also implements `SessionObserver`. That is how lifecycle
//! transitions get announced, and how ending a session tears its
//! participants down, without the lifecycle depending on this crate.

#![allow(async_fn_in_trait)]

mod credentials;
mod error;
mod join_requests;
mod manager;
mod notify;
mod participant;
mod store;

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

pub use credentials::{
    CredentialConfig, HmacRtcProvider, RtcCredentialIssuer, RtcProvider, TokenRequest,
};
pub use error::{CredentialError, JoinRequestError, ParticipantError, ProviderError};
pub use join_requests::{
    JoinRequest, JoinRequestConfig, JoinRequestCoordinator, JoinRequestStatus,
};
pub use manager::{Collaborators, ParticipantManager, Standalone};
pub use notify::{LogNotifier, Notification, Notifier, NotifyError};
pub use participant::{Participant, ParticipantStatus};
pub use store::{ExpiringStore, MemoryStore, StoreError};

/// `at + d`, saturating instead of overflowing.
pub(crate) fn after(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(d)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
