//! Session lifecycle for Ensemble.
//!
//! A session is one bounded, live collaboration tied to a project. This
//! crate owns:
//!
//! 1. **The model**: [`Session`], its [`SessionState`] machine, and the
//!    [`CreateSessionRequest`] that starts it all.
//! 2. **Transitions**: [`SessionLifecycle`] applies start/pause/resume/
//!    end/cancel, one at a time per session.
//! 3. **Authorization**: the predicates in [`authz`] every operation
//!    calls first, backed by the [`ProjectDirectory`] collaborator.
//! 4. **Time**: the [`Clock`] every timestamp comes from, so tests can
//!    move it.
//!
//! # How it fits in the stack
//!
//! ```text
//! Participant Layer (above)  ← joins, leaves, kicks; hears every transition through a SessionObserver
//!     ↕
//! Session Layer (this crate)  ← lifecycle state and who may change it
//!     ↕
//! Protocol Layer (below)  ← UserId, SessionId, ErrorKind
//! ```

#![allow(async_fn_in_trait)]

pub mod authz;
mod clock;
mod directory;
mod error;
mod lifecycle;
mod session;

pub use clock::{Clock, ManualClock, SystemClock};
pub use directory::{DirectoryError, ProjectDirectory, ProjectRole, StaticDirectory};
pub use error::SessionError;
pub use lifecycle::{NoParticipants, SessionLifecycle, SessionObserver, TerminationReport};
pub use session::{
    CreateSessionRequest, Session, SessionConfig, SessionState, SessionSummary, SessionType,
};
