//! Wire protocol for Ensemble.
//!
//! This crate defines the "language" that collaborators' clients and the
//! coordinator speak:
//!
//! - **Identity** ([`UserId`], [`SessionId`], [`ProjectId`]): the keys
//!   every other layer is indexed by.
//! - **Addressing** ([`Topic`], [`TopicKind`]): per-session channels that
//!   events are published on.
//! - **Frames and events** ([`ClientFrame`], [`ServerEvent`], [`Envelope`]):
//!   what travels inbound and outbound.
//! - **Shared DTOs** ([`Permissions`], [`Role`], [`CredentialGrant`]):
//!   values that appear both in domain state and on the wire.
//! - **Errors** ([`ErrorKind`], [`ProtocolError`]): the failure taxonomy
//!   shared by every layer, and what can go wrong while encoding.
//! - **Codec** ([`Codec`] trait, [`JsonCodec`]): how messages are turned
//!   into bytes.
//!
//! # Architecture
//!
//! ```text
//! Transport (bytes) → Protocol (ClientFrame / Envelope) → Router (identity-stamped fan-out)
//! ```

mod codec;
mod error;
mod ids;
mod messages;
mod topic;

pub use codec::Codec;
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use error::{ErrorKind, ProtocolError};
pub use ids::{ProjectId, SessionId, UserId};
pub use messages::{
    ChatMessage, ClientFrame, CredentialGrant, Envelope, Permissions,
    PermissionsPatch, PlaybackAction, PlaybackEvent, Role, RtcRole,
    ServerEvent, TypingIndicator, ANONYMOUS_SENDER,
};
pub use topic::{Topic, TopicKind};
