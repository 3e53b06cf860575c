//! Who is online, and how to reach them.
//!
//! Three pieces, leaf-first:
//!
//! - [`Outbox`]: a bounded per-connection queue. The connection's writer
//!   task drains it; everyone else only ever calls the non-blocking
//!   [`Outbox::try_deliver`]. A consumer that falls behind is cut off
//!   rather than allowed to slow the publisher down.
//! - [`PresenceStore`]: the authoritative map of online participants per
//!   session, each with the [`ConnectionHandle`] that keeps them online.
//! - [`SessionHub`]: per-session topic subscribers and fan-out, stamping
//!   every published event with a per-session sequence number.
//!
//! Nothing here knows about permissions or lifecycle; the participant
//! layer decides *who* is registered, this crate only tracks it.

mod hub;
mod outbox;
mod store;

pub use hub::SessionHub;
pub use outbox::{DeliveryError, Outbound, Outbox, OutboxReceiver, outbox};
pub use store::{ConnectionHandle, PresenceEntry, PresenceStore};
