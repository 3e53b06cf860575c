//! Connection lifecycle hooks.
//!
//! When a connection opens, the handler builds a [`ConnectionContext`] and
//! runs every registered [`ConnectionHook`] in order. When it closes, the
//! hooks run again in reverse order, so the last thing set up is the
//! first thing torn down.
//!
//! ```text
//!   connect:     IdentityStamp → DisplayName → Subscription → PresenceCleanup
//!   disconnect:  PresenceCleanup → Subscription → DisplayName → IdentityStamp
//! ```
//!
//! Each hook runs inside its own error and panic boundary. A failing hook
//! is logged and the rest still run: a broken cleanup step must never
//! keep the transport from finishing its teardown.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use ensemble_participant::{Collaborators, ParticipantManager};
use ensemble_presence::Outbox;
use ensemble_protocol::{ANONYMOUS_SENDER, ErrorKind, SessionId, UserId};
use ensemble_session::{ProjectDirectory, SessionError};
use ensemble_transport::{ConnectionId, HandshakeHeaders};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;

use crate::EnsembleError;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const SESSION_ID_HEADER: &str = "x-session-id";

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Server-side attributes of one connection. Identity is written here by
/// [`IdentityStampHook`] at connect time and only ever read afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionAttributes {
    pub user_id: Option<UserId>,
    pub session_id: Option<SessionId>,
    /// Resolved through the project directory, never taken from the
    /// client.
    pub display_name: Option<String>,
    /// Whether the connection was subscribed to its session's topic.
    pub subscribed: bool,
}

impl ConnectionAttributes {
    /// Both halves of the identity, or `None` for anonymous connections.
    pub fn identity(&self) -> Option<(UserId, &SessionId)> {
        Some((self.user_id?, self.session_id.as_ref()?))
    }

    pub fn is_anonymous(&self) -> bool {
        self.identity().is_none()
    }

    /// The name stamped on outgoing chat and playback events.
    pub fn sender_name(&self) -> String {
        match (&self.display_name, self.user_id) {
            (Some(name), Some(_)) => name.clone(),
            (None, Some(user)) => user.to_string(),
            (_, None) => ANONYMOUS_SENDER.to_string(),
        }
    }
}

pub struct ConnectionContext {
    pub id: ConnectionId,
    pub headers: HandshakeHeaders,
    pub attributes: ConnectionAttributes,
    /// Queue drained by the connection's writer task.
    pub outbox: Outbox,
}

impl ConnectionContext {
    pub fn new(id: ConnectionId, headers: HandshakeHeaders, outbox: Outbox) -> Self {
        Self {
            id,
            headers,
            attributes: ConnectionAttributes::default(),
            outbox,
        }
    }
}

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

/// One step of connection setup and teardown.
///
/// Object safe, so hooks of different types can share one ordered list.
pub trait ConnectionHook: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn on_connect<'a>(
        &'a self,
        _ctx: &'a mut ConnectionContext,
    ) -> BoxFuture<'a, Result<(), EnsembleError>> {
        async { Ok(()) }.boxed()
    }

    fn on_disconnect<'a>(
        &'a self,
        _ctx: &'a ConnectionContext,
    ) -> BoxFuture<'a, Result<(), EnsembleError>> {
        async { Ok(()) }.boxed()
    }
}

/// Reads identity out of the handshake headers.
///
/// Missing headers leave the connection anonymous. A user id that is not
/// a number is logged and treated as missing.
#[derive(Debug, Clone)]
pub struct IdentityStampHook {
    user_header: String,
    session_header: String,
}

impl IdentityStampHook {
    pub fn new() -> Self {
        Self {
            user_header: USER_ID_HEADER.to_string(),
            session_header: SESSION_ID_HEADER.to_string(),
        }
    }

    /// Reads identity from differently named headers.
    pub fn with_headers(user: &str, session: &str) -> Self {
        Self {
            user_header: user.to_string(),
            session_header: session.to_string(),
        }
    }

    fn stamp(&self, ctx: &mut ConnectionContext) {
        let conn_id = ctx.id;
        let user_id = ctx.headers.get(&self.user_header).and_then(|raw| {
            raw.parse::<UserId>()
                .inspect_err(|e| {
                    tracing::warn!(%conn_id, value = raw, error = %e, "malformed user id header");
                })
                .ok()
        });
        let attributes = &mut ctx.attributes;
        attributes.user_id = user_id;
        attributes.session_id = ctx.headers.get(&self.session_header).map(SessionId::new);

        match attributes.identity() {
            Some((user_id, session_id)) => {
                tracing::debug!(%conn_id, %user_id, %session_id, "identity stamped");
            }
            None => tracing::info!(%conn_id, "connection accepted anonymously"),
        }
    }
}

impl Default for IdentityStampHook {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionHook for IdentityStampHook {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn on_connect<'a>(
        &'a self,
        ctx: &'a mut ConnectionContext,
    ) -> BoxFuture<'a, Result<(), EnsembleError>> {
        self.stamp(ctx);
        async { Ok(()) }.boxed()
    }
}

/// Looks the stamped user's display name up in the project directory.
/// Users the directory has no name for go by their user id.
pub struct DisplayNameHook<B: Collaborators> {
    participants: Arc<ParticipantManager<B>>,
}

impl<B: Collaborators> DisplayNameHook<B> {
    pub fn new(participants: Arc<ParticipantManager<B>>) -> Self {
        Self { participants }
    }
}

impl<B: Collaborators> ConnectionHook for DisplayNameHook<B> {
    fn name(&self) -> &'static str {
        "display-name"
    }

    fn on_connect<'a>(
        &'a self,
        ctx: &'a mut ConnectionContext,
    ) -> BoxFuture<'a, Result<(), EnsembleError>> {
        async move {
            let Some(user_id) = ctx.attributes.user_id else {
                return Ok(());
            };
            let directory = self.participants.sessions().directory();
            ctx.attributes.display_name = directory
                .display_name(user_id)
                .await
                .map_err(SessionError::from)?;
            Ok(())
        }
        .boxed()
    }
}

/// Subscribes the connection to its session's topic, so it hears chat,
/// playback, presence, and lifecycle events.
///
/// Connections naming a session that does not exist or has finished are
/// left unsubscribed. So are connections whose user may not follow the
/// session: someone the host removed, an outsider to the project, or an
/// anonymous connection to a host-gated session.
pub struct SubscriptionHook<B: Collaborators> {
    participants: Arc<ParticipantManager<B>>,
}

impl<B: Collaborators> SubscriptionHook<B> {
    pub fn new(participants: Arc<ParticipantManager<B>>) -> Self {
        Self { participants }
    }
}

impl<B: Collaborators> ConnectionHook for SubscriptionHook<B> {
    fn name(&self) -> &'static str {
        "subscription"
    }

    fn on_connect<'a>(
        &'a self,
        ctx: &'a mut ConnectionContext,
    ) -> BoxFuture<'a, Result<(), EnsembleError>> {
        async move {
            let Some(session_id) = ctx.attributes.session_id.clone() else {
                return Ok(());
            };
            let outcome = self
                .participants
                .subscribe(&session_id, ctx.attributes.user_id, ctx.id, ctx.outbox.clone())
                .await;
            match outcome {
                Ok(()) => {
                    ctx.attributes.subscribed = true;
                    Ok(())
                }
                Err(e) if matches!(e.kind(), ErrorKind::PermissionDenied | ErrorKind::InvalidTransition) => {
                    tracing::info!(conn_id = %ctx.id, %session_id, error = %e, "subscription refused");
                    Ok(())
                }
                Err(e) => Err(e.into()),
            }
        }
        .boxed()
    }

    fn on_disconnect<'a>(
        &'a self,
        ctx: &'a ConnectionContext,
    ) -> BoxFuture<'a, Result<(), EnsembleError>> {
        if let (true, Some(session_id)) = (ctx.attributes.subscribed, &ctx.attributes.session_id) {
            self.participants.hub().unsubscribe(session_id, ctx.id);
        }
        async { Ok(()) }.boxed()
    }
}

/// Takes the participant offline when their connection goes away.
pub struct PresenceCleanupHook<B: Collaborators> {
    participants: Arc<ParticipantManager<B>>,
}

impl<B: Collaborators> PresenceCleanupHook<B> {
    pub fn new(participants: Arc<ParticipantManager<B>>) -> Self {
        Self { participants }
    }
}

impl<B: Collaborators> ConnectionHook for PresenceCleanupHook<B> {
    fn name(&self) -> &'static str {
        "presence-cleanup"
    }

    fn on_disconnect<'a>(
        &'a self,
        ctx: &'a ConnectionContext,
    ) -> BoxFuture<'a, Result<(), EnsembleError>> {
        async move {
            let Some((user_id, session_id)) = ctx.attributes.identity() else {
                return Ok(());
            };
            let went_offline = self
                .participants
                .handle_disconnect(session_id, user_id, Some(ctx.id))
                .await?;
            tracing::debug!(conn_id = %ctx.id, %user_id, %session_id, went_offline, "presence cleaned up");
            Ok(())
        }
        .boxed()
    }
}

// ---------------------------------------------------------------------------
// Hook list
// ---------------------------------------------------------------------------

/// An ordered list of hooks.
#[derive(Default)]
pub struct ConnectionLifecycleHooks {
    hooks: Vec<Arc<dyn ConnectionHook>>,
}

impl ConnectionLifecycleHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard set: identity, display name, subscription, then
    /// presence cleanup.
    pub fn standard<B: Collaborators>(participants: &Arc<ParticipantManager<B>>) -> Self {
        Self::new()
            .with(IdentityStampHook::new())
            .with(DisplayNameHook::new(Arc::clone(participants)))
            .with(SubscriptionHook::new(Arc::clone(participants)))
            .with(PresenceCleanupHook::new(Arc::clone(participants)))
    }

    pub fn with(mut self, hook: impl ConnectionHook) -> Self {
        self.hooks.push(Arc::new(hook));
        self
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Runs every connect hook in registration order. Returns how many
    /// failed.
    pub async fn run_connect(&self, ctx: &mut ConnectionContext) -> usize {
        let mut failed = 0;
        for hook in &self.hooks {
            let outcome = AssertUnwindSafe(hook.on_connect(ctx)).catch_unwind().await;
            if !report(hook.name(), "connect", ctx.id, outcome) {
                failed += 1;
            }
        }
        failed
    }

    /// Runs every disconnect hook in reverse registration order. Returns
    /// how many failed.
    pub async fn run_disconnect(&self, ctx: &ConnectionContext) -> usize {
        let mut failed = 0;
        for hook in self.hooks.iter().rev() {
            let outcome = AssertUnwindSafe(hook.on_disconnect(ctx)).catch_unwind().await;
            if !report(hook.name(), "disconnect", ctx.id, outcome) {
                failed += 1;
            }
        }
        failed
    }
}

fn report(
    hook: &'static str,
    phase: &'static str,
    conn_id: ConnectionId,
    outcome: std::thread::Result<Result<(), EnsembleError>>,
) -> bool {
    match outcome {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::warn!(%conn_id, hook, phase, error = %e, "connection hook failed");
            false
        }
        Err(_) => {
            tracing::error!(%conn_id, hook, phase, "connection hook panicked");
            false
        }
    }
}
