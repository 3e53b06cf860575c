//! Routes inbound frames from one connection.
//!
//! The sender of every frame is whoever the connection's attributes say
//! it is. Nothing in a frame body can change that: chat and playback
//! events are stamped with the connection's user id, display name, and
//! the server's clock before they are fanned out. Connections without a
//! user id still get to chat, as "Anonymous".
//!
//! Direct replies (acks, errors) go back on the connection's own outbox.
//! Broadcasts go through the session hub to every subscriber of the
//! session, best effort.
//!
//! Session-management frames (start, kick, resolve a join request, ...)
//! act on the connection's own session as the connection's own user. The
//! coordinator decides whether that user may.

use std::sync::Arc;

use ensemble_participant::{Collaborators, ParticipantError, Standalone};
use ensemble_presence::ConnectionHandle;
use ensemble_protocol::{
    ChatMessage, ClientFrame, Envelope, PlaybackEvent, ProtocolError, ServerEvent, SessionId,
    TopicKind, TypingIndicator, UserId,
};
use ensemble_session::CreateSessionRequest;

use crate::{ConnectionContext, Coordinator, EnsembleError};

/// Longest chat message accepted, in characters.
pub const MAX_CHAT_CHARS: usize = 4000;

/// What the handler should do after a frame was routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Continue,
    /// The client said goodbye.
    Close { reason: String },
}

pub struct RealtimeBroadcastRouter<B: Collaborators = Standalone> {
    coordinator: Arc<Coordinator<B>>,
}

impl<B: Collaborators> RealtimeBroadcastRouter<B> {
    pub fn new(coordinator: Arc<Coordinator<B>>) -> Self {
        Self { coordinator }
    }

    pub async fn route(&self, ctx: &ConnectionContext, frame: ClientFrame) -> Dispatch {
        let result = match frame {
            ClientFrame::Heartbeat { client_time } => {
                let server_time = u64::try_from(self.coordinator.clock().now().timestamp_millis())
                    .unwrap_or_default();
                reply(ctx, ServerEvent::HeartbeatAck { client_time, server_time });
                Ok(())
            }
            ClientFrame::Join => self.join(ctx).await,
            ClientFrame::Leave => self.leave(ctx).await,
            ClientFrame::RefreshToken => self.refresh_token(ctx).await,
            ClientFrame::Chat { content } => self.chat(ctx, content).await,
            ClientFrame::Playback {
                action,
                position_ms,
                track_id,
            } => self.attached(ctx).await.map(|session_id| {
                let event = PlaybackEvent {
                    action,
                    position_ms,
                    track_id,
                    triggered_by: ctx.attributes.user_id,
                    triggered_by_name: ctx.attributes.sender_name(),
                    triggered_at: self.coordinator.clock().now(),
                };
                self.broadcast(session_id, TopicKind::Playback, ServerEvent::Playback(event), None);
            }),
            ClientFrame::Typing { is_typing } => self.attached(ctx).await.map(|session_id| {
                let event = TypingIndicator {
                    user_id: ctx.attributes.user_id,
                    display_name: ctx.attributes.sender_name(),
                    is_typing,
                };
                self.broadcast(session_id, TopicKind::Typing, ServerEvent::Typing(event), Some(ctx));
            }),
            ClientFrame::Disconnect { reason } => {
                tracing::info!(conn_id = %ctx.id, %reason, "client disconnecting");
                reply(ctx, ServerEvent::DisconnectAck { reason: reason.clone() });
                return Dispatch::Close { reason };
            }
            ClientFrame::CreateSession {
                project_id,
                title,
                description,
                max_participants,
                requires_approval,
            } => {
                let mut request = CreateSessionRequest::new(project_id, title);
                request.description = description;
                if let Some(max) = max_participants {
                    request = request.with_max_participants(max);
                }
                if let Some(gated) = requires_approval {
                    request = request.with_approval(gated);
                }
                self.create_session(ctx, request).await
            }
            frame => self.manage(ctx, frame).await,
        };

        if let Err(e) = result {
            reply_error(ctx, &e);
        }
        Dispatch::Continue
    }

    // ---- Participant frames ----

    async fn join(&self, ctx: &ConnectionContext) -> Result<(), EnsembleError> {
        let (user_id, session_id) = identified(ctx, "join")?;
        let handle = ConnectionHandle::new(ctx.id, ctx.outbox.clone());
        let participant = self.coordinator.join(session_id, user_id, handle).await?;
        let Some(credential) = participant.credential else {
            return Err(ProtocolError::InvalidMessage("join produced no credential".into()).into());
        };
        reply(
            ctx,
            ServerEvent::Joined {
                user_id,
                role: participant.role,
                permissions: participant.permissions,
                credential,
            },
        );
        Ok(())
    }

    async fn leave(&self, ctx: &ConnectionContext) -> Result<(), EnsembleError> {
        let (user_id, session_id) = identified(ctx, "leave")?;
        self.coordinator.leave(session_id, user_id).await?;
        reply(ctx, ServerEvent::Left { user_id });
        Ok(())
    }

    async fn refresh_token(&self, ctx: &ConnectionContext) -> Result<(), EnsembleError> {
        let (user_id, session_id) = identified(ctx, "refresh a token")?;
        let credential = self.coordinator.refresh_token(session_id, user_id).await?;
        reply(ctx, ServerEvent::TokenRefreshed { credential });
        Ok(())
    }

    // ---- Session management frames ----

    async fn create_session(
        &self,
        ctx: &ConnectionContext,
        request: CreateSessionRequest,
    ) -> Result<(), EnsembleError> {
        let Some(host) = ctx.attributes.user_id else {
            return Err(EnsembleError::Unauthenticated(
                "anonymous connections cannot create a session; send x-user-id".into(),
            ));
        };
        let session = self.coordinator.create_session(request, host).await?;
        reply(
            ctx,
            ServerEvent::SessionCreated {
                session_id: session.id,
                project_id: session.project_id,
                state: session.state.to_string(),
            },
        );
        Ok(())
    }

    /// Host controls on the connection's own session. Their outcome is
    /// broadcast on the session topic by the layer that applies them, so
    /// only `Invite` gets a direct reply.
    async fn manage(&self, ctx: &ConnectionContext, frame: ClientFrame) -> Result<(), EnsembleError> {
        let (actor, session_id) = identified(ctx, "manage a session")?;
        let c = &self.coordinator;
        match frame {
            ClientFrame::StartSession => {
                c.start_session(session_id, actor).await?;
            }
            ClientFrame::PauseSession => {
                c.pause_session(session_id, actor).await?;
            }
            ClientFrame::ResumeSession => {
                c.resume_session(session_id, actor).await?;
            }
            ClientFrame::EndSession => {
                c.end_session(session_id, actor).await?;
            }
            ClientFrame::CancelSession { reason } => {
                c.cancel_session(session_id, actor, reason).await?;
            }
            ClientFrame::Invite { user_id, message } => {
                c.invite(session_id, user_id, actor, message).await?;
                reply(ctx, ServerEvent::Invited { user_id });
            }
            ClientFrame::ResolveJoinRequest { user_id, approve } => {
                c.resolve_join_request(session_id, user_id, approve, actor).await?;
            }
            ClientFrame::Kick { user_id } => {
                c.remove_participant(session_id, user_id, actor).await?;
            }
            ClientFrame::UpdatePermissions {
                user_id,
                permissions,
            } => {
                c.update_permissions(session_id, user_id, permissions, actor)
                    .await?;
            }
            other => {
                return Err(ProtocolError::InvalidMessage(format!(
                    "unexpected frame for session management: {other:?}"
                ))
                .into());
            }
        }
        tracing::debug!(conn_id = %ctx.id, %session_id, user_id = %actor, "session management frame applied");
        Ok(())
    }

    // ---- Broadcast frames ----

    async fn chat(&self, ctx: &ConnectionContext, content: String) -> Result<(), EnsembleError> {
        let session_id = self.attached(ctx).await?;
        let content = content.trim();
        if content.is_empty() {
            return Err(ProtocolError::InvalidMessage("chat message is empty".into()).into());
        }
        if content.chars().count() > MAX_CHAT_CHARS {
            return Err(ProtocolError::InvalidMessage(format!(
                "chat message exceeds {MAX_CHAT_CHARS} characters"
            ))
            .into());
        }

        let message = ChatMessage {
            sender_id: ctx.attributes.user_id,
            sender_name: ctx.attributes.sender_name(),
            content: content.to_string(),
            sent_at: self.coordinator.clock().now(),
        };
        self.broadcast(session_id, TopicKind::Chat, ServerEvent::Chat(message), None);
        Ok(())
    }

    /// The session this connection is subscribed to. Broadcast frames
    /// from a connection that is not attached to a live session have
    /// nowhere to go. An identified sender's standing is checked again on
    /// every frame, since the host may have removed them after they
    /// connected.
    async fn attached<'c>(
        &self,
        ctx: &'c ConnectionContext,
    ) -> Result<&'c SessionId, EnsembleError> {
        let session_id = match (&ctx.attributes.session_id, ctx.attributes.subscribed) {
            (Some(session_id), true) => session_id,
            _ => {
                return Err(ProtocolError::InvalidMessage(
                    "connection is not attached to a session".into(),
                )
                .into());
            }
        };
        if let Some(user_id) = ctx.attributes.user_id {
            if self.coordinator.participants().is_removed(session_id, user_id).await {
                return Err(ParticipantError::Removed {
                    session_id: session_id.clone(),
                    user_id,
                }
                .into());
            }
        }
        Ok(session_id)
    }

    fn broadcast(
        &self,
        session_id: &SessionId,
        kind: TopicKind,
        event: ServerEvent,
        excluding: Option<&ConnectionContext>,
    ) {
        let delivered =
            self.coordinator
                .hub()
                .publish(session_id, kind, event, excluding.map(|ctx| ctx.id));
        tracing::trace!(%session_id, topic = kind.as_str(), delivered, "broadcast");
    }
}

/// Sends `event` to this connection only.
pub(crate) fn reply(ctx: &ConnectionContext, event: ServerEvent) {
    if let Err(e) = ctx.outbox.try_deliver(Envelope::direct(event)) {
        tracing::debug!(conn_id = %ctx.id, error = %e, "reply dropped");
    }
}

/// Reports a failed request back to the connection that made it.
pub(crate) fn reply_error(ctx: &ConnectionContext, err: &EnsembleError) {
    tracing::debug!(conn_id = %ctx.id, error = %err, "request failed");
    reply(ctx, ServerEvent::error(err.kind(), err.to_string()));
}

fn identified<'c>(
    ctx: &'c ConnectionContext,
    action: &str,
) -> Result<(UserId, &'c SessionId), EnsembleError> {
    ctx.attributes.identity().ok_or_else(|| {
        EnsembleError::Unauthenticated(format!(
            "anonymous connections cannot {action}; send x-user-id and x-session-id"
        ))
    })
}
