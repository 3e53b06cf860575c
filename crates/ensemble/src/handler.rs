//! Per-connection handler: hooks, reader loop, and writer task.
//!
//! Each accepted connection gets its own Tokio task running this handler.
//! The flow is:
//!   1. Run the connect hooks → identity stamped, topic subscribed
//!   2. Queue a ConnectAck
//!   3. Spawn the writer: drains the connection's outbox onto the socket
//!   4. Loop: receive frames → route them, until the client leaves, goes
//!      idle, or the writer stops (kicked, replaced, session ended)
//!   5. Run the disconnect hooks, then let the writer flush and close

use std::sync::Arc;
use std::time::Duration;

use ensemble_participant::Collaborators;
use ensemble_presence::{Outbound, OutboxReceiver, outbox};
use ensemble_protocol::{ClientFrame, Codec, ServerEvent};
use ensemble_transport::{Connection, WebSocketConnection};

use crate::router::{Dispatch, reply, reply_error};
use crate::server::ServerState;
use crate::{ConnectionContext, ConnectionLifecycleHooks, EnsembleError};

/// How long the writer gets to flush after the reader stopped.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Runs the disconnect hooks if the handler exits without doing so,
/// including when it panics. `Drop` is synchronous, so the hooks run on a
/// fire-and-forget task.
struct DisconnectGuard {
    hooks: Arc<ConnectionLifecycleHooks>,
    ctx: Arc<ConnectionContext>,
    armed: bool,
}

impl DisconnectGuard {
    /// Runs the disconnect hooks now, on this task.
    async fn finish(mut self) {
        self.armed = false;
        self.hooks.run_disconnect(&self.ctx).await;
    }
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let hooks = Arc::clone(&self.hooks);
        let ctx = Arc::clone(&self.ctx);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                hooks.run_disconnect(&ctx).await;
            });
        }
    }
}

/// Handles a single connection from accept to close.
pub(crate) async fn handle_connection<B, C>(
    conn: WebSocketConnection,
    state: Arc<ServerState<B, C>>,
) -> Result<(), EnsembleError>
where
    B: Collaborators,
    C: Codec,
{
    let conn = Arc::new(conn);
    let conn_id = conn.id();
    tracing::debug!(%conn_id, "handling new connection");

    // --- Step 1: Connect hooks ---
    let (tx, receiver) = outbox(state.outbox_capacity);
    let mut ctx = ConnectionContext::new(conn_id, conn.handshake_headers().clone(), tx);
    let failed = state.hooks.run_connect(&mut ctx).await;
    if failed > 0 {
        tracing::debug!(%conn_id, failed, "connect hooks failed");
    }
    let ctx = Arc::new(ctx);
    let guard = DisconnectGuard {
        hooks: Arc::clone(&state.hooks),
        ctx: Arc::clone(&ctx),
        armed: true,
    };

    reply(
        &ctx,
        ServerEvent::ConnectAck {
            user_id: ctx.attributes.user_id,
            session_id: ctx.attributes.session_id.clone(),
            anonymous: ctx.attributes.is_anonymous(),
            subscribed: ctx.attributes.subscribed,
        },
    );

    // --- Step 2: Writer ---
    let mut writer = tokio::spawn(write_loop(Arc::clone(&conn), receiver, Arc::clone(&state)));
    let mut writer_done = false;

    // --- Step 3: Reader ---
    let reason = loop {
        let received = tokio::select! {
            received = tokio::time::timeout(state.idle_timeout, conn.recv()) => received,
            _ = &mut writer => {
                writer_done = true;
                break "outbox closed".to_string();
            }
        };

        let data = match received {
            Ok(Ok(Some(data))) => data,
            Ok(Ok(None)) => {
                tracing::info!(%conn_id, "connection closed cleanly");
                break "client closed".to_string();
            }
            Ok(Err(e)) => {
                tracing::debug!(%conn_id, error = %e, "recv error");
                break "receive failed".to_string();
            }
            Err(_) => {
                tracing::info!(%conn_id, "connection idle, closing");
                break "idle timeout".to_string();
            }
        };

        let frame: ClientFrame = match state.codec.decode(&data) {
            Ok(frame) => frame,
            Err(e) => {
                reply_error(&ctx, &e.into());
                continue;
            }
        };

        if let Dispatch::Close { reason } = state.router.route(&ctx, frame).await {
            break reason;
        }
    };

    // --- Step 4: Teardown ---
    guard.finish().await;
    ctx.outbox.close(reason.clone());
    if !writer_done && tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        tracing::debug!(%conn_id, "writer did not drain in time");
        writer.abort();
    }

    tracing::debug!(%conn_id, %reason, "connection finished");
    Ok(())
}

/// Drains the outbox onto the socket until the outbox closes or the
/// socket fails, then closes the socket.
async fn write_loop<B, C>(
    conn: Arc<WebSocketConnection>,
    mut receiver: OutboxReceiver,
    state: Arc<ServerState<B, C>>,
) where
    B: Collaborators,
    C: Codec,
{
    let conn_id = conn.id();
    while let Some(message) = receiver.next().await {
        match message {
            Outbound::Event(envelope) => {
                let bytes = match state.codec.encode(&envelope) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::warn!(%conn_id, error = %e, "failed to encode event");
                        continue;
                    }
                };
                if let Err(e) = conn.send(&bytes).await {
                    tracing::debug!(%conn_id, error = %e, "send failed");
                    break;
                }
            }
            Outbound::Close { reason } => {
                tracing::debug!(%conn_id, %reason, "closing connection");
                break;
            }
        }
    }

    if let Err(e) = conn.close().await {
        tracing::trace!(%conn_id, error = %e, "close after writer stopped");
    }
}
