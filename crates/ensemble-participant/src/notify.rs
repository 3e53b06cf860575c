//! Out-of-band notifications (email, push) for invites and removals.
//!
//! Delivery belongs to another service. Ensemble hands it a
//! [`Notification`] and moves on: dispatch runs on its own task and a
//! failure is logged, never returned to the operation that caused it.

use std::sync::Arc;

use ensemble_protocol::{SessionId, UserId};
use futures_util::future::BoxFuture;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Invited {
        session_id: SessionId,
        user_id: UserId,
        invited_by: UserId,
        message: Option<String>,
    },
    Removed {
        session_id: SessionId,
        user_id: UserId,
        removed_by: UserId,
    },
}

#[derive(Debug, thiserror::Error)]
#[error("notification delivery failed: {0}")]
pub struct NotifyError(pub String);

/// The notification service.
///
/// Object safe (it returns a boxed future) so the manager can hold any
/// implementation as `Arc<dyn Notifier>`.
pub trait Notifier: Send + Sync + 'static {
    fn notify(&self, notification: Notification) -> BoxFuture<'_, Result<(), NotifyError>>;
}

/// Writes notifications to the log. The default when no delivery service
/// is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: Notification) -> BoxFuture<'_, Result<(), NotifyError>> {
        Box::pin(async move {
            tracing::info!(?notification, "notification");
            Ok(())
        })
    }
}

/// Sends `notification` in the background.
pub(crate) fn dispatch(notifier: &Arc<dyn Notifier>, notification: Notification) {
    let notifier = Arc::clone(notifier);
    tokio::spawn(async move {
        if let Err(e) = notifier.notify(notification).await {
            tracing::warn!(error = %e, "notification dropped");
        }
    });
}
