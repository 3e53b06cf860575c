//! Bounded per-connection send queues.
//!
//! Every connection gets one outbox. Publishers push with
//! [`Outbox::try_deliver`], which never waits: if the queue is full the
//! consumer is considered dead, the outbox is killed, and the connection's
//! writer stops at its next poll. This is the disconnect-on-overflow
//! policy; one slow client cannot hold up a session's fan-out.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use ensemble_protocol::Envelope;
use tokio::sync::{Notify, mpsc};

/// What a connection's writer task receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Event(Envelope),
    /// Stop writing and close the connection.
    Close { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// The queue was full; the outbox has been killed.
    #[error("outbox overflowed, connection dropped")]
    Overflow,
    /// The consumer is gone or the outbox was already killed.
    #[error("outbox closed")]
    Closed,
}

/// Sending half. Cheap to clone; all clones feed the same queue.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Outbound>,
    killed: Arc<Kill>,
}

/// Receiving half, owned by the connection's writer task.
#[derive(Debug)]
pub struct OutboxReceiver {
    rx: mpsc::Receiver<Outbound>,
    killed: Arc<Kill>,
}

#[derive(Debug, Default)]
struct Kill {
    flag: AtomicBool,
    notify: Notify,
}

impl Kill {
    fn trigger(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            // notify_one stores a permit, so a receiver that is not
            // currently waiting still sees it.
            self.notify.notify_one();
        }
    }

    fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Creates an outbox holding at most `capacity` undelivered messages.
pub fn outbox(capacity: usize) -> (Outbox, OutboxReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let killed = Arc::new(Kill::default());
    (
        Outbox {
            tx,
            killed: Arc::clone(&killed),
        },
        OutboxReceiver { rx, killed },
    )
}

impl Outbox {
    /// Queues `envelope` without waiting.
    pub fn try_deliver(&self, envelope: Envelope) -> Result<(), DeliveryError> {
        if self.killed.is_set() {
            return Err(DeliveryError::Closed);
        }
        match self.tx.try_send(Outbound::Event(envelope)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.killed.trigger();
                Err(DeliveryError::Overflow)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DeliveryError::Closed),
        }
    }

    /// Asks the writer to close the connection after flushing what is
    /// already queued. If the queue is full the outbox is killed instead.
    pub fn close(&self, reason: impl Into<String>) {
        let msg = Outbound::Close {
            reason: reason.into(),
        };
        if self.tx.try_send(msg).is_err() {
            self.killed.trigger();
        }
    }

    /// Cuts the connection off immediately, dropping anything queued.
    pub fn kill(&self) {
        self.killed.trigger();
    }

    pub fn is_closed(&self) -> bool {
        self.killed.is_set() || self.tx.is_closed()
    }

    /// Whether two handles feed the same queue.
    pub fn same_channel(&self, other: &Outbox) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

impl OutboxReceiver {
    /// The next message, or `None` once the outbox is killed or every
    /// sender is gone.
    pub async fn next(&mut self) -> Option<Outbound> {
        if self.killed.is_set() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.killed.notify.notified() => None,
            msg = self.rx.recv() => msg,
        }
    }
}
