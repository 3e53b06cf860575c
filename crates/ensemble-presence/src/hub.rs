//! Per-session topic fan-out.
//!
//! Each session has one channel: a subscriber list plus a sequence
//! counter. `publish` stamps the event with the next sequence number and
//! pushes it into every subscriber's [`Outbox`] without waiting. Delivery
//! is best effort: a subscriber whose outbox is full or closed is dropped
//! from the channel and everybody else still gets the event.

use std::collections::BTreeMap;

use chrono::Utc;
use dashmap::DashMap;
use ensemble_protocol::{Envelope, ServerEvent, SessionId, Topic, TopicKind, UserId};
use ensemble_transport::ConnectionId;

use crate::Outbox;

#[derive(Debug)]
struct Subscriber {
    /// `None` for anonymous connections.
    user: Option<UserId>,
    outbox: Outbox,
}

#[derive(Debug, Default)]
struct Channel {
    seq: u64,
    subscribers: BTreeMap<ConnectionId, Subscriber>,
}

/// Subscriber registry and fan-out for every session topic.
#[derive(Debug, Default)]
pub struct SessionHub {
    channels: DashMap<SessionId, Channel>,
}

impl SessionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an anonymous connection to `session`'s topic. Re-subscribing
    /// replaces the outbox.
    pub fn subscribe(&self, session: &SessionId, connection: ConnectionId, outbox: Outbox) {
        self.subscribe_as(session, connection, None, outbox);
    }

    /// Adds a connection on behalf of `user`, so it can later be found by
    /// [`evict_user`](Self::evict_user).
    pub fn subscribe_as(
        &self,
        session: &SessionId,
        connection: ConnectionId,
        user: Option<UserId>,
        outbox: Outbox,
    ) {
        self.channels
            .entry(session.clone())
            .or_default()
            .subscribers
            .insert(connection, Subscriber { user, outbox });
        tracing::debug!(%session, %connection, ?user, "subscribed");
    }

    /// Unsubscribes and closes every connection `user` has on `session`.
    /// Returns how many there were.
    pub fn evict_user(&self, session: &SessionId, user: UserId, reason: &str) -> usize {
        let Some(mut channel) = self.channels.get_mut(session) else {
            return 0;
        };
        let mut evicted = 0;
        channel.subscribers.retain(|_, s| {
            if s.user != Some(user) {
                return true;
            }
            s.outbox.close(reason);
            evicted += 1;
            false
        });
        evicted
    }

    /// Removes a connection. The channel (and its sequence counter) stays
    /// around until [`close_session`](Self::close_session).
    pub fn unsubscribe(&self, session: &SessionId, connection: ConnectionId) -> bool {
        self.channels
            .get_mut(session)
            .is_some_and(|mut c| c.subscribers.remove(&connection).is_some())
    }

    pub fn subscriber_count(&self, session: &SessionId) -> usize {
        self.channels
            .get(session)
            .map(|c| c.subscribers.len())
            .unwrap_or(0)
    }

    /// Publishes `event` on `session`'s `kind` topic, skipping `except`.
    /// Returns how many subscribers it was delivered to.
    pub fn publish(
        &self,
        session: &SessionId,
        kind: TopicKind,
        event: ServerEvent,
        except: Option<ConnectionId>,
    ) -> usize {
        let Some(mut channel) = self.channels.get_mut(session) else {
            return 0;
        };

        channel.seq += 1;
        let envelope = Envelope {
            seq: channel.seq,
            timestamp_ms: Utc::now().timestamp_millis(),
            topic: Some(Topic::new(session.clone(), kind)),
            payload: event,
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (id, subscriber) in &channel.subscribers {
            if Some(*id) == except {
                continue;
            }
            match subscriber.outbox.try_deliver(envelope.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::debug!(%session, connection = %id, error = %e, "dropping subscriber");
                    dead.push(*id);
                }
            }
        }
        for id in dead {
            channel.subscribers.remove(&id);
        }
        delivered
    }

    /// Tells every subscriber to close and forgets the channel. Returns
    /// how many subscribers there were.
    pub fn close_session(&self, session: &SessionId, reason: &str) -> usize {
        let Some((_, channel)) = self.channels.remove(session) else {
            return 0;
        };
        for subscriber in channel.subscribers.values() {
            subscriber.outbox.close(reason);
        }
        channel.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use ensemble_protocol::UserId;

    use super::*;
    use crate::{Outbound, OutboxReceiver, outbox};

    fn sid() -> SessionId {
        SessionId::new("s1")
    }

    fn left() -> ServerEvent {
        ServerEvent::Left { user_id: UserId(1) }
    }

    async fn next_envelope(rx: &mut OutboxReceiver) -> Envelope {
        match rx.next().await {
            Some(Outbound::Event(env)) => env,
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers_with_topic() {
        let hub = SessionHub::new();
        let (a, mut ra) = outbox(4);
        let (b, mut rb) = outbox(4);
        hub.subscribe(&sid(), ConnectionId::new(1), a);
        hub.subscribe(&sid(), ConnectionId::new(2), b);

        let n = hub.publish(&sid(), TopicKind::Chat, left(), None);

        assert_eq!(n, 2);
        let env = next_envelope(&mut ra).await;
        assert_eq!(env.topic.unwrap().to_string(), "/topic/session/s1/chat");
        assert_eq!(next_envelope(&mut rb).await.payload, left());
    }

    #[tokio::test]
    async fn test_publish_seq_increases_per_session() {
        let hub = SessionHub::new();
        let (a, mut ra) = outbox(4);
        hub.subscribe(&sid(), ConnectionId::new(1), a);

        hub.publish(&sid(), TopicKind::Chat, left(), None);
        hub.publish(&sid(), TopicKind::Typing, left(), None);

        assert_eq!(next_envelope(&mut ra).await.seq, 1);
        assert_eq!(next_envelope(&mut ra).await.seq, 2);
    }

    #[tokio::test]
    async fn test_publish_except_skips_sender() {
        let hub = SessionHub::new();
        let (a, _ra) = outbox(4);
        let (b, _rb) = outbox(4);
        hub.subscribe(&sid(), ConnectionId::new(1), a);
        hub.subscribe(&sid(), ConnectionId::new(2), b);

        let n = hub.publish(&sid(), TopicKind::Typing, left(), Some(ConnectionId::new(1)));

        assert_eq!(n, 1);
    }

    #[tokio::test]
    async fn test_publish_drops_full_subscriber_but_delivers_to_others() {
        let hub = SessionHub::new();
        let (slow, _slow_rx) = outbox(1);
        let (fast, mut fast_rx) = outbox(8);
        hub.subscribe(&sid(), ConnectionId::new(1), slow);
        hub.subscribe(&sid(), ConnectionId::new(2), fast);

        hub.publish(&sid(), TopicKind::Chat, left(), None);
        let n = hub.publish(&sid(), TopicKind::Chat, left(), None);

        assert_eq!(n, 1);
        assert_eq!(hub.subscriber_count(&sid()), 1);
        assert_eq!(next_envelope(&mut fast_rx).await.seq, 1);
        assert_eq!(next_envelope(&mut fast_rx).await.seq, 2);
    }

    #[test]
    fn test_publish_to_unknown_session_delivers_nothing() {
        let hub = SessionHub::new();

        assert_eq!(hub.publish(&sid(), TopicKind::Chat, left(), None), 0);
    }

    #[tokio::test]
    async fn test_close_session_closes_every_subscriber() {
        let hub = SessionHub::new();
        let (a, mut ra) = outbox(4);
        hub.subscribe(&sid(), ConnectionId::new(1), a);

        assert_eq!(hub.close_session(&sid(), "session ended"), 1);

        assert_eq!(
            ra.next().await,
            Some(Outbound::Close {
                reason: "session ended".into()
            })
        );
        assert_eq!(hub.subscriber_count(&sid()), 0);
        assert_eq!(hub.close_session(&sid(), "again"), 0);
    }

    #[test]
    fn test_unsubscribe() {
        let hub = SessionHub::new();
        let (a, _ra) = outbox(4);
        hub.subscribe(&sid(), ConnectionId::new(1), a);

        assert!(hub.unsubscribe(&sid(), ConnectionId::new(1)));
        assert!(!hub.unsubscribe(&sid(), ConnectionId::new(1)));
        assert_eq!(hub.subscriber_count(&sid()), 0);
    }

    #[tokio::test]
    async fn test_evict_user_closes_only_that_users_connections() {
        let hub = SessionHub::new();
        let (first, mut first_rx) = outbox(4);
        let (second, mut second_rx) = outbox(4);
        let (other, mut other_rx) = outbox(4);
        hub.subscribe_as(&sid(), ConnectionId::new(1), Some(UserId(2)), first);
        hub.subscribe_as(&sid(), ConnectionId::new(2), Some(UserId(2)), second);
        hub.subscribe_as(&sid(), ConnectionId::new(3), Some(UserId(1)), other);

        assert_eq!(hub.evict_user(&sid(), UserId(2), "removed"), 2);
        hub.publish(&sid(), TopicKind::Chat, left(), None);

        let closed = Some(Outbound::Close {
            reason: "removed".into(),
        });
        assert_eq!(first_rx.next().await, closed);
        assert_eq!(second_rx.next().await, closed);
        assert_eq!(next_envelope(&mut other_rx).await.seq, 1);
        assert_eq!(hub.subscriber_count(&sid()), 1);
    }

    #[test]
    fn test_evict_user_ignores_anonymous_subscribers() {
        let hub = SessionHub::new();
        let (a, _ra) = outbox(4);
        hub.subscribe(&sid(), ConnectionId::new(1), a);

        assert_eq!(hub.evict_user(&sid(), UserId(2), "removed"), 0);
        assert_eq!(hub.subscriber_count(&sid()), 1);
    }
}
