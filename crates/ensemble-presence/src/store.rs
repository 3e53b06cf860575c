//! The presence store: which users are online in which session, and over
//! which connection.
//!
//! A map of maps. The outer `DashMap` shards by session, so sessions never
//! contend with each other; the inner map is mutated only while holding
//! that session's shard entry, which makes every operation atomic per
//! session.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ensemble_protocol::{SessionId, UserId};
use ensemble_transport::ConnectionId;

use crate::Outbox;

/// How to reach one connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub outbox: Outbox,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, outbox: Outbox) -> Self {
        Self { id, outbox }
    }
}

/// One online participant.
#[derive(Debug, Clone)]
pub struct PresenceEntry {
    pub connection: ConnectionHandle,
    /// When this connection registered.
    pub since: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct PresenceStore {
    sessions: DashMap<SessionId, HashMap<UserId, PresenceEntry>>,
}

impl PresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `user` online over `connection`. A user has at most one live
    /// connection per session: the previous handle, if any, is returned so
    /// the caller can close it.
    pub fn register(
        &self,
        session: &SessionId,
        user: UserId,
        connection: ConnectionHandle,
        at: DateTime<Utc>,
    ) -> Option<ConnectionHandle> {
        let mut users = self.sessions.entry(session.clone()).or_default();
        users
            .insert(user, PresenceEntry { connection, since: at })
            .map(|previous| previous.connection)
    }

    /// Marks `user` offline and returns the handle that was removed.
    ///
    /// With `only_if`, nothing happens unless the registered connection is
    /// that one. A disconnect from a connection that has since been
    /// replaced must not knock the newer connection offline.
    ///
    /// Safe to call any number of times; later calls return `None`.
    pub fn deregister(
        &self,
        session: &SessionId,
        user: UserId,
        only_if: Option<ConnectionId>,
    ) -> Option<ConnectionHandle> {
        let removed = {
            let mut users = self.sessions.get_mut(session)?;
            let matches = users
                .get(&user)
                .is_some_and(|e| only_if.is_none_or(|id| e.connection.id == id));
            if matches {
                users.remove(&user).map(|e| e.connection)
            } else {
                None
            }
        };
        self.sessions.remove_if(session, |_, users| users.is_empty());
        removed
    }

    pub fn is_online(&self, session: &SessionId, user: UserId) -> bool {
        self.sessions
            .get(session)
            .is_some_and(|users| users.contains_key(&user))
    }

    /// Online users of `session`, in id order.
    pub fn online_users(&self, session: &SessionId) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .sessions
            .get(session)
            .map(|users| users.keys().copied().collect())
            .unwrap_or_default();
        users.sort();
        users
    }

    pub fn count(&self, session: &SessionId) -> usize {
        self.sessions.get(session).map(|u| u.len()).unwrap_or(0)
    }

    pub fn entry(&self, session: &SessionId, user: UserId) -> Option<PresenceEntry> {
        self.sessions.get(session)?.get(&user).cloned()
    }

    pub fn handle(&self, session: &SessionId, user: UserId) -> Option<ConnectionHandle> {
        self.entry(session, user).map(|e| e.connection)
    }

    /// Removes every online user of `session` and returns their handles.
    pub fn drain_session(&self, session: &SessionId) -> Vec<(UserId, ConnectionHandle)> {
        self.sessions
            .remove(session)
            .map(|(_, users)| {
                users
                    .into_iter()
                    .map(|(user, e)| (user, e.connection))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox;

    fn handle(id: u64) -> ConnectionHandle {
        let (tx, _rx) = outbox(4);
        ConnectionHandle::new(ConnectionId::new(id), tx)
    }

    fn sid() -> SessionId {
        SessionId::new("s1")
    }

    #[test]
    fn test_register_then_query() {
        let store = PresenceStore::new();

        assert!(store.register(&sid(), UserId(1), handle(1), Utc::now()).is_none());
        store.register(&sid(), UserId(2), handle(2), Utc::now());

        assert!(store.is_online(&sid(), UserId(1)));
        assert_eq!(store.count(&sid()), 2);
        assert_eq!(store.online_users(&sid()), vec![UserId(1), UserId(2)]);
        assert_eq!(store.handle(&sid(), UserId(2)).unwrap().id, ConnectionId::new(2));
    }

    #[test]
    fn test_register_again_returns_previous_handle_without_double_count() {
        let store = PresenceStore::new();
        store.register(&sid(), UserId(1), handle(1), Utc::now());

        let previous = store.register(&sid(), UserId(1), handle(7), Utc::now());

        assert_eq!(previous.unwrap().id, ConnectionId::new(1));
        assert_eq!(store.count(&sid()), 1);
    }

    #[test]
    fn test_deregister_twice_is_idempotent() {
        let store = PresenceStore::new();
        store.register(&sid(), UserId(1), handle(1), Utc::now());

        assert!(store.deregister(&sid(), UserId(1), None).is_some());
        assert!(store.deregister(&sid(), UserId(1), None).is_none());
        assert!(!store.is_online(&sid(), UserId(1)));
        assert_eq!(store.count(&sid()), 0);
    }

    #[test]
    fn test_deregister_stale_connection_leaves_newer_one() {
        let store = PresenceStore::new();
        store.register(&sid(), UserId(1), handle(1), Utc::now());
        store.register(&sid(), UserId(1), handle(2), Utc::now());

        let removed = store.deregister(&sid(), UserId(1), Some(ConnectionId::new(1)));

        assert!(removed.is_none());
        assert!(store.is_online(&sid(), UserId(1)));
    }

    #[test]
    fn test_deregister_unknown_session_is_none() {
        let store = PresenceStore::new();

        assert!(store.deregister(&SessionId::new("ghost"), UserId(1), None).is_none());
    }

    #[test]
    fn test_sessions_are_isolated() {
        let store = PresenceStore::new();
        store.register(&sid(), UserId(1), handle(1), Utc::now());

        assert!(!store.is_online(&SessionId::new("other"), UserId(1)));
        assert_eq!(store.count(&SessionId::new("other")), 0);
    }

    #[test]
    fn test_drain_session_returns_all_and_empties() {
        let store = PresenceStore::new();
        store.register(&sid(), UserId(1), handle(1), Utc::now());
        store.register(&sid(), UserId(2), handle(2), Utc::now());

        let mut drained = store.drain_session(&sid());
        drained.sort_by_key(|(u, _)| *u);

        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].0, UserId(1));
        assert_eq!(store.count(&sid()), 0);
        assert!(store.drain_session(&sid()).is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_deregister_converges() {
        let store = std::sync::Arc::new(PresenceStore::new());
        store.register(&sid(), UserId(1), handle(1), Utc::now());

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let store = std::sync::Arc::clone(&store);
                tokio::spawn(async move { store.deregister(&sid(), UserId(1), None).is_some() })
            })
            .collect();

        let mut removed = 0;
        for t in tasks {
            if t.await.unwrap() {
                removed += 1;
            }
        }
        assert_eq!(removed, 1);
        assert!(!store.is_online(&sid(), UserId(1)));
    }
}
