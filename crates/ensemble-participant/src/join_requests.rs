//! Join requests: short-lived "may I come in?" records for host-gated
//! sessions.
//!
//! A request is filed PENDING, then the host approves or denies it. A
//! denial deletes the record on the spot. An approval stays until the
//! joining user consumes it or its TTL lapses, whichever comes first.
//!
//! # Expiry
//!
//! Every record carries its own `expires_at`, and that timestamp is the
//! only thing the sweep looks at. Records are written to the store with a
//! slightly longer TTL (the retention grace) so an expired request is
//! still readable, reported as EXPIRED, until the sweep removes it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ensemble_protocol::{SessionId, UserId};
use ensemble_session::Clock;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::{ExpiringStore, JoinRequestError, after};

const KEY_PREFIX: &str = "join-request:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JoinRequestStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub status: JoinRequestStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_by: Option<UserId>,
}

impl JoinRequest {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone)]
pub struct JoinRequestConfig {
    /// How long a request (and, after approval, the approval) stays
    /// usable.
    pub ttl: Duration,
    /// Extra store lifetime past `ttl`, during which an expired record is
    /// still visible to `get` and the sweep.
    pub retention: Duration,
}

impl Default for JoinRequestConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            retention: Duration::from_secs(3600),
        }
    }
}

/// Files, resolves, and sweeps join requests.
pub struct JoinRequestCoordinator<S: ExpiringStore> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    config: JoinRequestConfig,
}

impl<S: ExpiringStore> JoinRequestCoordinator<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, config: JoinRequestConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &JoinRequestConfig {
        &self.config
    }

    /// Files a PENDING request.
    ///
    /// A live pending request for the same key fails with
    /// `AlreadyPending`. A live approval is returned as is, so a user who
    /// asks again after being approved is not sent back to the queue.
    ///
    /// The write is a compare-and-set against what was read, so of two
    /// racing calls exactly one files the request.
    pub async fn create(
        &self,
        session_id: &SessionId,
        user_id: UserId,
    ) -> Result<JoinRequest, JoinRequestError> {
        let key = key(session_id, user_id);

        loop {
            let now = self.clock.now();
            let current = self.load(&key).await?;

            if let Some((_, existing)) = &current {
                if !existing.is_expired_at(now) {
                    match existing.status {
                        JoinRequestStatus::Pending => {
                            return Err(JoinRequestError::AlreadyPending {
                                session_id: session_id.clone(),
                                user_id,
                            });
                        }
                        JoinRequestStatus::Approved => return Ok(existing.clone()),
                        JoinRequestStatus::Denied | JoinRequestStatus::Expired => {}
                    }
                }
            }

            let request = JoinRequest {
                session_id: session_id.clone(),
                user_id,
                status: JoinRequestStatus::Pending,
                created_at: now,
                expires_at: after(now, self.config.ttl),
                resolved_by: None,
            };
            let expected = current.as_ref().map(|(raw, _)| raw.as_str());
            if self.save_if(&key, expected, &request).await? {
                tracing::debug!(%session_id, %user_id, "join request filed");
                return Ok(request);
            }
            tracing::debug!(%session_id, %user_id, "join request raced, re-reading");
        }
    }

    /// Approves or denies a live PENDING request. An approval gets a fresh
    /// TTL window starting now.
    pub async fn resolve(
        &self,
        session_id: &SessionId,
        user_id: UserId,
        approve: bool,
        resolved_by: UserId,
    ) -> Result<JoinRequest, JoinRequestError> {
        let key = key(session_id, user_id);
        let now = self.clock.now();
        let (raw, mut request) = self.load_live(&key, session_id, user_id, now).await?;

        let already_resolved = || JoinRequestError::AlreadyResolved {
            session_id: session_id.clone(),
            user_id,
        };
        if request.status != JoinRequestStatus::Pending {
            return Err(already_resolved());
        }

        request.resolved_by = Some(resolved_by);
        let written = if approve {
            request.status = JoinRequestStatus::Approved;
            request.expires_at = after(now, self.config.ttl);
            self.save_if(&key, Some(&raw), &request).await?
        } else {
            request.status = JoinRequestStatus::Denied;
            self.store.delete_if_eq(&key, &raw).await?
        };
        // Someone else resolved or replaced the record since the read.
        if !written {
            return Err(already_resolved());
        }

        tracing::info!(%session_id, %user_id, %resolved_by, approve, "join request resolved");
        Ok(request)
    }

    /// Uses up a live approval. Anything else is `NotFound`.
    pub async fn consume(
        &self,
        session_id: &SessionId,
        user_id: UserId,
    ) -> Result<JoinRequest, JoinRequestError> {
        let key = key(session_id, user_id);
        let now = self.clock.now();
        let (raw, request) = self.load_live(&key, session_id, user_id, now).await?;

        if request.status != JoinRequestStatus::Approved
            || !self.store.delete_if_eq(&key, &raw).await?
        {
            return Err(JoinRequestError::NotFound {
                session_id: session_id.clone(),
                user_id,
            });
        }
        Ok(request)
    }

    /// Looks a request up. A request past its TTL that the sweep has not
    /// removed yet is reported with status `Expired`.
    pub async fn get(
        &self,
        session_id: &SessionId,
        user_id: UserId,
    ) -> Result<JoinRequest, JoinRequestError> {
        let (_, mut request) =
            self.load(&key(session_id, user_id))
                .await?
                .ok_or_else(|| JoinRequestError::NotFound {
                    session_id: session_id.clone(),
                    user_id,
                })?;
        if request.is_expired_at(self.clock.now()) {
            request.status = JoinRequestStatus::Expired;
        }
        Ok(request)
    }

    /// Whether `user_id` holds a live approval for `session_id`.
    pub async fn is_approved(
        &self,
        session_id: &SessionId,
        user_id: UserId,
    ) -> Result<bool, JoinRequestError> {
        match self.get(session_id, user_id).await {
            Ok(r) => Ok(r.status == JoinRequestStatus::Approved),
            Err(JoinRequestError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Removes every record past its TTL and returns how many went.
    ///
    /// Failures on individual keys are logged and skipped. Only a failure
    /// to list the keys at all is returned.
    pub async fn sweep(&self) -> Result<usize, JoinRequestError> {
        let entries = self.store.scan_prefix(KEY_PREFIX).await?;
        let mut removed = 0;

        for (key, raw) in entries {
            let expired = match serde_json::from_str::<JoinRequest>(&raw) {
                Ok(r) => r.is_expired_at(self.clock.now()),
                Err(e) => {
                    tracing::warn!(%key, error = %e, "removing unreadable join request");
                    true
                }
            };
            if !expired {
                continue;
            }
            // Only the value that was judged expired goes. A record
            // rewritten since the scan no longer matches and survives.
            match self.store.delete_if_eq(&key, &raw).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(%key, error = %e, "sweep failed for key"),
            }
        }

        if removed > 0 {
            tracing::info!(removed, "swept expired join requests");
        }
        Ok(removed)
    }

    /// Deletes whatever request exists for the key. Returns whether one
    /// did.
    pub async fn discard(
        &self,
        session_id: &SessionId,
        user_id: UserId,
    ) -> Result<bool, JoinRequestError> {
        Ok(self.store.delete(&key(session_id, user_id)).await?)
    }

    /// Drops every request of one session, expired or not.
    pub async fn purge_session(&self, session_id: &SessionId) -> Result<usize, JoinRequestError> {
        let prefix = format!("{KEY_PREFIX}{session_id}:");
        let mut removed = 0;
        for (key, _) in self.store.scan_prefix(&prefix).await? {
            match self.store.delete(&key).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(%key, error = %e, "purge failed for key"),
            }
        }
        Ok(removed)
    }

    /// Runs [`sweep`](Self::sweep) every `interval` until the returned
    /// task is aborted.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep().await {
                    tracing::warn!(error = %e, "join request sweep failed");
                }
            }
        })
    }

    // ---- Internals ----

    /// The raw stored value alongside the decoded record. The raw form is
    /// what compare-and-set writes are checked against.
    async fn load(&self, key: &str) -> Result<Option<(String, JoinRequest)>, JoinRequestError> {
        let Some(raw) = self.store.get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(request) => Ok(Some((raw, request))),
            Err(source) => Err(JoinRequestError::Corrupt {
                key: key.to_string(),
                source,
            }),
        }
    }

    async fn load_live(
        &self,
        key: &str,
        session_id: &SessionId,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<(String, JoinRequest), JoinRequestError> {
        match self.load(key).await? {
            Some((raw, r)) if !r.is_expired_at(now) => Ok((raw, r)),
            _ => Err(JoinRequestError::NotFound {
                session_id: session_id.clone(),
                user_id,
            }),
        }
    }

    async fn save_if(
        &self,
        key: &str,
        expected: Option<&str>,
        request: &JoinRequest,
    ) -> Result<bool, JoinRequestError> {
        let raw = serde_json::to_string(request).map_err(|source| JoinRequestError::Corrupt {
            key: key.to_string(),
            source,
        })?;
        let remaining = (request.expires_at - self.clock.now())
            .to_std()
            .unwrap_or_default();
        Ok(self
            .store
            .compare_and_set(key, expected, raw, remaining + self.config.retention)
            .await?)
    }
}

fn key(session_id: &SessionId, user_id: UserId) -> String {
    format!("{KEY_PREFIX}{session_id}:{}", user_id.0)
}
