//! The participant manager: invite, join, leave, kick, permissions, and
//! token refresh.
//!
//! # Locking
//!
//! Each session has a roster (its participant records plus summary
//! counters) behind its own `tokio::sync::Mutex`. Every operation that
//! changes who is in a session or online in it runs under that lock, and
//! updates the [`PresenceStore`] while holding it, so the roster's
//! `online` flags and the presence store never disagree.
//!
//! Lock order is always session (held by `SessionLifecycle` during `end`
//! and `cancel`) → roster → presence shard. The manager never asks the
//! lifecycle for anything while it holds a roster lock.
//!
//! Joining holds the roster lock across the RTC provider call. That call
//! is bounded by the issuer's timeout, and holding the lock is what makes
//! the capacity check and the presence registration atomic.

use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::Arc;

use dashmap::DashMap;
use ensemble_presence::{ConnectionHandle, Outbox, PresenceStore, SessionHub};
use ensemble_protocol::{
    CredentialGrant, PermissionsPatch, Role, ServerEvent, SessionId, TopicKind, UserId,
};
use ensemble_session::{
    Clock, ProjectDirectory, Session, SessionError, SessionLifecycle, SessionObserver,
    SessionState, StaticDirectory, TerminationReport, authz,
};
use ensemble_transport::ConnectionId;
use tokio::sync::Mutex;

use crate::notify::dispatch;
use crate::{
    ExpiringStore, HmacRtcProvider, JoinRequest, JoinRequestCoordinator, JoinRequestError,
    JoinRequestStatus, LogNotifier, MemoryStore, Notification, Notifier, Participant,
    ParticipantError, ParticipantStatus, RtcCredentialIssuer, RtcProvider,
};

/// The external services a [`ParticipantManager`] is built over.
///
/// Bundled into one trait so the manager carries a single type parameter.
pub trait Collaborators: Send + Sync + 'static {
    type Directory: ProjectDirectory;
    type Store: ExpiringStore;
    type Provider: RtcProvider;
}

/// Everything in-process: the memory store and the HMAC provider, over
/// any project directory (a [`StaticDirectory`] unless told otherwise).
pub struct Standalone<D = StaticDirectory>(PhantomData<fn() -> D>);

impl<D: ProjectDirectory> Collaborators for Standalone<D> {
    type Directory = D;
    type Store = MemoryStore;
    type Provider = HmacRtcProvider;
}

#[derive(Debug, Default)]
struct Roster {
    participants: HashMap<UserId, Participant>,
    /// Everyone who ever joined, including people since removed.
    ever_joined: HashSet<UserId>,
    peak_online: usize,
    /// Set once the session is terminated; no one gets in after that.
    closed: Option<SessionState>,
    /// Kicked by the host. Cleared only by a fresh invite.
    removed: HashSet<UserId>,
}

type RosterCell = Arc<Mutex<Roster>>;

pub struct ParticipantManager<B: Collaborators> {
    sessions: Arc<SessionLifecycle<B::Directory>>,
    join_requests: Arc<JoinRequestCoordinator<B::Store>>,
    credentials: RtcCredentialIssuer<B::Provider>,
    presence: Arc<PresenceStore>,
    hub: Arc<SessionHub>,
    notifier: Arc<dyn Notifier>,
    rosters: DashMap<SessionId, RosterCell>,
}

impl<B: Collaborators> ParticipantManager<B> {
    pub fn new(
        sessions: Arc<SessionLifecycle<B::Directory>>,
        join_requests: Arc<JoinRequestCoordinator<B::Store>>,
        credentials: RtcCredentialIssuer<B::Provider>,
        presence: Arc<PresenceStore>,
        hub: Arc<SessionHub>,
    ) -> Self {
        Self {
            sessions,
            join_requests,
            credentials,
            presence,
            hub,
            notifier: Arc::new(LogNotifier),
            rosters: DashMap::new(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn sessions(&self) -> &Arc<SessionLifecycle<B::Directory>> {
        &self.sessions
    }

    pub fn join_requests(&self) -> &Arc<JoinRequestCoordinator<B::Store>> {
        &self.join_requests
    }

    pub fn presence(&self) -> &Arc<PresenceStore> {
        &self.presence
    }

    pub fn hub(&self) -> &Arc<SessionHub> {
        &self.hub
    }

    fn clock(&self) -> &Arc<dyn Clock> {
        self.sessions.clock()
    }

    // ---- Invitations ----

    /// Records `target` as invited. Host only. Inviting someone who
    /// already has a record returns that record unchanged.
    pub async fn invite(
        &self,
        session_id: &SessionId,
        target: UserId,
        invited_by: UserId,
        message: Option<String>,
    ) -> Result<Participant, ParticipantError> {
        let session = self.open_session(session_id, "invite to").await?;
        authz::require_host(&session, invited_by, "invite participants")?;
        if session.is_host(target) {
            return Err(ParticipantError::InvalidRequest(
                "the host cannot be invited to their own session".into(),
            ));
        }

        let cell = self.roster(session_id);
        let mut roster = cell.lock().await;
        ensure_open(&roster, session_id, "invite to")?;
        if let Some(existing) = roster.participants.get(&target) {
            return Ok(existing.clone());
        }
        roster.removed.remove(&target);
        let participant = Participant::invited(session_id.clone(), target, invited_by, message.clone());
        roster.participants.insert(target, participant.clone());
        drop(roster);

        tracing::info!(%session_id, user_id = %target, %invited_by, "participant invited");
        dispatch(
            &self.notifier,
            Notification::Invited {
                session_id: session_id.clone(),
                user_id: target,
                invited_by,
                message,
            },
        );
        Ok(participant)
    }

    // ---- Joining and leaving ----

    /// Brings `user` online in the session over `connection`.
    ///
    /// The host always gets straight in. Everyone else needs either a live
    /// approval (host-gated sessions) or project membership or an invite
    /// (open sessions). A gated join without approval files a join request
    /// for the host to see and fails with `ApprovalRequired`.
    ///
    /// On success the returned record carries a fresh RTC credential. If
    /// the credential cannot be issued nothing changes.
    pub async fn join(
        &self,
        session_id: &SessionId,
        user: UserId,
        connection: ConnectionHandle,
    ) -> Result<Participant, ParticipantError> {
        let session = self.open_session(session_id, "join").await?;
        let role = session.role_of(user);
        if role == Role::Member && self.is_removed(session_id, user).await {
            return Err(removed(session_id, user));
        }
        let consumes_approval = match role {
            Role::Host => false,
            Role::Member => self.admit(&session, user).await?,
        };

        let now = self.clock().now();
        let cell = self.roster(session_id);
        let mut roster = cell.lock().await;
        ensure_open(&roster, session_id, "join")?;
        if roster.removed.contains(&user) {
            return Err(removed(session_id, user));
        }

        let already_online = self.presence.is_online(session_id, user);
        if !already_online && self.presence.count(session_id) >= session.max_participants {
            return Err(ParticipantError::SessionFull {
                session_id: session_id.clone(),
                max: session.max_participants,
            });
        }

        let mut participant = roster
            .participants
            .get(&user)
            .cloned()
            .unwrap_or_else(|| Participant::joining(session_id.clone(), user, role));
        let credential = self
            .credentials
            .issue(session_id, user, participant.permissions.rtc_role())
            .await?;

        participant.role = role;
        participant.status = ParticipantStatus::Active;
        participant.online = true;
        participant.joined_at.get_or_insert(now);
        participant.last_seen = Some(now);
        participant.credential = Some(credential);
        roster.participants.insert(user, participant.clone());
        roster.ever_joined.insert(user);

        let new_id = connection.id;
        if let Some(previous) = self.presence.register(session_id, user, connection, now) {
            if previous.id != new_id {
                tracing::debug!(%session_id, %user, old = %previous.id, new = %new_id, "connection replaced");
                previous.outbox.close("replaced by a newer connection");
            }
        }
        roster.peak_online = roster.peak_online.max(self.presence.count(session_id));
        drop(roster);

        if consumes_approval {
            if let Err(e) = self.join_requests.consume(session_id, user).await {
                tracing::warn!(%session_id, %user, error = %e, "failed to consume join approval");
            }
        }

        self.hub.publish(
            session_id,
            TopicKind::Presence,
            ServerEvent::Presence {
                user_id: user,
                online: true,
                at: now,
            },
            None,
        );
        tracing::info!(%session_id, %user, ?role, "participant joined");
        Ok(participant)
    }

    /// Takes `user` offline. The record stays. Leaving twice is fine;
    /// leaving a session you were never part of is `NotFound`.
    pub async fn leave(&self, session_id: &SessionId, user: UserId) -> Result<(), ParticipantError> {
        self.sessions.get(session_id).await?;
        match self.go_offline(session_id, user, None).await {
            Some(_) => Ok(()),
            None => Err(ParticipantError::NotFound {
                session_id: session_id.clone(),
                user_id: user,
            }),
        }
    }

    /// The disconnect path. Like [`leave`](Self::leave), but never fails
    /// because of the participant's state: already offline, never joined,
    /// or removed all return `Ok(false)`.
    ///
    /// With `connection`, only that connection is taken down; a
    /// disconnect from a connection that was already replaced by a rejoin
    /// leaves the user online.
    pub async fn handle_disconnect(
        &self,
        session_id: &SessionId,
        user: UserId,
        connection: Option<ConnectionId>,
    ) -> Result<bool, ParticipantError> {
        self.sessions.get(session_id).await?;
        Ok(self
            .go_offline(session_id, user, connection)
            .await
            .unwrap_or(false))
    }

    // ---- Host controls ----

    /// Kicks `target`: deletes the record and closes their connection.
    /// Host only; the host cannot remove themselves.
    pub async fn remove_participant(
        &self,
        session_id: &SessionId,
        target: UserId,
        removed_by: UserId,
    ) -> Result<(), ParticipantError> {
        let session = self.sessions.get(session_id).await?;
        authz::require_host(&session, removed_by, "remove participants")?;
        if session.is_host(target) {
            return Err(ParticipantError::InvalidRequest(
                "the host cannot be removed".into(),
            ));
        }

        let cell = self.roster(session_id);
        let mut roster = cell.lock().await;
        if roster.participants.remove(&target).is_none() {
            return Err(ParticipantError::NotFound {
                session_id: session_id.clone(),
                user_id: target,
            });
        }
        roster.removed.insert(target);
        let handle = self.presence.deregister(session_id, target, None);
        drop(roster);

        if let Err(e) = self.join_requests.discard(session_id, target).await {
            tracing::warn!(%session_id, user_id = %target, error = %e, "failed to discard join request");
        }

        self.hub.publish(
            session_id,
            TopicKind::Participants,
            ServerEvent::ParticipantRemoved {
                user_id: target,
                removed_by,
            },
            None,
        );
        // Every connection the user has on the session goes, not only the
        // one they joined over.
        self.hub.evict_user(session_id, target, "removed from session");
        if let Some(handle) = handle {
            handle.outbox.close("removed from session");
        }

        tracing::info!(%session_id, user_id = %target, %removed_by, "participant removed");
        dispatch(
            &self.notifier,
            Notification::Removed {
                session_id: session_id.clone(),
                user_id: target,
                removed_by,
            },
        );
        Ok(())
    }

    /// Applies a partial permission update. Host only. The new permission
    /// set is broadcast to the session.
    pub async fn update_permissions(
        &self,
        session_id: &SessionId,
        target: UserId,
        patch: PermissionsPatch,
        updated_by: UserId,
    ) -> Result<Participant, ParticipantError> {
        let session = self.sessions.get(session_id).await?;
        authz::require_host(&session, updated_by, "update permissions")?;

        let cell = self.roster(session_id);
        let mut roster = cell.lock().await;
        let participant = roster
            .participants
            .get_mut(&target)
            .ok_or_else(|| ParticipantError::NotFound {
                session_id: session_id.clone(),
                user_id: target,
            })?;
        participant.permissions.apply(&patch);
        let updated = participant.clone();
        drop(roster);

        self.hub.publish(
            session_id,
            TopicKind::Participants,
            ServerEvent::PermissionsUpdated {
                user_id: target,
                permissions: updated.permissions,
            },
            None,
        );
        tracing::info!(%session_id, user_id = %target, ?patch, "permissions updated");
        Ok(updated)
    }

    /// Issues a fresh credential. The participant must be online.
    pub async fn refresh_token(
        &self,
        session_id: &SessionId,
        user: UserId,
    ) -> Result<CredentialGrant, ParticipantError> {
        self.open_session(session_id, "refresh a token in").await?;

        let cell = self.roster(session_id);
        let mut roster = cell.lock().await;
        ensure_open(&roster, session_id, "refresh a token in")?;

        let role = match roster.participants.get(&user) {
            Some(p) if p.online && self.presence.is_online(session_id, user) => {
                p.permissions.rtc_role()
            }
            _ => {
                return Err(ParticipantError::NotOnline {
                    session_id: session_id.clone(),
                    user_id: user,
                });
            }
        };
        let grant = self.credentials.issue(session_id, user, role).await?;

        if let Some(p) = roster.participants.get_mut(&user) {
            p.credential = Some(grant.clone());
            p.last_seen = Some(grant.issued_at);
        }
        Ok(grant)
    }

    // ---- Queries ----

    /// Every participant record, invited ones included, in user id order.
    pub async fn get_participants(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<Participant>, ParticipantError> {
        self.sessions.get(session_id).await?;
        let Some(cell) = self.existing_roster(session_id) else {
            return Ok(Vec::new());
        };
        let roster = cell.lock().await;
        let mut participants: Vec<Participant> = roster.participants.values().cloned().collect();
        participants.sort_by_key(|p| p.user_id);
        Ok(participants)
    }

    pub async fn get_online_participants(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<Participant>, ParticipantError> {
        let mut participants = self.get_participants(session_id).await?;
        participants.retain(|p| p.online);
        Ok(participants)
    }

    // ---- Subscriptions ----

    /// Subscribes a connection to the session's events if its user may
    /// follow the session.
    ///
    /// The host, anyone with a participant record, and project members may.
    /// Anonymous connections may only follow sessions that are not
    /// host-gated. A user the host removed may not, until invited again.
    /// The removed check and the subscription happen under the roster
    /// lock, so a kick cannot slip in between them.
    pub async fn subscribe(
        &self,
        session_id: &SessionId,
        user: Option<UserId>,
        connection: ConnectionId,
        outbox: Outbox,
    ) -> Result<(), ParticipantError> {
        let session = self.open_session(session_id, "subscribe to").await?;
        let Some(user) = user else {
            if session.requires_approval {
                return Err(ParticipantError::AnonymousNotAllowed {
                    session_id: session_id.clone(),
                });
            }
            self.hub.subscribe_as(session_id, connection, None, outbox);
            return Ok(());
        };

        let host = session.is_host(user);
        let cell = self.roster(session_id);
        let has_record = cell.lock().await.participants.contains_key(&user);
        if !host && !has_record {
            authz::require_project_member(
                session.project_id,
                user,
                &**self.sessions.directory(),
                "follow this session",
            )
            .await?;
        }

        let roster = cell.lock().await;
        ensure_open(&roster, session_id, "subscribe to")?;
        if !host && roster.removed.contains(&user) {
            return Err(removed(session_id, user));
        }
        self.hub.subscribe_as(session_id, connection, Some(user), outbox);
        Ok(())
    }

    /// Whether the host removed `user` from the session and has not invited
    /// them back since.
    pub async fn is_removed(&self, session_id: &SessionId, user: UserId) -> bool {
        match self.existing_roster(session_id) {
            Some(cell) => cell.lock().await.removed.contains(&user),
            None => false,
        }
    }

    // ---- Join requests ----

    /// Files a join request for a host-gated session and tells the host.
    pub async fn request_join(
        &self,
        session_id: &SessionId,
        user: UserId,
    ) -> Result<JoinRequest, ParticipantError> {
        let session = self.open_session(session_id, "request to join").await?;
        if session.is_host(user) {
            return Err(ParticipantError::InvalidRequest(
                "the host does not need approval".into(),
            ));
        }
        if !session.requires_approval {
            return Err(ParticipantError::InvalidRequest(
                "this session does not require approval".into(),
            ));
        }
        if self.is_removed(session_id, user).await {
            return Err(removed(session_id, user));
        }
        let request = self.join_requests.create(session_id, user).await?;
        self.announce_request(&request);
        Ok(request)
    }

    /// Approves or denies a pending request. Host only.
    pub async fn resolve_join_request(
        &self,
        session_id: &SessionId,
        user: UserId,
        approve: bool,
        resolved_by: UserId,
    ) -> Result<JoinRequest, ParticipantError> {
        let session = self.sessions.get(session_id).await?;
        authz::require_host(&session, resolved_by, "resolve join requests")?;

        let request = self
            .join_requests
            .resolve(session_id, user, approve, resolved_by)
            .await?;
        self.hub.publish(
            session_id,
            TopicKind::Participants,
            ServerEvent::JoinResolved {
                user_id: user,
                approved: approve,
            },
            None,
        );
        Ok(request)
    }

    pub async fn join_request_status(
        &self,
        session_id: &SessionId,
        user: UserId,
    ) -> Result<JoinRequest, ParticipantError> {
        self.sessions.get(session_id).await?;
        Ok(self.join_requests.get(session_id, user).await?)
    }

    /// Removes expired join requests; returns how many.
    pub async fn sweep_join_requests(&self) -> Result<usize, ParticipantError> {
        Ok(self.join_requests.sweep().await?)
    }

    // ---- Internals ----

    /// Decides whether a non-host may join. `Ok(true)` means they may and
    /// an approval must be consumed afterwards.
    ///
    /// Someone who already joined once (and was not removed since) gets
    /// back in without asking again, so a dropped connection does not
    /// send them back to the host's queue.
    async fn admit(&self, session: &Session, user: UserId) -> Result<bool, ParticipantError> {
        let standing = match self.existing_roster(&session.id) {
            Some(cell) => {
                let roster = cell.lock().await;
                roster.participants.get(&user).map(|p| p.status)
            }
            None => None,
        };
        if standing == Some(ParticipantStatus::Active) {
            return Ok(false);
        }

        if session.requires_approval {
            if self.join_requests.is_approved(&session.id, user).await? {
                return Ok(true);
            }
            match self.join_requests.create(&session.id, user).await {
                Ok(request) if request.status == JoinRequestStatus::Approved => return Ok(true),
                Ok(request) => self.announce_request(&request),
                Err(JoinRequestError::AlreadyPending { .. }) => {}
                Err(e) => return Err(e.into()),
            }
            return Err(ParticipantError::ApprovalRequired {
                session_id: session.id.clone(),
                user_id: user,
            });
        }

        // Open session: invitees and project members.
        if standing.is_none() {
            authz::require_project_member(
                session.project_id,
                user,
                &**self.sessions.directory(),
                "join",
            )
            .await?;
        }
        Ok(false)
    }

    fn announce_request(&self, request: &JoinRequest) {
        if request.status != JoinRequestStatus::Pending {
            return;
        }
        self.hub.publish(
            &request.session_id,
            TopicKind::Participants,
            ServerEvent::JoinRequested {
                user_id: request.user_id,
                expires_at: request.expires_at,
            },
            None,
        );
    }

    /// `None` if `user` has no record; otherwise whether this call took
    /// them offline.
    async fn go_offline(
        &self,
        session_id: &SessionId,
        user: UserId,
        only_if: Option<ConnectionId>,
    ) -> Option<bool> {
        let Some(cell) = self.existing_roster(session_id) else {
            self.presence.deregister(session_id, user, only_if);
            return None;
        };
        let now = self.clock().now();
        let mut roster = cell.lock().await;
        let removed = self.presence.deregister(session_id, user, only_if);
        let participant = roster.participants.get_mut(&user)?;
        if removed.is_none() {
            return Some(false);
        }
        participant.online = false;
        participant.last_seen = Some(now);
        participant.credential = None;
        drop(roster);

        self.hub.publish(
            session_id,
            TopicKind::Presence,
            ServerEvent::Presence {
                user_id: user,
                online: false,
                at: now,
            },
            None,
        );
        tracing::info!(%session_id, %user, "participant offline");
        Some(true)
    }

    async fn open_session(
        &self,
        session_id: &SessionId,
        action: &'static str,
    ) -> Result<Session, ParticipantError> {
        let session = self.sessions.get(session_id).await?;
        if !session.state.accepts_participants() {
            return Err(SessionError::InvalidTransition {
                session_id: session_id.clone(),
                from: session.state,
                action,
            }
            .into());
        }
        Ok(session)
    }

    fn announce_state(&self, session: &Session, changed_by: UserId) {
        let delivered = self.hub.publish(
            &session.id,
            TopicKind::Lifecycle,
            ServerEvent::SessionStateChanged {
                state: session.state.to_string(),
                changed_by,
            },
            None,
        );
        tracing::debug!(session_id = %session.id, state = %session.state, delivered, "state change announced");
    }

    fn roster(&self, session_id: &SessionId) -> RosterCell {
        Arc::clone(self.rosters.entry(session_id.clone()).or_default().value())
    }

    fn existing_roster(&self, session_id: &SessionId) -> Option<RosterCell> {
        self.rosters.get(session_id).map(|r| Arc::clone(r.value()))
    }
}

impl<B: Collaborators> SessionObserver for ParticipantManager<B> {
    /// Announces start, pause, and resume on the lifecycle topic.
    async fn transitioned(&self, session: &Session, actor: UserId) {
        self.announce_state(session, actor);
    }

    /// Announces the new state, force-closes every connection on the
    /// session, and drops the participant records.
    async fn terminate(&self, session: &Session, actor: UserId) -> TerminationReport {
        let session_id = &session.id;
        self.announce_state(session, actor);

        let reason = format!("session {}", session.state.as_str().to_lowercase());
        let cell = self.roster(session_id);
        let mut roster = cell.lock().await;
        roster.closed = Some(session.state);
        let drained = self.presence.drain_session(session_id);
        for (_, handle) in &drained {
            handle.outbox.close(reason.clone());
        }
        let report = TerminationReport {
            peak_participants: roster.peak_online,
            total_participants: roster.ever_joined.len(),
            disconnected: drained.len(),
        };
        roster.participants.clear();
        drop(roster);

        self.hub.close_session(session_id, &reason);
        if let Err(e) = self.join_requests.purge_session(session_id).await {
            tracing::warn!(%session_id, error = %e, "failed to purge join requests");
        }
        tracing::info!(%session_id, disconnected = report.disconnected, "participants terminated");
        report
    }
}

fn removed(session_id: &SessionId, user: UserId) -> ParticipantError {
    ParticipantError::Removed {
        session_id: session_id.clone(),
        user_id: user,
    }
}

fn ensure_open(
    roster: &Roster,
    session_id: &SessionId,
    action: &'static str,
) -> Result<(), ParticipantError> {
    match roster.closed {
        Some(state) => Err(SessionError::InvalidTransition {
            session_id: session_id.clone(),
            from: state,
            action,
        }
        .into()),
        None => Ok(()),
    }
}
