//! The session registry and its transitions.
//!
//! # Concurrency
//!
//! Sessions live in a map of `Arc<Mutex<Session>>`. The outer `RwLock`
//! is only held long enough to find (or insert) a session's cell; every
//! transition then runs under that session's own mutex. Two transitions
//! on the same session are therefore serialized (a concurrent `pause` and
//! `end` cannot both apply) while different sessions never contend.
//!
//! Every transition calls its [`SessionObserver`] while still holding the
//! session's lock. No transition can slip in between "state is ENDED" and
//! "participants are gone", and observers see transitions of one session
//! in the order they were applied.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ensemble_protocol::{ProjectId, SessionId, UserId};
use rand::Rng;
use tokio::sync::{Mutex, RwLock};

use crate::authz::{require_host, require_host_or_admin, require_project_member};
use crate::{
    Clock, CreateSessionRequest, ProjectDirectory, Session, SessionConfig, SessionError,
    SessionState, SessionSummary,
};

/// What the participant layer reports after tearing a session down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TerminationReport {
    pub peak_participants: usize,
    pub total_participants: usize,
    /// Connections that were still open and got force-closed.
    pub disconnected: usize,
}

/// Callback into the layer above for every applied transition.
///
/// The lifecycle sits below the participant layer, so it cannot name
/// `ParticipantManager`. Instead the caller passes an observer, and the
/// lifecycle invokes it after the new state is recorded and before the
/// session's lock is released. `actor` is the user who made the change.
pub trait SessionObserver: Send + Sync {
    /// A non-terminal transition (start, pause, resume) was applied.
    fn transitioned(
        &self,
        _session: &Session,
        _actor: UserId,
    ) -> impl std::future::Future<Output = ()> + Send {
        async {}
    }

    /// The session reached ENDED or CANCELLED. Tear participants down.
    fn terminate(
        &self,
        session: &Session,
        actor: UserId,
    ) -> impl std::future::Future<Output = TerminationReport> + Send;
}

/// An observer for sessions that never had a participant layer.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoParticipants;

impl SessionObserver for NoParticipants {
    async fn terminate(&self, _session: &Session, _actor: UserId) -> TerminationReport {
        TerminationReport::default()
    }
}

type SessionCell = Arc<Mutex<Session>>;

/// Owns every session and applies lifecycle transitions.
pub struct SessionLifecycle<D: ProjectDirectory> {
    sessions: RwLock<HashMap<SessionId, SessionCell>>,
    directory: Arc<D>,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
}

impl<D: ProjectDirectory> SessionLifecycle<D> {
    pub fn new(directory: Arc<D>, clock: Arc<dyn Clock>, config: SessionConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            directory,
            clock,
            config,
        }
    }

    pub fn directory(&self) -> &Arc<D> {
        &self.directory
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    // ---- Creation and lookup ----

    /// Validates `request` and registers a new SCHEDULED session hosted by
    /// `host_id`.
    pub async fn create(
        &self,
        request: CreateSessionRequest,
        host_id: UserId,
    ) -> Result<Session, SessionError> {
        let now = self.clock.now();
        let scheduled_start = self.validate(&request, now)?;
        require_project_member(request.project_id, host_id, &*self.directory, "create")
            .await?;

        let session = Session {
            id: SessionId::new(generate_session_id()),
            project_id: request.project_id,
            host_id,
            title: request.title.trim().to_string(),
            description: request.description,
            session_type: request.session_type,
            state: SessionState::Scheduled,
            scheduled_start,
            actual_start: None,
            actual_end: None,
            recording_enabled: request.recording_enabled,
            max_participants: request.max_participants,
            requires_approval: request.requires_approval,
            created_at: now,
            cancel_reason: None,
        };

        self.sessions
            .write()
            .await
            .insert(session.id.clone(), Arc::new(Mutex::new(session.clone())));

        tracing::info!(
            session_id = %session.id,
            %host_id,
            project_id = %session.project_id,
            "session created"
        );
        Ok(session)
    }

    /// A snapshot of the session.
    pub async fn get(&self, id: &SessionId) -> Result<Session, SessionError> {
        let cell = self.cell(id).await?;
        let session = cell.lock().await;
        Ok(session.clone())
    }

    /// Every session of `project`, newest first.
    pub async fn list(&self, project: ProjectId) -> Vec<Session> {
        let cells: Vec<SessionCell> = self.sessions.read().await.values().cloned().collect();

        let mut sessions = Vec::new();
        for cell in cells {
            let session = cell.lock().await;
            if session.project_id == project {
                sessions.push(session.clone());
            }
        }
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        sessions
    }

    // ---- Transitions ----

    /// SCHEDULED → LIVE. Host or project admin. The host may start before
    /// the scheduled time.
    pub async fn start<T: SessionObserver>(
        &self,
        id: &SessionId,
        user: UserId,
        observer: &T,
    ) -> Result<Session, SessionError> {
        let cell = self.cell(id).await?;
        let mut session = cell.lock().await;

        require_host_or_admin(&session, user, &*self.directory, "start").await?;
        ensure_transition(&session, SessionState::Live, "start", &[SessionState::Scheduled])?;

        session.state = SessionState::Live;
        session.actual_start = Some(self.clock.now());
        observer.transitioned(&session, user).await;
        tracing::info!(session_id = %id, user_id = %user, "session started");
        Ok(session.clone())
    }

    /// LIVE → PAUSED. Host only.
    pub async fn pause<T: SessionObserver>(
        &self,
        id: &SessionId,
        user: UserId,
        observer: &T,
    ) -> Result<Session, SessionError> {
        self.toggle(id, user, SessionState::Live, SessionState::Paused, "pause", observer)
            .await
    }

    /// PAUSED → LIVE. Host only.
    pub async fn resume<T: SessionObserver>(
        &self,
        id: &SessionId,
        user: UserId,
        observer: &T,
    ) -> Result<Session, SessionError> {
        self.toggle(id, user, SessionState::Paused, SessionState::Live, "resume", observer)
            .await
    }

    /// LIVE/PAUSED → ENDED. Host only. Participants are torn down through
    /// `observer` before this returns.
    pub async fn end<T: SessionObserver>(
        &self,
        id: &SessionId,
        user: UserId,
        observer: &T,
    ) -> Result<SessionSummary, SessionError> {
        let cell = self.cell(id).await?;
        let mut session = cell.lock().await;

        require_host(&session, user, "end")?;
        ensure_transition(
            &session,
            SessionState::Ended,
            "end",
            &[SessionState::Live, SessionState::Paused],
        )?;

        let ended_at = self.clock.now();
        session.state = SessionState::Ended;
        session.actual_end = Some(ended_at);

        let report = observer.terminate(&session, user).await;
        let duration_secs = session.duration().map(|d| d.num_seconds()).unwrap_or(0);

        tracing::info!(
            session_id = %id,
            user_id = %user,
            duration_secs,
            peak = report.peak_participants,
            disconnected = report.disconnected,
            "session ended"
        );

        Ok(SessionSummary {
            session_id: session.id.clone(),
            started_at: session.actual_start,
            ended_at,
            duration_secs,
            peak_participants: report.peak_participants,
            total_participants: report.total_participants,
        })
    }

    /// SCHEDULED/LIVE/PAUSED → CANCELLED. Host or project admin. A session
    /// that already went live has its participants torn down.
    pub async fn cancel<T: SessionObserver>(
        &self,
        id: &SessionId,
        user: UserId,
        reason: impl Into<String>,
        observer: &T,
    ) -> Result<Session, SessionError> {
        let cell = self.cell(id).await?;
        let mut session = cell.lock().await;

        require_host_or_admin(&session, user, &*self.directory, "cancel").await?;
        ensure_transition(
            &session,
            SessionState::Cancelled,
            "cancel",
            &[SessionState::Scheduled, SessionState::Live, SessionState::Paused],
        )?;

        let was_started = session.actual_start.is_some();
        session.state = SessionState::Cancelled;
        session.cancel_reason = Some(reason.into());
        if was_started {
            session.actual_end = Some(self.clock.now());
        }

        let report = observer.terminate(&session, user).await;
        tracing::info!(
            session_id = %id,
            user_id = %user,
            reason = session.cancel_reason.as_deref().unwrap_or(""),
            disconnected = report.disconnected,
            "session cancelled"
        );
        Ok(session.clone())
    }

    // ---- Internals ----

    async fn toggle<T: SessionObserver>(
        &self,
        id: &SessionId,
        user: UserId,
        from: SessionState,
        to: SessionState,
        action: &'static str,
        observer: &T,
    ) -> Result<Session, SessionError> {
        let cell = self.cell(id).await?;
        let mut session = cell.lock().await;

        require_host(&session, user, action)?;
        ensure_transition(&session, to, action, &[from])?;

        session.state = to;
        observer.transitioned(&session, user).await;
        tracing::debug!(session_id = %id, user_id = %user, state = %to, "session {action}d");
        Ok(session.clone())
    }

    async fn cell(&self, id: &SessionId) -> Result<SessionCell, SessionError> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(id.clone()))
    }

    fn validate(
        &self,
        request: &CreateSessionRequest,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, SessionError> {
        let title = request.title.trim();
        if title.is_empty() {
            return Err(SessionError::InvalidRequest("title must not be empty".into()));
        }
        if title.chars().count() > self.config.max_title_len {
            return Err(SessionError::InvalidRequest(format!(
                "title exceeds {} characters",
                self.config.max_title_len
            )));
        }
        if request.max_participants == 0 || request.max_participants > self.config.participant_limit {
            return Err(SessionError::InvalidRequest(format!(
                "maxParticipants must be between 1 and {}",
                self.config.participant_limit
            )));
        }

        match request.scheduled_start {
            None => Ok(now),
            Some(at) if at < now - self.config.schedule_grace => Err(
                SessionError::InvalidRequest("scheduledStart is in the past".into()),
            ),
            Some(at) => Ok(at),
        }
    }
}

/// Checks the current state is one of `allowed` and that the state
/// machine has an edge to `target`.
fn ensure_transition(
    session: &Session,
    target: SessionState,
    action: &'static str,
    allowed: &[SessionState],
) -> Result<(), SessionError> {
    if allowed.contains(&session.state) && session.state.can_transition_to(target) {
        Ok(())
    } else {
        Err(SessionError::InvalidTransition {
            session_id: session.id.clone(),
            from: session.state,
            action,
        })
    }
}

/// A random 32-character hex id (128 bits).
fn generate_session_id() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Duration;
    use ensemble_protocol::ErrorKind;

    use super::*;
    use crate::{ManualClock, StaticDirectory};

    const PROJECT: ProjectId = ProjectId(1);
    const HOST: UserId = UserId(1);
    const MEMBER: UserId = UserId(2);
    const ADMIN: UserId = UserId(3);

    fn lifecycle() -> (SessionLifecycle<StaticDirectory>, ManualClock) {
        let dir = StaticDirectory::new()
            .with_member(PROJECT, HOST)
            .with_member(PROJECT, MEMBER)
            .with_admin(PROJECT, ADMIN);
        let clock = ManualClock::starting_now();
        let lc = SessionLifecycle::new(
            Arc::new(dir),
            Arc::new(clock.clone()),
            SessionConfig::default(),
        );
        (lc, clock)
    }

    async fn live_session(lc: &SessionLifecycle<StaticDirectory>) -> SessionId {
        let s = lc
            .create(CreateSessionRequest::new(PROJECT, "Overdubs"), HOST)
            .await
            .unwrap();
        lc.start(&s.id, HOST, &NoParticipants).await.unwrap();
        s.id
    }

    /// Counts how often it was asked to terminate.
    #[derive(Default)]
    struct CountingTerminator {
        calls: AtomicUsize,
    }

    impl SessionObserver for CountingTerminator {
        async fn terminate(&self, _session: &Session, _actor: UserId) -> TerminationReport {
            self.calls.fetch_add(1, Ordering::SeqCst);
            TerminationReport {
                peak_participants: 3,
                total_participants: 4,
                disconnected: 2,
            }
        }
    }

    /// Records every state it is shown, in call order.
    #[derive(Default)]
    struct RecordingObserver {
        seen: std::sync::Mutex<Vec<SessionState>>,
    }

    impl SessionObserver for RecordingObserver {
        async fn transitioned(&self, session: &Session, _actor: UserId) {
            // Yield while "announcing" so a racing transition gets a chance
            // to run if the lock were not held.
            tokio::task::yield_now().await;
            self.seen.lock().unwrap().push(session.state);
        }

        async fn terminate(&self, session: &Session, _actor: UserId) -> TerminationReport {
            self.seen.lock().unwrap().push(session.state);
            TerminationReport::default()
        }
    }

    // ---- create ----

    #[tokio::test]
    async fn test_create_starts_scheduled_with_unique_id() {
        let (lc, _) = lifecycle();

        let a = lc.create(CreateSessionRequest::new(PROJECT, "A"), HOST).await.unwrap();
        let b = lc.create(CreateSessionRequest::new(PROJECT, "B"), HOST).await.unwrap();

        assert_eq!(a.state, SessionState::Scheduled);
        assert_eq!(a.host_id, HOST);
        assert_eq!(a.id.as_str().len(), 32);
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn test_create_rejects_bad_participant_bounds() {
        let (lc, _) = lifecycle();

        for max in [0, 101] {
            let req = CreateSessionRequest::new(PROJECT, "A").with_max_participants(max);
            let err = lc.create(req, HOST).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidRequest);
        }
    }

    #[tokio::test]
    async fn test_create_rejects_blank_title() {
        let (lc, _) = lifecycle();

        let err = lc
            .create(CreateSessionRequest::new(PROJECT, "   "), HOST)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn test_create_rejects_start_far_in_past_but_tolerates_skew() {
        let (lc, clock) = lifecycle();
        let now = clock.now();

        let stale = CreateSessionRequest::new(PROJECT, "A")
            .with_scheduled_start(now - Duration::minutes(10));
        assert!(lc.create(stale, HOST).await.is_err());

        let skewed = CreateSessionRequest::new(PROJECT, "A")
            .with_scheduled_start(now - Duration::minutes(1));
        assert!(lc.create(skewed, HOST).await.is_ok());
    }

    #[tokio::test]
    async fn test_create_by_outsider_is_denied() {
        let (lc, _) = lifecycle();

        let err = lc
            .create(CreateSessionRequest::new(PROJECT, "A"), UserId(99))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn test_get_unknown_is_not_found() {
        let (lc, _) = lifecycle();

        let err = lc.get(&SessionId::new("nope")).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_list_is_newest_first_and_scoped_to_project() {
        let (lc, clock) = lifecycle();
        let first = lc.create(CreateSessionRequest::new(PROJECT, "first"), HOST).await.unwrap();
        clock.advance(Duration::seconds(5));
        let second = lc.create(CreateSessionRequest::new(PROJECT, "second"), HOST).await.unwrap();

        let listed = lc.list(PROJECT).await;

        let ids: Vec<_> = listed.iter().map(|s| s.id.clone()).collect();
        assert_eq!(ids, vec![second.id, first.id]);
        assert!(lc.list(ProjectId(2)).await.is_empty());
    }

    // ---- transitions ----

    #[tokio::test]
    async fn test_full_lifecycle_then_terminal_rejects_everything() {
        let (lc, clock) = lifecycle();
        let s = lc.create(CreateSessionRequest::new(PROJECT, "A"), HOST).await.unwrap();

        assert_eq!(lc.start(&s.id, HOST, &NoParticipants).await.unwrap().state, SessionState::Live);
        assert_eq!(lc.pause(&s.id, HOST, &NoParticipants).await.unwrap().state, SessionState::Paused);
        assert_eq!(lc.resume(&s.id, HOST, &NoParticipants).await.unwrap().state, SessionState::Live);
        clock.advance(Duration::seconds(90));
        let summary = lc.end(&s.id, HOST, &NoParticipants).await.unwrap();
        assert_eq!(summary.duration_secs, 90);
        assert_eq!(lc.get(&s.id).await.unwrap().state, SessionState::Ended);

        let t = NoParticipants;
        let errors = [
            lc.start(&s.id, HOST, &NoParticipants).await.unwrap_err(),
            lc.pause(&s.id, HOST, &NoParticipants).await.unwrap_err(),
            lc.resume(&s.id, HOST, &NoParticipants).await.unwrap_err(),
            lc.cancel(&s.id, HOST, "late", &t).await.unwrap_err(),
        ];
        for err in errors {
            assert_eq!(err.kind(), ErrorKind::InvalidTransition);
        }
    }

    #[tokio::test]
    async fn test_start_twice_is_invalid_transition() {
        let (lc, _) = lifecycle();
        let id = live_session(&lc).await;

        let err = lc.start(&id, HOST, &NoParticipants).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidTransition);
    }

    #[tokio::test]
    async fn test_start_by_admin_allowed_by_member_denied() {
        let (lc, _) = lifecycle();
        let s = lc.create(CreateSessionRequest::new(PROJECT, "A"), HOST).await.unwrap();

        let err = lc.start(&s.id, MEMBER, &NoParticipants).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);

        let started = lc.start(&s.id, ADMIN, &NoParticipants).await.unwrap();
        assert_eq!(started.state, SessionState::Live);
        assert!(started.actual_start.is_some());
    }

    #[tokio::test]
    async fn test_pause_by_non_host_denied_and_state_unchanged() {
        let (lc, _) = lifecycle();
        let id = live_session(&lc).await;

        let err = lc.pause(&id, MEMBER, &NoParticipants).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        assert_eq!(lc.get(&id).await.unwrap().state, SessionState::Live);
    }

    #[tokio::test]
    async fn test_pause_is_host_only_even_for_admin() {
        let (lc, _) = lifecycle();
        let id = live_session(&lc).await;

        let err = lc.pause(&id, ADMIN, &NoParticipants).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn test_resume_while_live_is_invalid_transition() {
        let (lc, _) = lifecycle();
        let id = live_session(&lc).await;

        let err = lc.resume(&id, HOST, &NoParticipants).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidTransition);
    }

    #[tokio::test]
    async fn test_end_from_scheduled_is_invalid_transition() {
        let (lc, _) = lifecycle();
        let s = lc.create(CreateSessionRequest::new(PROJECT, "A"), HOST).await.unwrap();

        let err = lc.end(&s.id, HOST, &NoParticipants).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidTransition);
    }

    #[tokio::test]
    async fn test_end_invokes_terminator_once_and_reports_counts() {
        let (lc, _) = lifecycle();
        let id = live_session(&lc).await;
        let terminator = CountingTerminator::default();

        let summary = lc.end(&id, HOST, &terminator).await.unwrap();

        assert_eq!(terminator.calls.load(Ordering::SeqCst), 1);
        assert_eq!(summary.peak_participants, 3);
        assert_eq!(summary.total_participants, 4);
        assert!(summary.started_at.is_some());
    }

    #[tokio::test]
    async fn test_cancel_scheduled_by_admin_records_reason() {
        let (lc, _) = lifecycle();
        let s = lc.create(CreateSessionRequest::new(PROJECT, "A"), HOST).await.unwrap();

        let cancelled = lc.cancel(&s.id, ADMIN, "studio flooded", &NoParticipants).await.unwrap();

        assert_eq!(cancelled.state, SessionState::Cancelled);
        assert_eq!(cancelled.cancel_reason.as_deref(), Some("studio flooded"));
        assert_eq!(cancelled.actual_end, None);
    }

    #[tokio::test]
    async fn test_cancel_by_member_denied() {
        let (lc, _) = lifecycle();
        let s = lc.create(CreateSessionRequest::new(PROJECT, "A"), HOST).await.unwrap();

        let err = lc.cancel(&s.id, MEMBER, "no", &NoParticipants).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn test_transitions_reach_observer_in_order() {
        let (lc, _) = lifecycle();
        let s = lc
            .create(CreateSessionRequest::new(PROJECT, "Overdubs"), HOST)
            .await
            .unwrap();
        let observer = RecordingObserver::default();

        lc.start(&s.id, HOST, &observer).await.unwrap();
        lc.pause(&s.id, HOST, &observer).await.unwrap();
        lc.resume(&s.id, HOST, &observer).await.unwrap();
        lc.end(&s.id, HOST, &observer).await.unwrap();

        assert_eq!(
            *observer.seen.lock().unwrap(),
            vec![
                SessionState::Live,
                SessionState::Paused,
                SessionState::Live,
                SessionState::Ended
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_pause_and_end_observer_sees_ended_last() {
        let (lc, _) = lifecycle();
        let lc = Arc::new(lc);
        let observer = Arc::new(RecordingObserver::default());
        let id = live_session(&lc).await;

        let pause = {
            let (lc, id, observer) = (Arc::clone(&lc), id.clone(), Arc::clone(&observer));
            tokio::spawn(async move { lc.pause(&id, HOST, &*observer).await.is_ok() })
        };
        let end = {
            let (lc, id, observer) = (Arc::clone(&lc), id.clone(), Arc::clone(&observer));
            tokio::spawn(async move { lc.end(&id, HOST, &*observer).await.is_ok() })
        };
        pause.await.unwrap();
        assert!(end.await.unwrap());

        let seen = observer.seen.lock().unwrap().clone();
        assert_eq!(seen.last(), Some(&SessionState::Ended));
    }

    #[tokio::test]
    async fn test_failed_transition_is_not_observed() {
        let (lc, _) = lifecycle();
        let id = live_session(&lc).await;
        let observer = RecordingObserver::default();

        lc.pause(&id, MEMBER, &observer).await.unwrap_err();
        lc.resume(&id, HOST, &observer).await.unwrap_err();

        assert!(observer.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_pause_and_end_apply_in_some_order() {
        let (lc, _) = lifecycle();
        let lc = Arc::new(lc);
        let id = live_session(&lc).await;

        let pause = {
            let lc = Arc::clone(&lc);
            let id = id.clone();
            tokio::spawn(async move { lc.pause(&id, HOST, &NoParticipants).await.map(|_| ()).ok() })
        };
        let end = {
            let lc = Arc::clone(&lc);
            let id = id.clone();
            tokio::spawn(async move { lc.end(&id, HOST, &NoParticipants).await.is_ok() })
        };
        pause.await.unwrap();
        let ended = end.await.unwrap();

        // End is legal from both LIVE and PAUSED, so it always wins; the
        // pause succeeds only if it got there first.
        assert!(ended);
        assert_eq!(lc.get(&id).await.unwrap().state, SessionState::Ended);
    }
}
