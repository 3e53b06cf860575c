//! The transport-agnostic operation surface.
//!
//! [`Coordinator`] is what an RPC layer (or the WebSocket router) calls.
//! Every method is a thin pass-through to the session lifecycle or the
//! participant manager. Lifecycle transitions hand the manager to the
//! lifecycle as its observer, so state changes are announced on the
//! session's lifecycle topic while the session lock is still held.

use std::sync::Arc;

use ensemble_participant::{
    Collaborators, HmacRtcProvider, JoinRequest, JoinRequestCoordinator, MemoryStore,
    Participant, ParticipantManager, RtcCredentialIssuer, Standalone,
};
use ensemble_presence::{ConnectionHandle, PresenceStore, SessionHub};
use ensemble_protocol::{
    CredentialGrant, PermissionsPatch, ProjectId, SessionId, UserId,
};
use ensemble_session::{
    Clock, CreateSessionRequest, ProjectDirectory, Session, SessionConfig, SessionLifecycle,
    SessionSummary,
};

use crate::{EnsembleConfig, EnsembleError};

pub struct Coordinator<B: Collaborators = Standalone> {
    participants: Arc<ParticipantManager<B>>,
}

impl<D: ProjectDirectory> Coordinator<Standalone<D>> {
    /// Wires up the in-process collaborators from `config` over any
    /// project directory.
    pub fn standalone(config: &EnsembleConfig, directory: D, clock: Arc<dyn Clock>) -> Self {
        let sessions = Arc::new(SessionLifecycle::new(
            Arc::new(directory),
            Arc::clone(&clock),
            SessionConfig::default(),
        ));
        let store = Arc::new(MemoryStore::new(Arc::clone(&clock)));
        let join_requests = Arc::new(JoinRequestCoordinator::new(
            store,
            Arc::clone(&clock),
            config.join_request_config(),
        ));
        let credentials = RtcCredentialIssuer::new(
            Arc::new(HmacRtcProvider::new(&config.rtc_secret)),
            clock,
            config.credential_config(),
        );
        let participants = ParticipantManager::new(
            sessions,
            join_requests,
            credentials,
            Arc::new(PresenceStore::new()),
            Arc::new(SessionHub::new()),
        );
        Self::new(Arc::new(participants))
    }
}

impl<B: Collaborators> Coordinator<B> {
    pub fn new(participants: Arc<ParticipantManager<B>>) -> Self {
        Self { participants }
    }

    pub fn participants(&self) -> &Arc<ParticipantManager<B>> {
        &self.participants
    }

    pub fn sessions(&self) -> &Arc<SessionLifecycle<B::Directory>> {
        self.participants.sessions()
    }

    pub fn hub(&self) -> &Arc<SessionHub> {
        self.participants.hub()
    }

    pub fn presence(&self) -> &Arc<PresenceStore> {
        self.participants.presence()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        self.sessions().clock()
    }

    // ---- Sessions ----

    pub async fn create_session(
        &self,
        request: CreateSessionRequest,
        host: UserId,
    ) -> Result<Session, EnsembleError> {
        Ok(self.sessions().create(request, host).await?)
    }

    pub async fn get_session(&self, id: &SessionId) -> Result<Session, EnsembleError> {
        Ok(self.sessions().get(id).await?)
    }

    pub async fn list_sessions(&self, project: ProjectId) -> Vec<Session> {
        self.sessions().list(project).await
    }

    pub async fn start_session(&self, id: &SessionId, user: UserId) -> Result<Session, EnsembleError> {
        Ok(self
            .sessions()
            .start(id, user, self.participants.as_ref())
            .await?)
    }

    pub async fn pause_session(&self, id: &SessionId, user: UserId) -> Result<Session, EnsembleError> {
        Ok(self
            .sessions()
            .pause(id, user, self.participants.as_ref())
            .await?)
    }

    pub async fn resume_session(
        &self,
        id: &SessionId,
        user: UserId,
    ) -> Result<Session, EnsembleError> {
        Ok(self
            .sessions()
            .resume(id, user, self.participants.as_ref())
            .await?)
    }

    /// Ends the session and disconnects everyone still in it.
    pub async fn end_session(
        &self,
        id: &SessionId,
        user: UserId,
    ) -> Result<SessionSummary, EnsembleError> {
        Ok(self.sessions().end(id, user, self.participants.as_ref()).await?)
    }

    pub async fn cancel_session(
        &self,
        id: &SessionId,
        user: UserId,
        reason: impl Into<String>,
    ) -> Result<Session, EnsembleError> {
        Ok(self
            .sessions()
            .cancel(id, user, reason, self.participants.as_ref())
            .await?)
    }

    // ---- Participants ----

    pub async fn invite(
        &self,
        session: &SessionId,
        target: UserId,
        invited_by: UserId,
        message: Option<String>,
    ) -> Result<Participant, EnsembleError> {
        Ok(self
            .participants
            .invite(session, target, invited_by, message)
            .await?)
    }

    pub async fn join(
        &self,
        session: &SessionId,
        user: UserId,
        connection: ConnectionHandle,
    ) -> Result<Participant, EnsembleError> {
        Ok(self.participants.join(session, user, connection).await?)
    }

    pub async fn leave(&self, session: &SessionId, user: UserId) -> Result<(), EnsembleError> {
        Ok(self.participants.leave(session, user).await?)
    }

    pub async fn remove_participant(
        &self,
        session: &SessionId,
        target: UserId,
        removed_by: UserId,
    ) -> Result<(), EnsembleError> {
        Ok(self
            .participants
            .remove_participant(session, target, removed_by)
            .await?)
    }

    pub async fn get_participants(
        &self,
        session: &SessionId,
    ) -> Result<Vec<Participant>, EnsembleError> {
        Ok(self.participants.get_participants(session).await?)
    }

    pub async fn get_online_participants(
        &self,
        session: &SessionId,
    ) -> Result<Vec<Participant>, EnsembleError> {
        Ok(self.participants.get_online_participants(session).await?)
    }

    pub async fn update_permissions(
        &self,
        session: &SessionId,
        target: UserId,
        patch: PermissionsPatch,
        updated_by: UserId,
    ) -> Result<Participant, EnsembleError> {
        Ok(self
            .participants
            .update_permissions(session, target, patch, updated_by)
            .await?)
    }

    pub async fn refresh_token(
        &self,
        session: &SessionId,
        user: UserId,
    ) -> Result<CredentialGrant, EnsembleError> {
        Ok(self.participants.refresh_token(session, user).await?)
    }

    // ---- Join requests ----

    pub async fn request_join(
        &self,
        session: &SessionId,
        user: UserId,
    ) -> Result<JoinRequest, EnsembleError> {
        Ok(self.participants.request_join(session, user).await?)
    }

    pub async fn resolve_join_request(
        &self,
        session: &SessionId,
        user: UserId,
        approve: bool,
        resolved_by: UserId,
    ) -> Result<JoinRequest, EnsembleError> {
        Ok(self
            .participants
            .resolve_join_request(session, user, approve, resolved_by)
            .await?)
    }

    pub async fn join_request_status(
        &self,
        session: &SessionId,
        user: UserId,
    ) -> Result<JoinRequest, EnsembleError> {
        Ok(self.participants.join_request_status(session, user).await?)
    }

    /// Administrative cleanup. Returns how many expired requests went.
    pub async fn sweep_join_requests(&self) -> Result<usize, EnsembleError> {
        let removed = self.participants.sweep_join_requests().await?;
        tracing::info!(removed, "join request sweep requested");
        Ok(removed)
    }
}
