//! The project directory collaborator.
//!
//! Ensemble does not know who belongs to which project; the project
//! service does. Every authorization check that is not simply "are you the
//! host?" asks a [`ProjectDirectory`].

use dashmap::DashMap;
use ensemble_protocol::{ProjectId, UserId};

/// A user's standing in the project that owns a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProjectRole {
    Admin,
    Member,
    /// Not part of the project at all.
    Outsider,
}

impl ProjectRole {
    /// Admins are members too.
    pub fn is_member(&self) -> bool {
        matches!(self, Self::Admin | Self::Member)
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Self::Admin)
    }
}

/// The directory could not answer.
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("project directory unavailable: {0}")]
    Unavailable(String),
}

/// Answers "what is this user to this project?".
///
/// Implementations typically call out to the project/membership service,
/// hence the async method. They must be cheap to share across tasks.
pub trait ProjectDirectory: Send + Sync + 'static {
    fn role_of(
        &self,
        project: ProjectId,
        user: UserId,
    ) -> impl std::future::Future<Output = Result<ProjectRole, DirectoryError>> + Send;

    /// The name other participants see for `user`. `None` when the
    /// directory does not know one.
    fn display_name(
        &self,
        _user: UserId,
    ) -> impl std::future::Future<Output = Result<Option<String>, DirectoryError>> + Send {
        async { Ok(None) }
    }
}

/// An in-memory directory. Useful for development servers and tests;
/// anybody not explicitly added is an [`ProjectRole::Outsider`].
#[derive(Debug, Default)]
pub struct StaticDirectory {
    roles: DashMap<(ProjectId, UserId), ProjectRole>,
    names: DashMap<UserId, String>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style grant of [`ProjectRole::Member`].
    pub fn with_member(self, project: ProjectId, user: UserId) -> Self {
        self.grant(project, user, ProjectRole::Member);
        self
    }

    /// Builder-style grant of [`ProjectRole::Admin`].
    pub fn with_admin(self, project: ProjectId, user: UserId) -> Self {
        self.grant(project, user, ProjectRole::Admin);
        self
    }

    pub fn grant(&self, project: ProjectId, user: UserId, role: ProjectRole) {
        self.roles.insert((project, user), role);
    }

    pub fn revoke(&self, project: ProjectId, user: UserId) {
        self.roles.remove(&(project, user));
    }

    /// Builder-style display name.
    pub fn with_name(self, user: UserId, name: impl Into<String>) -> Self {
        self.names.insert(user, name.into());
        self
    }
}

impl ProjectDirectory for StaticDirectory {
    async fn role_of(
        &self,
        project: ProjectId,
        user: UserId,
    ) -> Result<ProjectRole, DirectoryError> {
        Ok(self
            .roles
            .get(&(project, user))
            .map(|r| *r)
            .unwrap_or(ProjectRole::Outsider))
    }

    async fn display_name(&self, user: UserId) -> Result<Option<String>, DirectoryError> {
        Ok(self.names.get(&user).map(|n| n.clone()))
    }
}
