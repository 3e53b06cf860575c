//! Authorization predicates.
//!
//! Every guarded operation in Ensemble calls exactly one of these before
//! touching state. They are plain functions over a session snapshot, so
//! the participant layer uses the same rules as the lifecycle.

use ensemble_protocol::{ProjectId, UserId};

use crate::{ProjectDirectory, ProjectRole, Session, SessionError};

/// Only the session's host.
pub fn require_host(
    session: &Session,
    user: UserId,
    action: &'static str,
) -> Result<(), SessionError> {
    if session.is_host(user) {
        Ok(())
    } else {
        Err(SessionError::PermissionDenied { user_id: user, action })
    }
}

/// The host, or an admin of the owning project.
pub async fn require_host_or_admin<D: ProjectDirectory>(
    session: &Session,
    user: UserId,
    directory: &D,
    action: &'static str,
) -> Result<(), SessionError> {
    if session.is_host(user) {
        return Ok(());
    }
    let role = directory.role_of(session.project_id, user).await?;
    if role.is_admin() {
        Ok(())
    } else {
        Err(SessionError::PermissionDenied { user_id: user, action })
    }
}

/// Any member (or admin) of the project. Returns the role so callers can
/// make finer decisions without a second lookup.
pub async fn require_project_member<D: ProjectDirectory>(
    project: ProjectId,
    user: UserId,
    directory: &D,
    action: &'static str,
) -> Result<ProjectRole, SessionError> {
    let role = directory.role_of(project, user).await?;
    if role.is_member() {
        Ok(role)
    } else {
        Err(SessionError::PermissionDenied { user_id: user, action })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use ensemble_protocol::SessionId;

    use super::*;
    use crate::{SessionState, SessionType, StaticDirectory};

    fn session(host: u64) -> Session {
        let now = Utc::now();
        Session {
            id: SessionId::new("s"),
            project_id: ProjectId(1),
            host_id: UserId(host),
            title: "t".into(),
            description: None,
            session_type: SessionType::Recording,
            state: SessionState::Scheduled,
            scheduled_start: now,
            actual_start: None,
            actual_end: None,
            recording_enabled: false,
            max_participants: 4,
            requires_approval: true,
            created_at: now,
            cancel_reason: None,
        }
    }

    #[test]
    fn test_require_host_rejects_member() {
        let s = session(1);
        assert!(require_host(&s, UserId(1), "pause").is_ok());

        let err = require_host(&s, UserId(2), "pause").unwrap_err();
        assert!(matches!(
            err,
            SessionError::PermissionDenied { user_id: UserId(2), action: "pause" }
        ));
    }

    #[tokio::test]
    async fn test_require_host_or_admin_accepts_project_admin() {
        let s = session(1);
        let dir = StaticDirectory::new()
            .with_admin(ProjectId(1), UserId(9))
            .with_member(ProjectId(1), UserId(3));

        assert!(require_host_or_admin(&s, UserId(1), &dir, "cancel").await.is_ok());
        assert!(require_host_or_admin(&s, UserId(9), &dir, "cancel").await.is_ok());
        assert!(require_host_or_admin(&s, UserId(3), &dir, "cancel").await.is_err());
    }

    #[tokio::test]
    async fn test_require_project_member_returns_role() {
        let dir = StaticDirectory::new().with_member(ProjectId(1), UserId(3));

        let role = require_project_member(ProjectId(1), UserId(3), &dir, "create")
            .await
            .unwrap();
        assert_eq!(role, ProjectRole::Member);

        assert!(
            require_project_member(ProjectId(1), UserId(4), &dir, "create")
                .await
                .is_err()
        );
    }
}
