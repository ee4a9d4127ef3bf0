use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crew_core::ids::{GroupId, SessionId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// What a new session is scoped to and where its tools may touch files.
#[derive(Clone, Debug)]
pub struct NewSession {
    /// e.g. "workflow_stage", "persona_run", "discussion".
    pub context_type: String,
    pub context_id: String,
    pub agent_role: String,
    pub sandbox_root: String,
    pub alternate_root: Option<String>,
    /// Restricted to read-only tools, including after a resume.
    pub read_only: bool,
    /// Fan-in group the session reports its completion to.
    pub group_id: Option<GroupId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionRow {
    pub id: SessionId,
    pub context_type: String,
    pub context_id: String,
    pub agent_role: String,
    pub status: SessionStatus,
    pub failure_reason: Option<String>,
    pub sandbox_root: String,
    pub alternate_root: Option<String>,
    pub read_only: bool,
    pub group_id: Option<GroupId>,
    pub created_at: String,
    pub updated_at: String,
}

const SESSION_COLUMNS: &str = "id, context_type, context_id, agent_role, status, failure_reason,
     sandbox_root, alternate_root, read_only, group_id, created_at, updated_at";

pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, new), fields(context_type = %new.context_type, agent_role = %new.agent_role))]
    pub fn create(&self, new: &NewSession) -> Result<SessionRow, StoreError> {
        let id = SessionId::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, context_type, context_id, agent_role, status,
                                       sandbox_root, alternate_root, read_only, group_id,
                                       created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 'active', ?5, ?6, ?7, ?8, ?9, ?9)",
                rusqlite::params![
                    id.as_str(),
                    new.context_type,
                    new.context_id,
                    new.agent_role,
                    new.sandbox_root,
                    new.alternate_root,
                    new.read_only,
                    new.group_id.as_ref().map(GroupId::as_str),
                    now,
                ],
            )?;

            Ok(SessionRow {
                id,
                context_type: new.context_type.clone(),
                context_id: new.context_id.clone(),
                agent_role: new.agent_role.clone(),
                status: SessionStatus::Active,
                failure_reason: None,
                sandbox_root: new.sandbox_root.clone(),
                alternate_root: new.alternate_root.clone(),
                read_only: new.read_only,
                group_id: new.group_id.clone(),
                created_at: now.clone(),
                updated_at: now,
            })
        })
    }

    #[instrument(skip(self), fields(session_id = %id))]
    pub fn get(&self, id: &SessionId) -> Result<SessionRow, StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1");
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_session(row),
                None => Err(StoreError::NotFound(format!("session {id}"))),
            }
        })
    }

    /// List sessions, newest first.
    #[instrument(skip(self))]
    pub fn list(
        &self,
        status: Option<SessionStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<SessionRow>, StoreError> {
        self.db.with_conn(|conn| {
            let status_str = status.map(|s| s.to_string());
            let sql = format!(
                "SELECT {SESSION_COLUMNS} FROM sessions
                 WHERE (?1 IS NULL OR status = ?1)
                 ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(rusqlite::params![status_str, limit, offset])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_session(row)?);
            }
            Ok(results)
        })
    }

    /// Mark an active session completed. Terminal states never change again.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn complete(&self, id: &SessionId) -> Result<(), StoreError> {
        self.finish(id, SessionStatus::Completed, None)
    }

    #[instrument(skip(self), fields(session_id = %id))]
    pub fn fail(&self, id: &SessionId, reason: &str) -> Result<(), StoreError> {
        self.finish(id, SessionStatus::Failed, Some(reason))
    }

    fn finish(
        &self,
        id: &SessionId,
        status: SessionStatus,
        reason: Option<&str>,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            let changed = conn.execute(
                "UPDATE sessions SET status = ?1, failure_reason = ?2, updated_at = ?3
                 WHERE id = ?4 AND status = 'active'",
                rusqlite::params![status.to_string(), reason, now, id.as_str()],
            )?;
            if changed == 0 {
                return match session_status(conn, id)? {
                    Some(current) => Err(StoreError::Conflict(format!(
                        "session {id} is already {current}"
                    ))),
                    None => Err(StoreError::NotFound(format!("session {id}"))),
                };
            }
            Ok(())
        })
    }
}

pub(crate) fn session_status(
    conn: &rusqlite::Connection,
    id: &SessionId,
) -> Result<Option<SessionStatus>, StoreError> {
    let mut stmt = conn.prepare("SELECT status FROM sessions WHERE id = ?1")?;
    let mut rows = stmt.query([id.as_str()])?;
    match rows.next()? {
        Some(row) => {
            let raw: String = row_helpers::get(row, 0, "sessions", "status")?;
            Ok(Some(row_helpers::parse_enum(&raw, "sessions", "status")?))
        }
        None => Ok(None),
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<SessionRow, StoreError> {
    let status_str: String = row_helpers::get(row, 4, "sessions", "status")?;

    Ok(SessionRow {
        id: SessionId::from_raw(row_helpers::get::<String>(row, 0, "sessions", "id")?),
        context_type: row_helpers::get(row, 1, "sessions", "context_type")?,
        context_id: row_helpers::get(row, 2, "sessions", "context_id")?,
        agent_role: row_helpers::get(row, 3, "sessions", "agent_role")?,
        status: row_helpers::parse_enum(&status_str, "sessions", "status")?,
        failure_reason: row_helpers::get_opt(row, 5, "sessions", "failure_reason")?,
        sandbox_root: row_helpers::get(row, 6, "sessions", "sandbox_root")?,
        alternate_root: row_helpers::get_opt(row, 7, "sessions", "alternate_root")?,
        read_only: row_helpers::get(row, 8, "sessions", "read_only")?,
        group_id: row_helpers::get_opt::<String>(row, 9, "sessions", "group_id")?
            .map(GroupId::from_raw),
        created_at: row_helpers::get(row, 10, "sessions", "created_at")?,
        updated_at: row_helpers::get(row, 11, "sessions", "updated_at")?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn new_session(role: &str) -> NewSession {
        NewSession {
            context_type: "workflow_stage".into(),
            context_id: "stage_1".into(),
            agent_role: role.into(),
            sandbox_root: "/work/project".into(),
            alternate_root: None,
            read_only: false,
            group_id: None,
        }
    }

    #[test]
    fn create_and_get() {
        let repo = SessionRepo::new(Database::in_memory().unwrap());
        let session = repo.create(&new_session("planning")).unwrap();
        assert!(session.id.as_str().starts_with("sess_"));
        assert_eq!(session.status, SessionStatus::Active);

        let fetched = repo.get(&session.id).unwrap();
        assert_eq!(fetched.agent_role, "planning");
        assert_eq!(fetched.sandbox_root, "/work/project");
        assert!(fetched.alternate_root.is_none());
    }

    #[test]
    fn persona_membership_survives_reload() {
        let db = Database::in_memory().unwrap();
        let group = crate::FanInRepo::new(db.clone()).create_group(2).unwrap();
        let repo = SessionRepo::new(db);
        let session = repo
            .create(&NewSession {
                read_only: true,
                group_id: Some(group.id.clone()),
                ..new_session("security_reviewer")
            })
            .unwrap();

        let fetched = repo.get(&session.id).unwrap();
        assert!(fetched.read_only);
        assert_eq!(fetched.group_id, Some(group.id));
        assert!(!repo.create(&new_session("execution")).unwrap().read_only);
    }

    #[test]
    fn unknown_group_is_refused() {
        let repo = SessionRepo::new(Database::in_memory().unwrap());
        let result = repo.create(&NewSession {
            group_id: Some(GroupId::from_raw("grp_missing")),
            ..new_session("reviewer")
        });
        assert!(result.is_err());
    }

    #[test]
    fn get_nonexistent_fails() {
        let repo = SessionRepo::new(Database::in_memory().unwrap());
        let result = repo.get(&SessionId::from_raw("sess_missing"));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn list_with_status_filter() {
        let repo = SessionRepo::new(Database::in_memory().unwrap());
        let a = repo.create(&new_session("research")).unwrap();
        repo.create(&new_session("review")).unwrap();
        repo.complete(&a.id).unwrap();

        assert_eq!(repo.list(None, 10, 0).unwrap().len(), 2);
        let active = repo.list(Some(SessionStatus::Active), 10, 0).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].agent_role, "review");
        assert_eq!(repo.list(Some(SessionStatus::Completed), 10, 0).unwrap().len(), 1);
    }

    #[test]
    fn fail_records_reason_and_is_terminal() {
        let repo = SessionRepo::new(Database::in_memory().unwrap());
        let s = repo.create(&new_session("execution")).unwrap();
        repo.fail(&s.id, "cancelled").unwrap();

        let fetched = repo.get(&s.id).unwrap();
        assert_eq!(fetched.status, SessionStatus::Failed);
        assert_eq!(fetched.failure_reason.as_deref(), Some("cancelled"));

        let again = repo.complete(&s.id);
        assert!(matches!(again, Err(StoreError::Conflict(_))));
    }

    #[test]
    fn invalid_session_status_rejected_by_schema() {
        let db = Database::in_memory().unwrap();
        let result = db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, context_type, context_id, agent_role, status, sandbox_root, created_at, updated_at)
                 VALUES ('sess_x', 't', 'c', 'r', 'archived', '/w', 'now', 'now')",
                [],
            )?;
            Ok(())
        });
        assert!(result.is_err());
    }
}
