use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crew_core::ids::{QuestionId, SessionId, TurnId};
use crew_core::protocol::{QuestionDraft, QuestionKind};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionStatus {
    Pending,
    Answered,
    Skipped,
}

impl std::fmt::Display for QuestionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Answered => write!(f, "answered"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

impl std::str::FromStr for QuestionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "answered" => Ok(Self::Answered),
            "skipped" => Ok(Self::Skipped),
            other => Err(format!("unknown question status: {other}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuestionRow {
    pub id: QuestionId,
    pub session_id: SessionId,
    pub turn_id: TurnId,
    pub kind: QuestionKind,
    pub prompt: String,
    pub options: Vec<String>,
    pub answer: Option<String>,
    pub status: QuestionStatus,
    pub created_at: String,
    pub resolved_at: Option<String>,
}

/// Questions raised by checkpoints. Each is resolved exactly once and never
/// deleted.
pub struct QuestionRepo {
    db: Database,
}

impl QuestionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, draft), fields(session_id = %session_id, kind = %draft.kind))]
    pub fn create(
        &self,
        session_id: &SessionId,
        turn_id: &TurnId,
        draft: &QuestionDraft,
    ) -> Result<QuestionRow, StoreError> {
        self.db
            .with_conn(|conn| insert_question(conn, session_id, turn_id, draft))
    }

    pub fn get(&self, id: &QuestionId) -> Result<QuestionRow, StoreError> {
        self.db.with_conn(|conn| {
            query_question(conn, id)?.ok_or_else(|| StoreError::NotFound(format!("question {id}")))
        })
    }

    /// Record the operator's answer. Select kinds must answer with their own
    /// options; multi select and ranked answers are JSON string arrays.
    #[instrument(skip(self, answer), fields(question_id = %id))]
    pub fn answer(&self, id: &QuestionId, answer: &str) -> Result<QuestionRow, StoreError> {
        self.db.with_conn(|conn| {
            let question = query_question(conn, id)?
                .ok_or_else(|| StoreError::NotFound(format!("question {id}")))?;
            validate_answer(&question, answer)?;
            resolve(conn, id, QuestionStatus::Answered, Some(answer))?;
            query_question(conn, id)?.ok_or_else(|| StoreError::NotFound(format!("question {id}")))
        })
    }

    #[instrument(skip(self), fields(question_id = %id))]
    pub fn skip(&self, id: &QuestionId) -> Result<QuestionRow, StoreError> {
        self.db.with_conn(|conn| {
            resolve(conn, id, QuestionStatus::Skipped, None)?;
            query_question(conn, id)?.ok_or_else(|| StoreError::NotFound(format!("question {id}")))
        })
    }

    pub fn list(&self, session_id: &SessionId) -> Result<Vec<QuestionRow>, StoreError> {
        self.db
            .with_conn(|conn| query_for_session(conn, session_id, None))
    }

    pub fn pending(&self, session_id: &SessionId) -> Result<Vec<QuestionRow>, StoreError> {
        self.db.with_conn(|conn| {
            query_for_session(conn, session_id, Some(QuestionStatus::Pending))
        })
    }
}

pub(crate) fn insert_question(
    conn: &Connection,
    session_id: &SessionId,
    turn_id: &TurnId,
    draft: &QuestionDraft,
) -> Result<QuestionRow, StoreError> {
    if draft.prompt.trim().is_empty() {
        return Err(StoreError::Conflict("question prompt is empty".into()));
    }
    if draft.kind.needs_options() && draft.options.is_empty() {
        return Err(StoreError::Conflict(format!(
            "{} question needs options",
            draft.kind
        )));
    }

    let id = QuestionId::new();
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO questions (id, session_id, turn_id, kind, prompt, options, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7)",
        rusqlite::params![
            id.as_str(),
            session_id.as_str(),
            turn_id.as_str(),
            draft.kind.as_str(),
            draft.prompt,
            serde_json::to_string(&draft.options)?,
            now,
        ],
    )?;

    Ok(QuestionRow {
        id,
        session_id: session_id.clone(),
        turn_id: turn_id.clone(),
        kind: draft.kind,
        prompt: draft.prompt.clone(),
        options: draft.options.clone(),
        answer: None,
        status: QuestionStatus::Pending,
        created_at: now,
        resolved_at: None,
    })
}

fn validate_answer(question: &QuestionRow, answer: &str) -> Result<(), StoreError> {
    if answer.trim().is_empty() {
        return Err(StoreError::Conflict("answer is empty".into()));
    }
    let known = |choice: &str| question.options.iter().any(|o| o == choice);
    match question.kind {
        QuestionKind::FreeText => Ok(()),
        QuestionKind::SingleSelect => {
            if known(answer) {
                Ok(())
            } else {
                Err(StoreError::Conflict(format!("{answer:?} is not an option")))
            }
        }
        QuestionKind::MultiSelect | QuestionKind::Ranked => {
            let choices: Vec<String> = serde_json::from_str(answer).map_err(|e| {
                StoreError::Conflict(format!("{} answer must be a JSON array: {e}", question.kind))
            })?;
            if choices.is_empty() {
                return Err(StoreError::Conflict("answer selects nothing".into()));
            }
            for (i, choice) in choices.iter().enumerate() {
                if !known(choice) {
                    return Err(StoreError::Conflict(format!("{choice:?} is not an option")));
                }
                if choices[..i].contains(choice) {
                    return Err(StoreError::Conflict(format!("{choice:?} chosen twice")));
                }
            }
            if question.kind == QuestionKind::Ranked && choices.len() != question.options.len() {
                return Err(StoreError::Conflict("ranking must order every option".into()));
            }
            Ok(())
        }
    }
}

fn resolve(
    conn: &Connection,
    id: &QuestionId,
    status: QuestionStatus,
    answer: Option<&str>,
) -> Result<(), StoreError> {
    let now = Utc::now().to_rfc3339();
    let changed = conn.execute(
        "UPDATE questions SET status = ?1, answer = ?2, resolved_at = ?3
         WHERE id = ?4 AND status = 'pending'",
        rusqlite::params![status.to_string(), answer, now, id.as_str()],
    )?;
    if changed == 0 {
        let current: Option<String> = conn
            .query_row("SELECT status FROM questions WHERE id = ?1", [id.as_str()], |row| {
                row.get(0)
            })
            .optional()?;
        return match current {
            Some(current) => Err(StoreError::Conflict(format!(
                "question {id} is already {current}"
            ))),
            None => Err(StoreError::NotFound(format!("question {id}"))),
        };
    }
    Ok(())
}

const QUESTION_COLUMNS: &str =
    "id, session_id, turn_id, kind, prompt, options, answer, status, created_at, resolved_at";

fn query_question(conn: &Connection, id: &QuestionId) -> Result<Option<QuestionRow>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {QUESTION_COLUMNS} FROM questions WHERE id = ?1"
    ))?;
    let mut rows = stmt.query([id.as_str()])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_question(row)?)),
        None => Ok(None),
    }
}

pub(crate) fn query_for_session(
    conn: &Connection,
    session_id: &SessionId,
    status: Option<QuestionStatus>,
) -> Result<Vec<QuestionRow>, StoreError> {
    let status = status.map(|s| s.to_string());
    let mut stmt = conn.prepare(&format!(
        "SELECT {QUESTION_COLUMNS} FROM questions
         WHERE session_id = ?1 AND (?2 IS NULL OR status = ?2)
         ORDER BY created_at, rowid"
    ))?;
    let mut rows = stmt.query(rusqlite::params![session_id.as_str(), status])?;
    let mut questions = Vec::new();
    while let Some(row) = rows.next()? {
        questions.push(row_to_question(row)?);
    }
    Ok(questions)
}

fn row_to_question(row: &rusqlite::Row<'_>) -> Result<QuestionRow, StoreError> {
    let kind: String = row_helpers::get(row, 3, "questions", "kind")?;
    let options: String = row_helpers::get(row, 5, "questions", "options")?;
    let status: String = row_helpers::get(row, 7, "questions", "status")?;
    let options: Vec<String> = row_helpers::parse_json(&options, "questions", "options")?;
    Ok(QuestionRow {
        id: QuestionId::from_raw(row_helpers::get::<String>(row, 0, "questions", "id")?),
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 1, "questions", "session_id")?),
        turn_id: TurnId::from_raw(row_helpers::get::<String>(row, 2, "questions", "turn_id")?),
        kind: row_helpers::parse_enum(&kind, "questions", "kind")?,
        prompt: row_helpers::get(row, 4, "questions", "prompt")?,
        options,
        answer: row_helpers::get_opt(row, 6, "questions", "answer")?,
        status: row_helpers::parse_enum(&status, "questions", "status")?,
        created_at: row_helpers::get(row, 8, "questions", "created_at")?,
        resolved_at: row_helpers::get_opt(row, 9, "questions", "resolved_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::tests::new_session;
    use crate::turns::TurnLog;

    fn setup() -> (QuestionRepo, TurnLog, SessionId, TurnId) {
        let db = Database::in_memory().unwrap();
        let log = TurnLog::new(db.clone());
        let session = log.create_session(&new_session("scoping")).unwrap();
        let turn = log.begin_turn(&session.id, "scoping").unwrap().turn;
        (QuestionRepo::new(db), log, session.id, turn.id)
    }

    fn draft(kind: QuestionKind, options: &[&str]) -> QuestionDraft {
        QuestionDraft {
            kind,
            prompt: "Which database?".into(),
            options: options.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn create_and_answer_single_select() {
        let (repo, _log, sid, tid) = setup();
        let q = repo
            .create(&sid, &tid, &draft(QuestionKind::SingleSelect, &["sqlite", "postgres"]))
            .unwrap();
        assert_eq!(q.status, QuestionStatus::Pending);

        let answered = repo.answer(&q.id, "sqlite").unwrap();
        assert_eq!(answered.status, QuestionStatus::Answered);
        assert_eq!(answered.answer.as_deref(), Some("sqlite"));
        assert!(answered.resolved_at.is_some());
        assert_eq!(answered.options, vec!["sqlite", "postgres"]);
    }

    #[test]
    fn question_resolves_only_once() {
        let (repo, _log, sid, tid) = setup();
        let q = repo
            .create(&sid, &tid, &draft(QuestionKind::FreeText, &[]))
            .unwrap();
        repo.answer(&q.id, "use sqlite").unwrap();
        assert!(matches!(repo.answer(&q.id, "again"), Err(StoreError::Conflict(_))));
        assert!(matches!(repo.skip(&q.id), Err(StoreError::Conflict(_))));
        assert_eq!(repo.get(&q.id).unwrap().answer.as_deref(), Some("use sqlite"));
    }

    #[test]
    fn answered_without_answer_rejected_by_schema() {
        let (repo, _log, sid, tid) = setup();
        let q = repo
            .create(&sid, &tid, &draft(QuestionKind::FreeText, &[]))
            .unwrap();
        let result = repo.db.with_conn(|conn| {
            conn.execute(
                "UPDATE questions SET status = 'answered' WHERE id = ?1",
                [q.id.as_str()],
            )?;
            Ok(())
        });
        assert!(result.is_err());
        assert_eq!(repo.get(&q.id).unwrap().status, QuestionStatus::Pending);
    }

    #[test]
    fn questions_are_never_deleted() {
        let (repo, _log, sid, tid) = setup();
        let q = repo
            .create(&sid, &tid, &draft(QuestionKind::FreeText, &[]))
            .unwrap();
        let result = repo.db.with_conn(|conn| {
            conn.execute("DELETE FROM questions WHERE id = ?1", [q.id.as_str()])?;
            Ok(())
        });
        assert!(result.is_err());
        assert!(repo.get(&q.id).is_ok());
    }

    #[test]
    fn answer_validation_by_kind() {
        let (repo, _log, sid, tid) = setup();
        let single = repo
            .create(&sid, &tid, &draft(QuestionKind::SingleSelect, &["a", "b"]))
            .unwrap();
        assert!(repo.answer(&single.id, "c").is_err());
        assert!(repo.answer(&single.id, "  ").is_err());

        let multi = repo
            .create(&sid, &tid, &draft(QuestionKind::MultiSelect, &["a", "b", "c"]))
            .unwrap();
        assert!(repo.answer(&multi.id, "a").is_err());
        assert!(repo.answer(&multi.id, r#"["a","a"]"#).is_err());
        assert!(repo.answer(&multi.id, r#"["a","c"]"#).is_ok());

        let ranked = repo
            .create(&sid, &tid, &draft(QuestionKind::Ranked, &["x", "y"]))
            .unwrap();
        assert!(repo.answer(&ranked.id, r#"["y"]"#).is_err());
        assert!(repo.answer(&ranked.id, r#"["y","x"]"#).is_ok());
    }

    #[test]
    fn select_question_without_options_rejected() {
        let (repo, _log, sid, tid) = setup();
        let result = repo.create(&sid, &tid, &draft(QuestionKind::Ranked, &[]));
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[test]
    fn pending_lists_only_unresolved() {
        let (repo, _log, sid, tid) = setup();
        let a = repo.create(&sid, &tid, &draft(QuestionKind::FreeText, &[])).unwrap();
        let b = repo.create(&sid, &tid, &draft(QuestionKind::FreeText, &[])).unwrap();
        repo.skip(&a.id).unwrap();

        let pending = repo.pending(&sid).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, b.id);
        assert_eq!(repo.list(&sid).unwrap().len(), 2);
        assert_eq!(repo.get(&a.id).unwrap().status, QuestionStatus::Skipped);
    }
}
