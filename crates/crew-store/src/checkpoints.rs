use chrono::Utc;
use rusqlite::{Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crew_core::ids::{NoteId, SessionId, TodoId, TurnId};
use crew_core::protocol::CheckpointPayload;

use crate::database::Database;
use crate::error::StoreError;
use crate::questions::{insert_question, query_for_session, QuestionRow};
use crate::row_helpers;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NoteRow {
    pub id: NoteId,
    pub session_id: SessionId,
    pub turn_id: Option<TurnId>,
    pub content: String,
    pub created_at: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TodoRow {
    pub id: TodoId,
    pub session_id: SessionId,
    pub content: String,
    pub completed: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// Rows written by one checkpoint.
#[derive(Clone, Debug, Default)]
pub struct AppliedCheckpoint {
    pub questions: Vec<QuestionRow>,
    pub notes: Vec<NoteRow>,
    pub todos: Vec<TodoRow>,
    pub toggled: Vec<TodoRow>,
}

/// Everything a session carries into its next turn.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CheckpointView {
    pub notes: Vec<NoteRow>,
    pub todos: Vec<TodoRow>,
    pub questions: Vec<QuestionRow>,
}

impl CheckpointView {
    pub fn is_empty(&self) -> bool {
        self.notes.is_empty() && self.todos.is_empty() && self.questions.is_empty()
    }

    pub fn open_todos(&self) -> impl Iterator<Item = &TodoRow> {
        self.todos.iter().filter(|t| !t.completed)
    }
}

/// Notes (additive) and todos (toggle-complete) carried between turns.
pub struct CheckpointRepo {
    db: Database,
}

impl CheckpointRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, content), fields(session_id = %session_id))]
    pub fn add_note(
        &self,
        session_id: &SessionId,
        turn_id: Option<&TurnId>,
        content: &str,
    ) -> Result<NoteRow, StoreError> {
        self.db
            .with_conn(|conn| insert_note(conn, session_id, turn_id, content))
    }

    #[instrument(skip(self, content), fields(session_id = %session_id))]
    pub fn add_todo(&self, session_id: &SessionId, content: &str) -> Result<TodoRow, StoreError> {
        self.db
            .with_conn(|conn| insert_todo(conn, session_id, content))
    }

    /// Flip a todo's completion flag.
    #[instrument(skip(self), fields(session_id = %session_id, todo_id = %todo_id))]
    pub fn toggle_todo(&self, session_id: &SessionId, todo_id: &TodoId) -> Result<TodoRow, StoreError> {
        self.db
            .with_conn(|conn| toggle(conn, session_id, todo_id))
    }

    pub fn notes(&self, session_id: &SessionId) -> Result<Vec<NoteRow>, StoreError> {
        self.db.with_conn(|conn| query_notes(conn, session_id))
    }

    pub fn todos(&self, session_id: &SessionId) -> Result<Vec<TodoRow>, StoreError> {
        self.db.with_conn(|conn| query_todos(conn, session_id))
    }

    /// Persist a checkpoint's questions, notes, todo additions and toggles.
    /// All or nothing.
    #[instrument(skip(self, payload), fields(session_id = %session_id, turn_id = %turn_id))]
    pub fn apply(
        &self,
        session_id: &SessionId,
        turn_id: &TurnId,
        payload: &CheckpointPayload,
    ) -> Result<AppliedCheckpoint, StoreError> {
        self.db.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut applied = AppliedCheckpoint::default();
            for draft in &payload.questions {
                applied
                    .questions
                    .push(insert_question(&tx, session_id, turn_id, draft)?);
            }
            for note in &payload.notes {
                applied
                    .notes
                    .push(insert_note(&tx, session_id, Some(turn_id), note)?);
            }
            for todo in &payload.todos {
                applied.todos.push(insert_todo(&tx, session_id, todo)?);
            }
            for todo_id in &payload.toggle_todos {
                applied.toggled.push(toggle(&tx, session_id, todo_id)?);
            }
            tx.commit()?;
            debug!(
                questions = applied.questions.len(),
                notes = applied.notes.len(),
                todos = applied.todos.len(),
                toggled = applied.toggled.len(),
                "checkpoint applied"
            );
            Ok(applied)
        })
    }

    /// Load what the next turn renders: all notes, all todos and every question.
    pub fn view(&self, session_id: &SessionId) -> Result<CheckpointView, StoreError> {
        self.db.with_conn(|conn| {
            Ok(CheckpointView {
                notes: query_notes(conn, session_id)?,
                todos: query_todos(conn, session_id)?,
                questions: query_for_session(conn, session_id, None)?,
            })
        })
    }
}

fn insert_note(
    conn: &Connection,
    session_id: &SessionId,
    turn_id: Option<&TurnId>,
    content: &str,
) -> Result<NoteRow, StoreError> {
    let id = NoteId::new();
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO notes (id, session_id, turn_id, content, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![
            id.as_str(),
            session_id.as_str(),
            turn_id.map(|t| t.as_str()),
            content,
            now
        ],
    )?;
    Ok(NoteRow {
        id,
        session_id: session_id.clone(),
        turn_id: turn_id.cloned(),
        content: content.to_string(),
        created_at: now,
    })
}

fn insert_todo(conn: &Connection, session_id: &SessionId, content: &str) -> Result<TodoRow, StoreError> {
    let id = TodoId::new();
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO todos (id, session_id, content, completed, created_at, updated_at)
         VALUES (?1, ?2, ?3, 0, ?4, ?4)",
        rusqlite::params![id.as_str(), session_id.as_str(), content, now],
    )?;
    Ok(TodoRow {
        id,
        session_id: session_id.clone(),
        content: content.to_string(),
        completed: false,
        created_at: now.clone(),
        updated_at: now,
    })
}

fn toggle(conn: &Connection, session_id: &SessionId, todo_id: &TodoId) -> Result<TodoRow, StoreError> {
    let now = Utc::now().to_rfc3339();
    let changed = conn.execute(
        "UPDATE todos SET completed = 1 - completed, updated_at = ?1
         WHERE id = ?2 AND session_id = ?3",
        rusqlite::params![now, todo_id.as_str(), session_id.as_str()],
    )?;
    if changed == 0 {
        return Err(StoreError::NotFound(format!(
            "todo {todo_id} in session {session_id}"
        )));
    }
    let mut stmt = conn.prepare(&format!("SELECT {TODO_COLUMNS} FROM todos WHERE id = ?1"))?;
    let mut rows = stmt.query([todo_id.as_str()])?;
    match rows.next()? {
        Some(row) => row_to_todo(row),
        None => Err(StoreError::NotFound(format!("todo {todo_id}"))),
    }
}

fn query_notes(conn: &Connection, session_id: &SessionId) -> Result<Vec<NoteRow>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, session_id, turn_id, content, created_at FROM notes
         WHERE session_id = ?1 ORDER BY created_at, rowid",
    )?;
    let mut rows = stmt.query([session_id.as_str()])?;
    let mut notes = Vec::new();
    while let Some(row) = rows.next()? {
        notes.push(NoteRow {
            id: NoteId::from_raw(row_helpers::get::<String>(row, 0, "notes", "id")?),
            session_id: SessionId::from_raw(row_helpers::get::<String>(row, 1, "notes", "session_id")?),
            turn_id: row_helpers::get_opt::<String>(row, 2, "notes", "turn_id")?.map(TurnId::from_raw),
            content: row_helpers::get(row, 3, "notes", "content")?,
            created_at: row_helpers::get(row, 4, "notes", "created_at")?,
        });
    }
    Ok(notes)
}

const TODO_COLUMNS: &str = "id, session_id, content, completed, created_at, updated_at";

fn query_todos(conn: &Connection, session_id: &SessionId) -> Result<Vec<TodoRow>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {TODO_COLUMNS} FROM todos WHERE session_id = ?1 ORDER BY created_at, rowid"
    ))?;
    let mut rows = stmt.query([session_id.as_str()])?;
    let mut todos = Vec::new();
    while let Some(row) = rows.next()? {
        todos.push(row_to_todo(row)?);
    }
    Ok(todos)
}

fn row_to_todo(row: &rusqlite::Row<'_>) -> Result<TodoRow, StoreError> {
    Ok(TodoRow {
        id: TodoId::from_raw(row_helpers::get::<String>(row, 0, "todos", "id")?),
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 1, "todos", "session_id")?),
        content: row_helpers::get(row, 2, "todos", "content")?,
        completed: row_helpers::get::<i64>(row, 3, "todos", "completed")? != 0,
        created_at: row_helpers::get(row, 4, "todos", "created_at")?,
        updated_at: row_helpers::get(row, 5, "todos", "updated_at")?,
    })
}
