use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use crew_core::ids::{InvocationId, MessageId, SessionId, ThoughtId, ToolCallId, TurnId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;
use crate::sessions::{session_status, NewSession, SessionRepo, SessionRow, SessionStatus};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Streaming,
    Completed,
    Failed,
}

impl std::fmt::Display for TurnStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Streaming => write!(f, "streaming"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for TurnStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "streaming" => Ok(Self::Streaming),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown turn status: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Pending,
    Success,
    Failed,
}

impl std::fmt::Display for InvocationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for InvocationStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown invocation status: {other}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TurnRow {
    pub id: TurnId,
    pub session_id: SessionId,
    pub turn_index: u32,
    pub role: String,
    pub status: TurnStatus,
    pub token_count: u32,
    pub failure_reason: Option<String>,
    pub started_at: String,
    pub ended_at: Option<String>,
}

/// Result of `begin_turn`: either a fresh turn or the streaming turn a crash
/// left behind.
#[derive(Clone, Debug)]
pub struct OpenedTurn {
    pub turn: TurnRow,
    pub resumed: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: MessageId,
    pub turn_id: TurnId,
    pub ordinal: u32,
    pub content: String,
    pub created_at: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ThoughtRow {
    pub id: ThoughtId,
    pub turn_id: TurnId,
    pub ordinal: u32,
    pub content: String,
    pub created_at: String,
}

#[derive(Clone, Debug)]
pub struct NewInvocation {
    pub call_id: ToolCallId,
    pub name: String,
    pub rationale: Option<String>,
    pub input: serde_json::Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InvocationRow {
    pub id: InvocationId,
    pub turn_id: TurnId,
    pub ordinal: u32,
    pub call_id: ToolCallId,
    pub name: String,
    pub rationale: Option<String>,
    pub input: serde_json::Value,
    pub output: Option<String>,
    pub status: InvocationStatus,
    pub started_at: String,
    pub completed_at: Option<String>,
}

/// One entry of a turn, in the order it was written.
#[derive(Clone, Copy, Debug)]
pub enum TurnEntry<'a> {
    Message(&'a MessageRow),
    Thought(&'a ThoughtRow),
    Invocation(&'a InvocationRow),
}

impl TurnEntry<'_> {
    pub fn ordinal(&self) -> u32 {
        match self {
            Self::Message(m) => m.ordinal,
            Self::Thought(t) => t.ordinal,
            Self::Invocation(i) => i.ordinal,
        }
    }
}

/// A turn with everything recorded inside it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TurnRecord {
    pub turn: TurnRow,
    pub messages: Vec<MessageRow>,
    pub thoughts: Vec<ThoughtRow>,
    pub invocations: Vec<InvocationRow>,
}

impl TurnRecord {
    /// All entries merged by ordinal.
    pub fn entries(&self) -> Vec<TurnEntry<'_>> {
        let mut entries: Vec<TurnEntry<'_>> = self
            .messages
            .iter()
            .map(TurnEntry::Message)
            .chain(self.thoughts.iter().map(TurnEntry::Thought))
            .chain(self.invocations.iter().map(TurnEntry::Invocation))
            .collect();
        entries.sort_by_key(|e| e.ordinal());
        entries
    }
}

const INTERRUPTED_OUTPUT: &str = "interrupted before completion";

/// Append-only log of sessions, turns and their entries. The only way
/// callers read or write conversation history.
pub struct TurnLog {
    db: Database,
    sessions: SessionRepo,
}

impl TurnLog {
    pub fn new(db: Database) -> Self {
        Self {
            sessions: SessionRepo::new(db.clone()),
            db,
        }
    }

    pub fn create_session(&self, new: &NewSession) -> Result<SessionRow, StoreError> {
        self.sessions.create(new)
    }

    pub fn session(&self, id: &SessionId) -> Result<SessionRow, StoreError> {
        self.sessions.get(id)
    }

    pub fn complete_session(&self, id: &SessionId) -> Result<(), StoreError> {
        self.sessions.complete(id)
    }

    pub fn fail_session(&self, id: &SessionId, reason: &str) -> Result<(), StoreError> {
        self.sessions.fail(id, reason)
    }

    /// Start the next turn, or hand back the turn still streaming from an
    /// interrupted run.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn begin_turn(&self, session_id: &SessionId, role: &str) -> Result<OpenedTurn, StoreError> {
        self.db.with_conn(|conn| {
            match session_status(conn, session_id)? {
                Some(SessionStatus::Active) => {}
                Some(other) => {
                    return Err(StoreError::Conflict(format!(
                        "session {session_id} is {other}"
                    )))
                }
                None => return Err(StoreError::NotFound(format!("session {session_id}"))),
            }

            if let Some(turn) = query_streaming_turn(conn, session_id)? {
                warn!(turn_index = turn.turn_index, "resuming streaming turn");
                return Ok(OpenedTurn {
                    turn,
                    resumed: true,
                });
            }

            let turn_index: u32 = conn.query_row(
                "SELECT COALESCE(MAX(turn_index) + 1, 0) FROM turns WHERE session_id = ?1",
                [session_id.as_str()],
                |row| row.get(0),
            )?;
            let id = TurnId::new();
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO turns (id, session_id, turn_index, role, status, started_at)
                 VALUES (?1, ?2, ?3, ?4, 'streaming', ?5)",
                rusqlite::params![id.as_str(), session_id.as_str(), turn_index, role, now],
            )?;

            Ok(OpenedTurn {
                turn: TurnRow {
                    id,
                    session_id: session_id.clone(),
                    turn_index,
                    role: role.to_string(),
                    status: TurnStatus::Streaming,
                    token_count: 0,
                    failure_reason: None,
                    started_at: now,
                    ended_at: None,
                },
                resumed: false,
            })
        })
    }

    #[instrument(skip(self, content), fields(turn_id = %turn_id, len = content.len()))]
    pub fn append_message(&self, turn_id: &TurnId, content: &str) -> Result<MessageRow, StoreError> {
        self.db.with_conn(|conn| {
            let ordinal = next_ordinal(conn, turn_id)?;
            let id = MessageId::new();
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO messages (id, turn_id, ordinal, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![id.as_str(), turn_id.as_str(), ordinal, content, now],
            )?;
            Ok(MessageRow {
                id,
                turn_id: turn_id.clone(),
                ordinal,
                content: content.to_string(),
                created_at: now,
            })
        })
    }

    #[instrument(skip(self, content), fields(turn_id = %turn_id, len = content.len()))]
    pub fn append_thought(&self, turn_id: &TurnId, content: &str) -> Result<ThoughtRow, StoreError> {
        self.db.with_conn(|conn| {
            let ordinal = next_ordinal(conn, turn_id)?;
            let id = ThoughtId::new();
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO thoughts (id, turn_id, ordinal, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![id.as_str(), turn_id.as_str(), ordinal, content, now],
            )?;
            Ok(ThoughtRow {
                id,
                turn_id: turn_id.clone(),
                ordinal,
                content: content.to_string(),
                created_at: now,
            })
        })
    }

    /// Record a tool call before it runs. A turn has at most one pending call.
    #[instrument(skip(self, new), fields(turn_id = %turn_id, tool = %new.name))]
    pub fn start_tool_invocation(
        &self,
        turn_id: &TurnId,
        new: &NewInvocation,
    ) -> Result<InvocationRow, StoreError> {
        self.db.with_conn(|conn| {
            let pending: i64 = conn.query_row(
                "SELECT COUNT(*) FROM tool_invocations WHERE turn_id = ?1 AND status = 'pending'",
                [turn_id.as_str()],
                |row| row.get(0),
            )?;
            if pending > 0 {
                return Err(StoreError::Conflict(format!(
                    "turn {turn_id} already has a pending tool invocation"
                )));
            }

            let ordinal = next_ordinal(conn, turn_id)?;
            let id = InvocationId::new();
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO tool_invocations
                     (id, turn_id, ordinal, call_id, name, rationale, input, status, started_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8)",
                rusqlite::params![
                    id.as_str(),
                    turn_id.as_str(),
                    ordinal,
                    new.call_id.as_str(),
                    new.name,
                    new.rationale,
                    serde_json::to_string(&new.input)?,
                    now,
                ],
            )
            .map_err(|e| {
                if StoreError::is_constraint(&e) {
                    StoreError::Conflict(format!(
                        "turn {turn_id} already has a pending tool invocation"
                    ))
                } else {
                    e.into()
                }
            })?;

            Ok(InvocationRow {
                id,
                turn_id: turn_id.clone(),
                ordinal,
                call_id: new.call_id.clone(),
                name: new.name.clone(),
                rationale: new.rationale.clone(),
                input: new.input.clone(),
                output: None,
                status: InvocationStatus::Pending,
                started_at: now,
                completed_at: None,
            })
        })
    }

    #[instrument(skip(self, output), fields(invocation_id = %id))]
    pub fn finish_tool_invocation(
        &self,
        id: &InvocationId,
        success: bool,
        output: &str,
    ) -> Result<(), StoreError> {
        let status = if success {
            InvocationStatus::Success
        } else {
            InvocationStatus::Failed
        };
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            let changed = conn.execute(
                "UPDATE tool_invocations SET status = ?1, output = ?2, completed_at = ?3
                 WHERE id = ?4 AND status = 'pending'",
                rusqlite::params![status.to_string(), output, now, id.as_str()],
            )?;
            if changed == 0 {
                let exists: Option<String> = conn
                    .query_row(
                        "SELECT status FROM tool_invocations WHERE id = ?1",
                        [id.as_str()],
                        |row| row.get(0),
                    )
                    .optional()?;
                return match exists {
                    Some(current) => Err(StoreError::Conflict(format!(
                        "invocation {id} is already {current}"
                    ))),
                    None => Err(StoreError::NotFound(format!("invocation {id}"))),
                };
            }
            Ok(())
        })
    }

    /// Seal a turn. Completed turns are immutable.
    #[instrument(skip(self), fields(turn_id = %turn_id))]
    pub fn complete_turn(&self, turn_id: &TurnId, token_count: u32) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let pending: i64 = conn.query_row(
                "SELECT COUNT(*) FROM tool_invocations WHERE turn_id = ?1 AND status = 'pending'",
                [turn_id.as_str()],
                |row| row.get(0),
            )?;
            if pending > 0 {
                return Err(StoreError::Conflict(format!(
                    "turn {turn_id} has a pending tool invocation"
                )));
            }
            end_turn(conn, turn_id, TurnStatus::Completed, token_count, None)
        })
    }

    /// Mark a turn failed, resolving any call still pending inside it. The
    /// tokens it streamed before failing are kept.
    #[instrument(skip(self), fields(turn_id = %turn_id))]
    pub fn fail_turn(&self, turn_id: &TurnId, reason: &str, token_count: u32) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            interrupt(conn, turn_id)?;
            end_turn(conn, turn_id, TurnStatus::Failed, token_count, Some(reason))
        })
    }

    /// Fail every pending invocation of a recovered turn. Returns how many.
    #[instrument(skip(self), fields(turn_id = %turn_id))]
    pub fn interrupt_pending(&self, turn_id: &TurnId) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| interrupt(conn, turn_id))
    }

    pub fn get_turn(&self, turn_id: &TurnId) -> Result<TurnRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {TURN_COLUMNS} FROM turns WHERE id = ?1"))?;
            let mut rows = stmt.query([turn_id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_turn(row),
                None => Err(StoreError::NotFound(format!("turn {turn_id}"))),
            }
        })
    }

    pub fn streaming_turn(&self, session_id: &SessionId) -> Result<Option<TurnRow>, StoreError> {
        self.db.with_conn(|conn| query_streaming_turn(conn, session_id))
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list_turns(&self, session_id: &SessionId) -> Result<Vec<TurnRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TURN_COLUMNS} FROM turns WHERE session_id = ?1 ORDER BY turn_index"
            ))?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut turns = Vec::new();
            while let Some(row) = rows.next()? {
                turns.push(row_to_turn(row)?);
            }
            Ok(turns)
        })
    }

    /// Full ordered history: turns by turn_index, entries by ordinal.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn session_history(&self, session_id: &SessionId) -> Result<Vec<TurnRecord>, StoreError> {
        let turns = self.list_turns(session_id)?;
        self.db.with_conn(|conn| {
            turns
                .into_iter()
                .map(|turn| load_record(conn, turn))
                .collect()
        })
    }
}

const TURN_COLUMNS: &str =
    "id, session_id, turn_index, role, status, token_count, failure_reason, started_at, ended_at";

fn query_streaming_turn(conn: &Connection, session_id: &SessionId) -> Result<Option<TurnRow>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {TURN_COLUMNS} FROM turns WHERE session_id = ?1 AND status = 'streaming'
         ORDER BY turn_index DESC LIMIT 1"
    ))?;
    let mut rows = stmt.query([session_id.as_str()])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_turn(row)?)),
        None => Ok(None),
    }
}

/// Reserve the next entry ordinal of a streaming turn.
fn next_ordinal(conn: &Connection, turn_id: &TurnId) -> Result<u32, StoreError> {
    let changed = conn.execute(
        "UPDATE turns SET next_ordinal = next_ordinal + 1 WHERE id = ?1 AND status = 'streaming'",
        [turn_id.as_str()],
    )?;
    if changed == 0 {
        return Err(not_streaming(conn, turn_id));
    }
    let ordinal: u32 = conn.query_row(
        "SELECT next_ordinal - 1 FROM turns WHERE id = ?1",
        [turn_id.as_str()],
        |row| row.get(0),
    )?;
    Ok(ordinal)
}

fn not_streaming(conn: &Connection, turn_id: &TurnId) -> StoreError {
    let status: Result<Option<String>, _> = conn
        .query_row("SELECT status FROM turns WHERE id = ?1", [turn_id.as_str()], |row| {
            row.get(0)
        })
        .optional();
    match status {
        Ok(Some(status)) => StoreError::Conflict(format!("turn {turn_id} is {status}")),
        Ok(None) => StoreError::NotFound(format!("turn {turn_id}")),
        Err(e) => e.into(),
    }
}

fn end_turn(
    conn: &Connection,
    turn_id: &TurnId,
    status: TurnStatus,
    token_count: u32,
    reason: Option<&str>,
) -> Result<(), StoreError> {
    let now = Utc::now().to_rfc3339();
    let changed = conn.execute(
        "UPDATE turns SET status = ?1, token_count = ?2, failure_reason = ?3, ended_at = ?4
         WHERE id = ?5 AND status = 'streaming'",
        rusqlite::params![status.to_string(), token_count, reason, now, turn_id.as_str()],
    )?;
    if changed == 0 {
        return Err(not_streaming(conn, turn_id));
    }
    Ok(())
}

fn interrupt(conn: &Connection, turn_id: &TurnId) -> Result<usize, StoreError> {
    let now = Utc::now().to_rfc3339();
    let changed = conn.execute(
        "UPDATE tool_invocations SET status = 'failed', output = ?1, completed_at = ?2
         WHERE turn_id = ?3 AND status = 'pending'",
        rusqlite::params![INTERRUPTED_OUTPUT, now, turn_id.as_str()],
    )?;
    Ok(changed)
}

fn load_record(conn: &Connection, turn: TurnRow) -> Result<TurnRecord, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, turn_id, ordinal, content, created_at FROM messages
         WHERE turn_id = ?1 ORDER BY ordinal",
    )?;
    let mut rows = stmt.query([turn.id.as_str()])?;
    let mut messages = Vec::new();
    while let Some(row) = rows.next()? {
        messages.push(MessageRow {
            id: MessageId::from_raw(row_helpers::get::<String>(row, 0, "messages", "id")?),
            turn_id: TurnId::from_raw(row_helpers::get::<String>(row, 1, "messages", "turn_id")?),
            ordinal: row_helpers::get(row, 2, "messages", "ordinal")?,
            content: row_helpers::get(row, 3, "messages", "content")?,
            created_at: row_helpers::get(row, 4, "messages", "created_at")?,
        });
    }

    let mut stmt = conn.prepare(
        "SELECT id, turn_id, ordinal, content, created_at FROM thoughts
         WHERE turn_id = ?1 ORDER BY ordinal",
    )?;
    let mut rows = stmt.query([turn.id.as_str()])?;
    let mut thoughts = Vec::new();
    while let Some(row) = rows.next()? {
        thoughts.push(ThoughtRow {
            id: ThoughtId::from_raw(row_helpers::get::<String>(row, 0, "thoughts", "id")?),
            turn_id: TurnId::from_raw(row_helpers::get::<String>(row, 1, "thoughts", "turn_id")?),
            ordinal: row_helpers::get(row, 2, "thoughts", "ordinal")?,
            content: row_helpers::get(row, 3, "thoughts", "content")?,
            created_at: row_helpers::get(row, 4, "thoughts", "created_at")?,
        });
    }

    let mut stmt = conn.prepare(
        "SELECT id, turn_id, ordinal, call_id, name, rationale, input, output, status,
                started_at, completed_at
         FROM tool_invocations WHERE turn_id = ?1 ORDER BY ordinal",
    )?;
    let mut rows = stmt.query([turn.id.as_str()])?;
    let mut invocations = Vec::new();
    while let Some(row) = rows.next()? {
        invocations.push(row_to_invocation(row)?);
    }

    Ok(TurnRecord {
        turn,
        messages,
        thoughts,
        invocations,
    })
}

fn row_to_turn(row: &rusqlite::Row<'_>) -> Result<TurnRow, StoreError> {
    let status: String = row_helpers::get(row, 4, "turns", "status")?;
    Ok(TurnRow {
        id: TurnId::from_raw(row_helpers::get::<String>(row, 0, "turns", "id")?),
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 1, "turns", "session_id")?),
        turn_index: row_helpers::get(row, 2, "turns", "turn_index")?,
        role: row_helpers::get(row, 3, "turns", "role")?,
        status: row_helpers::parse_enum(&status, "turns", "status")?,
        token_count: row_helpers::get(row, 5, "turns", "token_count")?,
        failure_reason: row_helpers::get_opt(row, 6, "turns", "failure_reason")?,
        started_at: row_helpers::get(row, 7, "turns", "started_at")?,
        ended_at: row_helpers::get_opt(row, 8, "turns", "ended_at")?,
    })
}

fn row_to_invocation(row: &rusqlite::Row<'_>) -> Result<InvocationRow, StoreError> {
    let input: String = row_helpers::get(row, 6, "tool_invocations", "input")?;
    let status: String = row_helpers::get(row, 8, "tool_invocations", "status")?;
    Ok(InvocationRow {
        id: InvocationId::from_raw(row_helpers::get::<String>(row, 0, "tool_invocations", "id")?),
        turn_id: TurnId::from_raw(row_helpers::get::<String>(row, 1, "tool_invocations", "turn_id")?),
        ordinal: row_helpers::get(row, 2, "tool_invocations", "ordinal")?,
        call_id: ToolCallId::from_raw(row_helpers::get::<String>(row, 3, "tool_invocations", "call_id")?),
        name: row_helpers::get(row, 4, "tool_invocations", "name")?,
        rationale: row_helpers::get_opt(row, 5, "tool_invocations", "rationale")?,
        input: row_helpers::parse_json(&input, "tool_invocations", "input")?,
        output: row_helpers::get_opt(row, 7, "tool_invocations", "output")?,
        status: row_helpers::parse_enum(&status, "tool_invocations", "status")?,
        started_at: row_helpers::get(row, 9, "tool_invocations", "started_at")?,
        completed_at: row_helpers::get_opt(row, 10, "tool_invocations", "completed_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::tests::new_session;
    use serde_json::json;

    fn setup() -> (TurnLog, SessionId) {
        let log = TurnLog::new(Database::in_memory().unwrap());
        let session = log.create_session(&new_session("execution")).unwrap();
        (log, session.id)
    }

    fn invocation(name: &str) -> NewInvocation {
        NewInvocation {
            call_id: ToolCallId::new(),
            name: name.into(),
            rationale: Some("look around".into()),
            input: json!({"pattern": "**/*.rs"}),
        }
    }

    #[test]
    fn turn_indices_are_contiguous() {
        let (log, sid) = setup();
        for expected in 0..3u32 {
            let opened = log.begin_turn(&sid, "execution").unwrap();
            assert!(!opened.resumed);
            assert_eq!(opened.turn.turn_index, expected);
            if expected == 1 {
                log.fail_turn(&opened.turn.id, "no terminal action", 4).unwrap();
            } else {
                log.complete_turn(&opened.turn.id, 10).unwrap();
            }
        }
        let turns = log.list_turns(&sid).unwrap();
        let indices: Vec<u32> = turns.iter().map(|t| t.turn_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(turns[1].status, TurnStatus::Failed);
        assert_eq!(turns[1].failure_reason.as_deref(), Some("no terminal action"));
        assert_eq!(turns[1].token_count, 4);
        assert_eq!(turns[2].token_count, 10);
    }

    #[test]
    fn begin_turn_resumes_streaming_turn() {
        let (log, sid) = setup();
        let first = log.begin_turn(&sid, "execution").unwrap();
        log.append_message(&first.turn.id, "partial").unwrap();

        let again = log.begin_turn(&sid, "execution").unwrap();
        assert!(again.resumed);
        assert_eq!(again.turn.id, first.turn.id);
        assert_eq!(again.turn.turn_index, 0);
    }

    #[test]
    fn round_trip_preserves_interleaved_order() {
        let (log, sid) = setup();
        let turn = log.begin_turn(&sid, "execution").unwrap().turn;

        log.append_thought(&turn.id, "think 1").unwrap();
        log.append_message(&turn.id, "msg 1").unwrap();
        let inv = log.start_tool_invocation(&turn.id, &invocation("Glob")).unwrap();
        log.finish_tool_invocation(&inv.id, true, "src/main.rs").unwrap();
        log.append_message(&turn.id, "msg 2").unwrap();
        let inv2 = log.start_tool_invocation(&turn.id, &invocation("Read")).unwrap();
        log.finish_tool_invocation(&inv2.id, false, "file not found").unwrap();
        log.append_thought(&turn.id, "think 2").unwrap();
        log.append_message(&turn.id, "msg 3").unwrap();
        log.complete_turn(&turn.id, 99).unwrap();

        let history = log.session_history(&sid).unwrap();
        assert_eq!(history.len(), 1);
        let record = &history[0];
        assert_eq!(record.messages.len(), 3);
        assert_eq!(record.thoughts.len(), 2);
        assert_eq!(record.invocations.len(), 2);

        let kinds: Vec<String> = record
            .entries()
            .iter()
            .map(|e| match e {
                TurnEntry::Message(m) => format!("m:{}", m.content),
                TurnEntry::Thought(t) => format!("t:{}", t.content),
                TurnEntry::Invocation(i) => format!("i:{}", i.name),
            })
            .collect();
        assert_eq!(
            kinds,
            vec!["t:think 1", "m:msg 1", "i:Glob", "m:msg 2", "i:Read", "t:think 2", "m:msg 3"]
        );

        let read = &record.invocations[1];
        assert_eq!(read.status, InvocationStatus::Failed);
        assert_eq!(read.output.as_deref(), Some("file not found"));
        assert_eq!(read.input["pattern"], "**/*.rs");
        assert_eq!(read.rationale.as_deref(), Some("look around"));
    }

    #[test]
    fn second_pending_invocation_rejected() {
        let (log, sid) = setup();
        let turn = log.begin_turn(&sid, "execution").unwrap().turn;
        log.start_tool_invocation(&turn.id, &invocation("Edit")).unwrap();
        let second = log.start_tool_invocation(&turn.id, &invocation("Write"));
        assert!(matches!(second, Err(StoreError::Conflict(_))));
    }

    #[test]
    fn unique_pending_index_backs_the_api_check() {
        let (log, sid) = setup();
        let turn = log.begin_turn(&sid, "execution").unwrap().turn;
        log.start_tool_invocation(&turn.id, &invocation("Edit")).unwrap();
        let result = log.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO tool_invocations (id, turn_id, ordinal, call_id, name, input, status, started_at)
                 VALUES ('inv_raw', ?1, 50, 'c', 'Write', '{}', 'pending', 'now')",
                [turn.id.as_str()],
            )?;
            Ok(())
        });
        assert!(result.is_err());
    }

    #[test]
    fn completed_turn_is_immutable() {
        let (log, sid) = setup();
        let turn = log.begin_turn(&sid, "execution").unwrap().turn;
        log.complete_turn(&turn.id, 1).unwrap();

        assert!(matches!(
            log.append_message(&turn.id, "late"),
            Err(StoreError::Conflict(_))
        ));
        assert!(matches!(
            log.fail_turn(&turn.id, "late", 0),
            Err(StoreError::Conflict(_))
        ));

        let raw_update = log.db.with_conn(|conn| {
            conn.execute(
                "UPDATE turns SET token_count = 5 WHERE id = ?1",
                [turn.id.as_str()],
            )?;
            Ok(())
        });
        assert!(raw_update.is_err());
        assert_eq!(log.get_turn(&turn.id).unwrap().token_count, 1);
    }

    #[test]
    fn complete_turn_refuses_pending_call() {
        let (log, sid) = setup();
        let turn = log.begin_turn(&sid, "execution").unwrap().turn;
        log.start_tool_invocation(&turn.id, &invocation("Grep")).unwrap();
        assert!(matches!(
            log.complete_turn(&turn.id, 0),
            Err(StoreError::Conflict(_))
        ));
    }

    #[test]
    fn interrupt_pending_fails_dangling_calls() {
        let (log, sid) = setup();
        let turn = log.begin_turn(&sid, "execution").unwrap().turn;
        let inv = log.start_tool_invocation(&turn.id, &invocation("Write")).unwrap();

        assert_eq!(log.interrupt_pending(&turn.id).unwrap(), 1);
        assert_eq!(log.interrupt_pending(&turn.id).unwrap(), 0);

        let record = &log.session_history(&sid).unwrap()[0];
        assert_eq!(record.invocations[0].id, inv.id);
        assert_eq!(record.invocations[0].status, InvocationStatus::Failed);
        assert_eq!(record.invocations[0].output.as_deref(), Some(INTERRUPTED_OUTPUT));

        // The turn is still open for new calls after recovery.
        log.start_tool_invocation(&turn.id, &invocation("Write")).unwrap();
    }

    #[test]
    fn finish_twice_conflicts() {
        let (log, sid) = setup();
        let turn = log.begin_turn(&sid, "execution").unwrap().turn;
        let inv = log.start_tool_invocation(&turn.id, &invocation("Read")).unwrap();
        log.finish_tool_invocation(&inv.id, true, "ok").unwrap();
        assert!(matches!(
            log.finish_tool_invocation(&inv.id, true, "ok"),
            Err(StoreError::Conflict(_))
        ));
        assert!(matches!(
            log.finish_tool_invocation(&InvocationId::from_raw("inv_missing"), true, "ok"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn terminal_session_cannot_begin_turns() {
        let (log, sid) = setup();
        log.complete_session(&sid).unwrap();
        assert!(matches!(
            log.begin_turn(&sid, "execution"),
            Err(StoreError::Conflict(_))
        ));
        assert!(matches!(
            log.begin_turn(&SessionId::from_raw("sess_nope"), "execution"),
            Err(StoreError::NotFound(_))
        ));
    }
}
