use chrono::Utc;
use rusqlite::{Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crew_core::ids::GroupId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FanInGroupRow {
    pub id: GroupId,
    pub expected_count: u32,
    pub triggered_at: Option<String>,
    pub last_trigger_error: Option<String>,
    pub created_at: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompletionRow {
    pub group_id: GroupId,
    pub member_id: String,
    pub payload: serde_json::Value,
    pub completed_at: String,
}

/// What one member learns when it reports in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionOutcome {
    pub all_complete: bool,
    /// True for exactly one caller per group: the one whose write moved the
    /// group to all-complete.
    pub is_triggering_caller: bool,
    /// The member had already reported; this call wrote nothing.
    pub duplicate: bool,
}

/// Fan-in groups and the completions of their members.
pub struct FanInRepo {
    db: Database,
}

impl FanInRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self))]
    pub fn create_group(&self, expected_count: u32) -> Result<FanInGroupRow, StoreError> {
        if expected_count == 0 {
            return Err(StoreError::Conflict(
                "fan-in group needs at least one member".into(),
            ));
        }
        let id = GroupId::new();
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO fan_in_groups (id, expected_count, created_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![id.as_str(), expected_count, now],
            )?;
            Ok(())
        })?;
        Ok(FanInGroupRow {
            id,
            expected_count,
            triggered_at: None,
            last_trigger_error: None,
            created_at: now,
        })
    }

    pub fn get_group(&self, id: &GroupId) -> Result<FanInGroupRow, StoreError> {
        self.db.with_conn(|conn| query_group(conn, id))
    }

    pub fn list_groups(&self) -> Result<Vec<FanInGroupRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {GROUP_COLUMNS} FROM fan_in_groups ORDER BY created_at DESC"
            ))?;
            let mut rows = stmt.query([])?;
            let mut groups = Vec::new();
            while let Some(row) = rows.next()? {
                groups.push(row_to_group(row)?);
            }
            Ok(groups)
        })
    }

    /// Record a member completion and decide, in the same IMMEDIATE
    /// transaction, whether this call is the one that completes the group.
    #[instrument(skip(self, payload), fields(group_id = %group_id, member_id = %member_id))]
    pub fn record_completion(
        &self,
        group_id: &GroupId,
        member_id: &str,
        payload: &serde_json::Value,
    ) -> Result<CompletionOutcome, StoreError> {
        let payload = serde_json::to_string(payload)?;
        self.db.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let group = query_group(&tx, group_id)?;
            let now = Utc::now().to_rfc3339();

            let inserted = tx.execute(
                "INSERT INTO persona_completions (group_id, member_id, payload, completed_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (group_id, member_id) DO NOTHING",
                rusqlite::params![group_id.as_str(), member_id, payload, now],
            )?;

            // Only one caller can move triggered_at off NULL.
            let claimed = tx.execute(
                "UPDATE fan_in_groups SET triggered_at = ?1
                 WHERE id = ?2 AND triggered_at IS NULL
                   AND (SELECT COUNT(*) FROM persona_completions WHERE group_id = ?2) >= expected_count",
                rusqlite::params![now, group_id.as_str()],
            )?;

            let done = completion_count(&tx, group_id)? >= group.expected_count;
            tx.commit()?;

            let outcome = CompletionOutcome {
                all_complete: done,
                is_triggering_caller: claimed == 1,
                duplicate: inserted == 0,
            };
            debug!(?outcome, "completion recorded");
            Ok(outcome)
        })
    }

    /// Re-derive "all complete" from the stored completions.
    pub fn all_complete(&self, group_id: &GroupId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let group = query_group(conn, group_id)?;
            Ok(completion_count(conn, group_id)? >= group.expected_count)
        })
    }

    pub fn completions(&self, group_id: &GroupId) -> Result<Vec<CompletionRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT group_id, member_id, payload, completed_at FROM persona_completions
                 WHERE group_id = ?1 ORDER BY completed_at, rowid",
            )?;
            let mut rows = stmt.query([group_id.as_str()])?;
            let mut completions = Vec::new();
            while let Some(row) = rows.next()? {
                let payload: String = row_helpers::get(row, 2, "persona_completions", "payload")?;
                completions.push(CompletionRow {
                    group_id: GroupId::from_raw(row_helpers::get::<String>(
                        row,
                        0,
                        "persona_completions",
                        "group_id",
                    )?),
                    member_id: row_helpers::get(row, 1, "persona_completions", "member_id")?,
                    payload: row_helpers::parse_json(&payload, "persona_completions", "payload")?,
                    completed_at: row_helpers::get(row, 3, "persona_completions", "completed_at")?,
                });
            }
            Ok(completions)
        })
    }

    /// Keep the last downstream failure for operators. Completions and
    /// `triggered_at` are left alone.
    #[instrument(skip(self, error), fields(group_id = %group_id))]
    pub fn record_trigger_error(&self, group_id: &GroupId, error: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE fan_in_groups SET last_trigger_error = ?1 WHERE id = ?2",
                rusqlite::params![error, group_id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("fan-in group {group_id}")));
            }
            Ok(())
        })
    }
}

const GROUP_COLUMNS: &str = "id, expected_count, triggered_at, last_trigger_error, created_at";

fn query_group(conn: &Connection, id: &GroupId) -> Result<FanInGroupRow, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {GROUP_COLUMNS} FROM fan_in_groups WHERE id = ?1"
    ))?;
    let mut rows = stmt.query([id.as_str()])?;
    match rows.next()? {
        Some(row) => row_to_group(row),
        None => Err(StoreError::NotFound(format!("fan-in group {id}"))),
    }
}

fn completion_count(conn: &Connection, group_id: &GroupId) -> Result<u32, StoreError> {
    let count: u32 = conn.query_row(
        "SELECT COUNT(*) FROM persona_completions WHERE group_id = ?1",
        [group_id.as_str()],
        |row| row.get(0),
    )?;
    Ok(count)
}

fn row_to_group(row: &rusqlite::Row<'_>) -> Result<FanInGroupRow, StoreError> {
    Ok(FanInGroupRow {
        id: GroupId::from_raw(row_helpers::get::<String>(row, 0, "fan_in_groups", "id")?),
        expected_count: row_helpers::get(row, 1, "fan_in_groups", "expected_count")?,
        triggered_at: row_helpers::get_opt(row, 2, "fan_in_groups", "triggered_at")?,
        last_trigger_error: row_helpers::get_opt(row, 3, "fan_in_groups", "last_trigger_error")?,
        created_at: row_helpers::get(row, 4, "fan_in_groups", "created_at")?,
    })
}
