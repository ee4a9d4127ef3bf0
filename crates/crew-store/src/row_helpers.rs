//! Column readers that report which table and column held a bad value.

use rusqlite::types::FromSql;
use rusqlite::Row;
use serde::de::DeserializeOwned;

use crate::error::StoreError;

fn corrupt(table: &'static str, column: &'static str, detail: impl Into<String>) -> StoreError {
    StoreError::CorruptRow {
        table,
        column,
        detail: detail.into(),
    }
}

pub fn get<T: FromSql>(
    row: &Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    row.get(idx).map_err(|e| corrupt(table, column, e.to_string()))
}

/// Nullable column.
pub fn get_opt<T: FromSql>(
    row: &Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<Option<T>, StoreError> {
    get(row, idx, table, column)
}

/// Decode a JSON text column into any deserializable type.
pub fn parse_json<T: DeserializeOwned>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| corrupt(table, column, format!("invalid JSON: {e}")))
}

/// Status and kind columns hold the `Display` form of their enum.
pub fn parse_enum<T: std::str::FromStr>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    raw.parse()
        .map_err(|_| corrupt(table, column, format!("unknown variant: {raw}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::SessionStatus;

    #[test]
    fn enum_column_round_trips_display() {
        let status: SessionStatus = parse_enum("active", "sessions", "status").unwrap();
        assert_eq!(status, SessionStatus::Active);
    }

    #[test]
    fn unknown_enum_names_the_column() {
        let result: Result<SessionStatus, _> = parse_enum("archived", "sessions", "status");
        assert!(matches!(
            result,
            Err(StoreError::CorruptRow { table: "sessions", column: "status", .. })
        ));
    }

    #[test]
    fn json_column_decodes_typed() {
        let options: Vec<String> = parse_json(r#"["keep", "drop"]"#, "questions", "options").unwrap();
        assert_eq!(options, vec!["keep", "drop"]);

        let input: serde_json::Value =
            parse_json(r#"{"file_path": "a.rs"}"#, "tool_invocations", "input").unwrap();
        assert_eq!(input["file_path"], "a.rs");
    }

    #[test]
    fn bad_json_names_the_column() {
        let result: Result<serde_json::Value, _> =
            parse_json("not valid json", "persona_completions", "payload");
        assert!(matches!(
            result,
            Err(StoreError::CorruptRow { table: "persona_completions", column: "payload", .. })
        ));
    }

    #[test]
    fn null_reads_as_none() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let value: Option<String> = conn
            .query_row("SELECT NULL", [], |row| Ok(get_opt(row, 0, "turns", "failure_reason")))
            .unwrap()
            .unwrap();
        assert!(value.is_none());
    }
}
