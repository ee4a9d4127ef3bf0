use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::ids::SessionId;

/// Whether a tool changes the workspace.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    /// Logged, no further side effects (Read, Glob, Grep).
    ReadOnly,
    /// Writes to the sandbox (Write, Edit, MultiEdit).
    Mutating,
}

/// Context available to tools during execution.
pub struct ToolContext {
    pub session_id: SessionId,
    pub sandbox_root: PathBuf,
    /// Isolated workspace copy; when set, paths resolve against it instead.
    pub alternate_root: Option<PathBuf>,
    /// Project ignore globs, relative to the root. Search tools skip matches.
    pub ignore_patterns: Vec<String>,
    pub abort_signal: CancellationToken,
}

impl ToolContext {
    /// The directory all paths resolve against.
    pub fn root(&self) -> &Path {
        self.alternate_root.as_deref().unwrap_or(&self.sandbox_root)
    }
}

/// Successful tool output. Always human-readable text.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolResult {
    pub content: String,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

/// What the dispatcher hands back to the turn loop.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,
    pub output: String,
}

impl ToolOutcome {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
        }
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
        }
    }
}

/// Tool definition advertised to the model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
}

/// Trait implemented by each tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> serde_json::Value;

    fn kind(&self) -> ToolKind {
        ToolKind::ReadOnly
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError>;

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters_schema: self.parameters_schema(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("old_string not found in {path}")]
    NoMatch { path: String },
    #[error("old_string is not unique in {path}: found {count} occurrences (set replace_all to replace every occurrence)")]
    AmbiguousMatch { path: String, count: usize },
    #[error("edit {index} of {total} failed, no edits were applied: {reason}")]
    BatchRejected {
        index: usize,
        total: usize,
        reason: String,
    },
    #[error("path escapes the sandbox: {0}")]
    SandboxEscape(String),
    #[error("refusing to read credential file: {0}")]
    SensitivePath(String),
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

/// Serde helper for Duration as milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_kind_serde() {
        let json = serde_json::to_string(&ToolKind::ReadOnly).unwrap();
        assert_eq!(json, r#""read_only""#);
        let json = serde_json::to_string(&ToolKind::Mutating).unwrap();
        assert_eq!(json, r#""mutating""#);
    }

    #[test]
    fn tool_result_duration_serializes_as_ms() {
        let result = ToolResult {
            content: "ok".into(),
            duration: Duration::from_millis(1234),
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["duration"], 1234);

        let parsed: ToolResult = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.duration, Duration::from_millis(1234));
    }

    #[test]
    fn context_prefers_alternate_root() {
        let mut ctx = ToolContext {
            session_id: SessionId::new(),
            sandbox_root: PathBuf::from("/work/main"),
            alternate_root: None,
            ignore_patterns: Vec::new(),
            abort_signal: CancellationToken::new(),
        };
        assert_eq!(ctx.root(), Path::new("/work/main"));
        ctx.alternate_root = Some(PathBuf::from("/work/copy"));
        assert_eq!(ctx.root(), Path::new("/work/copy"));
    }

    #[test]
    fn tool_error_display() {
        let err = ToolError::AmbiguousMatch {
            path: "src/lib.rs".into(),
            count: 3,
        };
        assert!(err.to_string().contains("found 3 occurrences"));

        let err = ToolError::BatchRejected {
            index: 2,
            total: 3,
            reason: "old_string not found".into(),
        };
        assert_eq!(
            err.to_string(),
            "edit 2 of 3 failed, no edits were applied: old_string not found"
        );
    }
}
