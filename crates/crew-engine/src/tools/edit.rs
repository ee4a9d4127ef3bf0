use async_trait::async_trait;
use std::time::Instant;

use crew_core::tools::{Tool, ToolContext, ToolError, ToolKind, ToolResult};

use super::{atomic_write, check_abort, required_str, EditFeedback};
use crate::positions::{apply_edits, EditRejection, EditSpec};
use crate::sandbox::Sandbox;

/// Exact-match replacement in one file.
pub struct EditTool {
    feedback: EditFeedback,
}

impl EditTool {
    pub fn new(feedback: EditFeedback) -> Self {
        Self { feedback }
    }
}

#[async_trait]
impl Tool for EditTool {
    fn name(&self) -> &str {
        "Edit"
    }

    fn description(&self) -> &str {
        "Perform exact string replacement in a file"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": ["file_path", "old_string", "new_string"],
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Path to the file to edit"
                },
                "old_string": {
                    "type": "string",
                    "description": "The exact string to find and replace"
                },
                "new_string": {
                    "type": "string",
                    "description": "The replacement string"
                },
                "replace_all": {
                    "type": "boolean",
                    "description": "Replace all occurrences (default: false)"
                },
                "rationale": {
                    "type": "string",
                    "description": "Why this change is needed"
                }
            }
        })
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Mutating
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let start = Instant::now();

        let file_path = required_str(&args, "file_path")?;
        let spec = EditSpec {
            old_string: required_str(&args, "old_string")?.to_string(),
            new_string: required_str(&args, "new_string")?.to_string(),
            replace_all: args["replace_all"].as_bool().unwrap_or(false),
        };

        let sandbox = Sandbox::for_context(ctx);
        let path = sandbox.resolve_readable(file_path)?;
        let shown = sandbox.display(&path);

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("Failed to read {shown}: {e}")))?;

        let applied = apply_edits(&content, std::slice::from_ref(&spec))
            .map_err(|failure| rejection_error(failure.rejection, &shown))?;

        check_abort(ctx)?;
        atomic_write(&path, &applied.content).await?;

        Ok(ToolResult {
            content: format!(
                "Replaced {} occurrence(s) in {shown}\n\n{}",
                applied.replacement_count(),
                applied.render_context(self.feedback.context_lines, self.feedback.merge_gap)
            ),
            duration: start.elapsed(),
        })
    }
}

/// Map an in-memory rejection onto the tool error the agent sees.
pub(crate) fn rejection_error(rejection: EditRejection, path: &str) -> ToolError {
    match rejection {
        EditRejection::NotFound => ToolError::NoMatch {
            path: path.to_string(),
        },
        EditRejection::Ambiguous(count) => ToolError::AmbiguousMatch {
            path: path.to_string(),
            count,
        },
        EditRejection::EmptyTarget | EditRejection::Unchanged => {
            ToolError::InvalidArguments(rejection.to_string())
        }
    }
}
