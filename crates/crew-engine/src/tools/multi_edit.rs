use async_trait::async_trait;
use std::time::Instant;

use crew_core::tools::{Tool, ToolContext, ToolError, ToolKind, ToolResult};

use super::edit::rejection_error;
use super::{atomic_write, check_abort, required_str, EditFeedback};
use crate::positions::{apply_edits, EditSpec};
use crate::sandbox::Sandbox;

/// A batch of exact-match replacements in one file, applied all or nothing.
pub struct MultiEditTool {
    feedback: EditFeedback,
}

impl MultiEditTool {
    pub fn new(feedback: EditFeedback) -> Self {
        Self { feedback }
    }
}

#[async_trait]
impl Tool for MultiEditTool {
    fn name(&self) -> &str {
        "MultiEdit"
    }

    fn description(&self) -> &str {
        "Apply several exact string replacements to one file; either all apply or none do"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": ["file_path", "edits"],
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Path to the file to edit"
                },
                "edits": {
                    "type": "array",
                    "description": "Edits applied in order; each sees the result of the previous ones",
                    "items": {
                        "type": "object",
                        "required": ["old_string", "new_string"],
                        "properties": {
                            "old_string": {"type": "string"},
                            "new_string": {"type": "string"},
                            "replace_all": {"type": "boolean"}
                        }
                    }
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
        let edits: Vec<EditSpec> = serde_json::from_value(args["edits"].clone())
            .map_err(|e| ToolError::InvalidArguments(format!("edits: {e}")))?;
        if edits.is_empty() {
            return Err(ToolError::InvalidArguments("edits is empty".into()));
        }

        let sandbox = Sandbox::for_context(ctx);
        let path = sandbox.resolve_readable(file_path)?;
        let shown = sandbox.display(&path);

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("Failed to read {shown}: {e}")))?;

        let applied = apply_edits(&content, &edits).map_err(|failure| ToolError::BatchRejected {
            index: failure.index + 1,
            total: edits.len(),
            reason: rejection_error(failure.rejection, &shown).to_string(),
        })?;

        check_abort(ctx)?;
        atomic_write(&path, &applied.content).await?;

        Ok(ToolResult {
            content: format!(
                "Applied {} edit(s), {} replacement(s) in {shown}\n\n{}",
                edits.len(),
                applied.replacement_count(),
                applied.render_context(self.feedback.context_lines, self.feedback.merge_gap)
            ),
            duration: start.elapsed(),
        })
    }
}
