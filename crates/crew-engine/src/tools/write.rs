use async_trait::async_trait;
use std::time::Instant;

use crew_core::tools::{Tool, ToolContext, ToolError, ToolKind, ToolResult};

use super::{atomic_write, check_abort, required_str};
use crate::sandbox::Sandbox;

pub struct WriteTool;

#[async_trait]
impl Tool for WriteTool {
    fn name(&self) -> &str {
        "Write"
    }

    fn description(&self) -> &str {
        "Write content to a file in the sandbox, replacing it if it exists"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": ["file_path", "content"],
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Path to the file, relative to the sandbox root or absolute inside it"
                },
                "content": {
                    "type": "string",
                    "description": "Content to write to the file"
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
        let content = required_str(&args, "content")?;

        let sandbox = Sandbox::for_context(ctx);
        let path = sandbox.resolve(file_path)?;
        check_abort(ctx)?;

        atomic_write(&path, content).await?;

        Ok(ToolResult {
            content: format!(
                "Wrote {} bytes ({} lines) to {}",
                content.len(),
                content.lines().count(),
                sandbox.display(&path)
            ),
            duration: start.elapsed(),
        })
    }
}
