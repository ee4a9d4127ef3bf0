use async_trait::async_trait;
use std::time::Instant;

use crew_core::tools::{Tool, ToolContext, ToolError, ToolResult};

use super::required_str;
use crate::sandbox::Sandbox;

const DEFAULT_LIMIT: u64 = 2000;
const MAX_LINE_LEN: usize = 2000;

pub struct ReadTool;

#[async_trait]
impl Tool for ReadTool {
    fn name(&self) -> &str {
        "Read"
    }

    fn description(&self) -> &str {
        "Read file contents from the sandbox"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": ["file_path"],
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Path to the file, relative to the sandbox root or absolute inside it"
                },
                "offset": {
                    "type": "integer",
                    "description": "Line number to start reading from (1-based)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of lines to read"
                },
                "rationale": {
                    "type": "string",
                    "description": "Why this read is needed"
                }
            }
        })
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let start = Instant::now();

        let file_path = required_str(&args, "file_path")?;
        let sandbox = Sandbox::for_context(ctx);
        let path = sandbox.resolve_readable(file_path)?;

        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            ToolError::ExecutionFailed(format!("Failed to read {}: {e}", sandbox.display(&path)))
        })?;

        let offset = args["offset"].as_u64().unwrap_or(1).max(1) as usize;
        let limit = args["limit"].as_u64().unwrap_or(DEFAULT_LIMIT) as usize;

        let lines: Vec<&str> = content.lines().collect();
        let start_idx = (offset - 1).min(lines.len());
        let end_idx = (start_idx + limit).min(lines.len());

        let mut output = String::new();
        for (i, line) in lines[start_idx..end_idx].iter().enumerate() {
            let shown = match line.char_indices().nth(MAX_LINE_LEN) {
                Some((cut, _)) => &line[..cut],
                None => line,
            };
            output.push_str(&format!("{:>6}\t{}\n", start_idx + i + 1, shown));
        }

        if output.is_empty() {
            output = "(empty file)".to_string();
        }

        Ok(ToolResult {
            content: output,
            duration: start.elapsed(),
        })
    }
}
