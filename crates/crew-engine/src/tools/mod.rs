pub mod edit;
pub mod glob;
pub mod grep;
pub mod multi_edit;
pub mod read;
pub mod write;

use std::path::Path;
use std::sync::Arc;

use crew_core::tools::{ToolContext, ToolError};

use crate::positions::DEFAULT_MERGE_GAP;
use crate::registry::ToolRegistry;

/// How edit tools report the lines they touched.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EditFeedback {
    pub context_lines: usize,
    pub merge_gap: usize,
}

impl Default for EditFeedback {
    fn default() -> Self {
        Self {
            context_lines: 3,
            merge_gap: DEFAULT_MERGE_GAP,
        }
    }
}

/// Create a ToolRegistry with all built-in tools.
pub fn create_default_registry(feedback: EditFeedback) -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    // Read-only
    registry.register(Arc::new(read::ReadTool));
    registry.register(Arc::new(glob::GlobTool));
    registry.register(Arc::new(grep::GrepTool));

    // Mutating
    registry.register(Arc::new(write::WriteTool));
    registry.register(Arc::new(edit::EditTool::new(feedback)));
    registry.register(Arc::new(multi_edit::MultiEditTool::new(feedback)));

    registry
}

pub(crate) fn required_str<'a>(args: &'a serde_json::Value, key: &str) -> Result<&'a str, ToolError> {
    args[key]
        .as_str()
        .ok_or_else(|| ToolError::InvalidArguments(format!("{key} is required")))
}

pub(crate) fn check_abort(ctx: &ToolContext) -> Result<(), ToolError> {
    if ctx.abort_signal.is_cancelled() {
        Err(ToolError::Cancelled)
    } else {
        Ok(())
    }
}

/// Replace `path` with `content` in one step: write a sibling temp file, then
/// rename it over the target.
pub(crate) async fn atomic_write(path: &Path, content: &str) -> Result<(), ToolError> {
    let parent = path
        .parent()
        .ok_or_else(|| ToolError::ExecutionFailed(format!("{} has no parent", path.display())))?;
    tokio::fs::create_dir_all(parent)
        .await
        .map_err(|e| ToolError::ExecutionFailed(format!("Failed to create directory: {e}")))?;

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{name}.{}.tmp", uuid::Uuid::now_v7()));

    if let Err(e) = tokio::fs::write(&tmp, content).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(ToolError::ExecutionFailed(format!(
            "Failed to write {}: {e}",
            path.display()
        )));
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(ToolError::ExecutionFailed(format!(
            "Failed to replace {}: {e}",
            path.display()
        )));
    }
    Ok(())
}
