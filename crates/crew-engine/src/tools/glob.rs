use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crew_core::tools::{Tool, ToolContext, ToolError, ToolResult};

use super::required_str;
use crate::sandbox::{normalize, Sandbox};

pub struct GlobTool;

#[async_trait]
impl Tool for GlobTool {
    fn name(&self) -> &str {
        "Glob"
    }

    fn description(&self) -> &str {
        "Find files in the sandbox matching a glob pattern"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": ["pattern"],
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Glob pattern relative to the search directory (e.g. '**/*.rs', 'src/**/*.ts')"
                },
                "path": {
                    "type": "string",
                    "description": "Directory to search in (defaults to the sandbox root)"
                },
                "rationale": {
                    "type": "string",
                    "description": "What you are looking for"
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

        let pattern = required_str(&args, "pattern")?;
        if Path::new(pattern).is_absolute() || pattern.split('/').any(|part| part == "..") {
            return Err(ToolError::InvalidArguments(
                "pattern must be relative and stay inside the search directory".into(),
            ));
        }

        let sandbox = Sandbox::for_context(ctx);
        let base_dir = sandbox.resolve(args["path"].as_str().unwrap_or("."))?;
        let pattern_str = base_dir.join(pattern).to_string_lossy().to_string();

        let walk_sandbox = sandbox.clone();
        let matches = tokio::task::spawn_blocking(move || glob_match(&pattern_str, &walk_sandbox))
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("Glob task failed: {e}")))??;

        if matches.is_empty() {
            return Ok(ToolResult {
                content: "No files matched the pattern.".into(),
                duration: start.elapsed(),
            });
        }

        let output = matches
            .iter()
            .map(|p| sandbox.display(p))
            .collect::<Vec<_>>()
            .join("\n");

        Ok(ToolResult {
            content: format!("{} file(s) matched:\n{}", matches.len(), output),
            duration: start.elapsed(),
        })
    }
}

/// Expand the pattern, keeping only files inside the sandbox that search may see.
fn glob_match(pattern: &str, sandbox: &Sandbox) -> Result<Vec<PathBuf>, ToolError> {
    let entries = glob::glob(pattern)
        .map_err(|e| ToolError::InvalidArguments(format!("Invalid glob pattern: {e}")))?;

    let mut results: Vec<PathBuf> = entries
        .flatten()
        .map(|p| normalize(&p))
        .filter(|p| {
            p.starts_with(sandbox.root())
                && p.is_file()
                && !sandbox.is_skipped(p)
                && sandbox.is_contained(p)
        })
        .collect();
    results.sort();
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_support::{temp_project, test_ctx};
    use std::fs;

    #[tokio::test]
    async fn glob_finds_files() {
        let dir = temp_project("glob");
        fs::create_dir_all(dir.join("src")).unwrap();
        fs::write(dir.join("src/main.rs"), "fn main() {}").unwrap();
        fs::write(dir.join("src/lib.rs"), "pub mod foo;").unwrap();
        fs::write(dir.join("README.md"), "# README").unwrap();

        let result = GlobTool
            .execute(serde_json::json!({"pattern": "src/*.rs"}), &test_ctx(&dir))
            .await
            .unwrap();

        assert!(result.content.contains("2 file(s) matched"));
        assert!(result.content.contains("src/main.rs"));
        assert!(result.content.contains("src/lib.rs"));

        fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn glob_recursive_skips_build_dirs_and_credentials() {
        let dir = temp_project("glob");
        fs::create_dir_all(dir.join("a/b")).unwrap();
        fs::create_dir_all(dir.join("target")).unwrap();
        fs::write(dir.join("a/one.txt"), "1").unwrap();
        fs::write(dir.join("a/b/two.txt"), "2").unwrap();
        fs::write(dir.join("target/three.txt"), "3").unwrap();
        fs::write(dir.join("a/secrets.txt"), "4").unwrap();

        let result = GlobTool
            .execute(serde_json::json!({"pattern": "**/*.txt"}), &test_ctx(&dir))
            .await
            .unwrap();

        assert!(result.content.contains("2 file(s) matched"));
        assert!(!result.content.contains("three.txt"));
        assert!(!result.content.contains("secrets.txt"));

        fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn glob_honors_project_ignores() {
        let dir = temp_project("glob");
        fs::create_dir_all(dir.join("generated")).unwrap();
        fs::write(dir.join("generated/api.rs"), "").unwrap();
        fs::write(dir.join("main.rs"), "").unwrap();

        let mut ctx = test_ctx(&dir);
        ctx.ignore_patterns = vec!["generated".into()];
        let result = GlobTool
            .execute(serde_json::json!({"pattern": "**/*.rs"}), &ctx)
            .await
            .unwrap();

        assert!(result.content.contains("1 file(s) matched"));
        assert!(result.content.contains("main.rs"));

        fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn glob_rejects_escaping_patterns() {
        let dir = temp_project("glob");
        for pattern in ["../*", "/etc/*"] {
            let result = GlobTool
                .execute(serde_json::json!({"pattern": pattern}), &test_ctx(&dir))
                .await;
            assert!(matches!(result, Err(ToolError::InvalidArguments(_))));
        }
        let result = GlobTool
            .execute(serde_json::json!({"pattern": "*", "path": "../"}), &test_ctx(&dir))
            .await;
        assert!(matches!(result, Err(ToolError::SandboxEscape(_))));
        fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn glob_no_matches() {
        let dir = temp_project("glob");
        let result = GlobTool
            .execute(serde_json::json!({"pattern": "*.xyz"}), &test_ctx(&dir))
            .await
            .unwrap();
        assert!(result.content.contains("No files matched"));
        fs::remove_dir_all(&dir).ok();
    }
}
