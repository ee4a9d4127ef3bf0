use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;

use crew_core::tools::{Tool, ToolContext, ToolError, ToolResult};

use super::required_str;
use crate::sandbox::Sandbox;

pub struct GrepTool;

#[async_trait]
impl Tool for GrepTool {
    fn name(&self) -> &str {
        "Grep"
    }

    fn description(&self) -> &str {
        "Search file contents in the sandbox using regex patterns"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": ["pattern"],
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Regex pattern to search for"
                },
                "path": {
                    "type": "string",
                    "description": "File or directory to search in (defaults to the sandbox root)"
                },
                "glob": {
                    "type": "string",
                    "description": "Glob pattern to filter file names (e.g. '*.rs')"
                },
                "output_mode": {
                    "type": "string",
                    "enum": ["content", "files_with_matches", "count"],
                    "description": "Output mode (default: files_with_matches)"
                },
                "head_limit": {
                    "type": "integer",
                    "description": "Limit output to first N results"
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
        let sandbox = Sandbox::for_context(ctx);
        let search_path = sandbox.resolve(args["path"].as_str().unwrap_or("."))?;

        let glob_filter = args["glob"]
            .as_str()
            .map(|g| {
                glob::Pattern::new(g)
                    .map_err(|e| ToolError::InvalidArguments(format!("Invalid glob filter: {e}")))
            })
            .transpose()?;
        let output_mode = args["output_mode"].as_str().unwrap_or("files_with_matches");
        let head_limit = args["head_limit"].as_u64().unwrap_or(0) as usize;

        let regex = regex::Regex::new(pattern)
            .map_err(|e| ToolError::InvalidArguments(format!("Invalid regex: {e}")))?;

        let walk_sandbox = sandbox.clone();
        let results = tokio::task::spawn_blocking(move || {
            let mut results = Vec::new();
            if search_path.is_file() {
                if !walk_sandbox.is_skipped(&search_path) {
                    search_single_file(&search_path, &walk_sandbox, &regex, &mut results);
                }
            } else if search_path.is_dir() {
                walk_and_search(&search_path, &walk_sandbox, &regex, glob_filter.as_ref(), &mut results);
            }
            results
        })
        .await
        .map_err(|e| ToolError::ExecutionFailed(format!("Search task failed: {e}")))?;

        Ok(ToolResult {
            content: format_results(&results, output_mode, head_limit),
            duration: start.elapsed(),
        })
    }
}

#[derive(Debug)]
struct SearchMatch {
    file: String,
    line_number: usize,
    line_content: String,
}

fn search_single_file(
    path: &Path,
    sandbox: &Sandbox,
    regex: &regex::Regex,
    results: &mut Vec<SearchMatch>,
) {
    // Binary and unreadable files are skipped.
    let Ok(content) = std::fs::read_to_string(path) else {
        return;
    };

    let file = sandbox.display(path);
    for (i, line) in content.lines().enumerate() {
        if regex.is_match(line) {
            results.push(SearchMatch {
                file: file.clone(),
                line_number: i + 1,
                line_content: line.to_string(),
            });
        }
    }
}

fn walk_and_search(
    dir: &Path,
    sandbox: &Sandbox,
    regex: &regex::Regex,
    glob_filter: Option<&glob::Pattern>,
    results: &mut Vec<SearchMatch>,
) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };

    let mut paths: Vec<_> = entries
        .flatten()
        .map(|e| {
            let is_link = e.file_type().map(|t| t.is_symlink()).unwrap_or(false);
            (e.path(), is_link)
        })
        .collect();
    paths.sort();

    for (path, is_link) in paths {
        if sandbox.is_skipped(&path) || (is_link && !sandbox.is_contained(&path)) {
            continue;
        }
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");

        if path.is_dir() {
            if name.starts_with('.') {
                continue;
            }
            walk_and_search(&path, sandbox, regex, glob_filter, results);
        } else if path.is_file() {
            if let Some(filter) = glob_filter {
                if !filter.matches(name) {
                    continue;
                }
            }
            search_single_file(&path, sandbox, regex, results);
        }
    }
}

fn format_results(results: &[SearchMatch], mode: &str, limit: usize) -> String {
    if results.is_empty() {
        return "No matches found.".to_string();
    }

    match mode {
        "content" => {
            let items: Vec<String> = results
                .iter()
                .take(if limit > 0 { limit } else { results.len() })
                .map(|m| format!("{}:{}:{}", m.file, m.line_number, m.line_content))
                .collect();
            items.join("\n")
        }
        "count" => {
            let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
            for m in results {
                *counts.entry(&m.file).or_default() += 1;
            }
            let mut items: Vec<String> = counts.iter().map(|(f, c)| format!("{f}:{c}")).collect();
            if limit > 0 {
                items.truncate(limit);
            }
            items.join("\n")
        }
        _ => {
            let mut files: Vec<&str> = results.iter().map(|m| m.file.as_str()).collect();
            files.sort();
            files.dedup();
            if limit > 0 {
                files.truncate(limit);
            }
            files.join("\n")
        }
    }
}
