use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::error::EngineError;

/// Per-project ignore file, one glob per line.
pub const IGNORE_FILE: &str = ".crewignore";

/// A parsed project: its canonical root and the globs search tools skip.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProjectHandle {
    root: PathBuf,
    ignore_patterns: Vec<String>,
}

impl ProjectHandle {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ignore_patterns(&self) -> &[String] {
        &self.ignore_patterns
    }
}

/// Loaded projects keyed by canonical root. Owned by whoever composes the
/// orchestrator; nothing here is global.
#[derive(Default)]
pub struct ProjectRegistry {
    projects: RwLock<HashMap<PathBuf, Arc<ProjectHandle>>>,
    shut_down: AtomicBool,
}

impl ProjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached handle for `root`, parsing the project on first use.
    pub fn get_or_load(&self, root: &Path) -> Result<Arc<ProjectHandle>, EngineError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(EngineError::RegistryShutDown);
        }

        let canonical = std::fs::canonicalize(root).map_err(|e| EngineError::InvalidProject {
            path: root.display().to_string(),
            reason: e.to_string(),
        })?;
        if !canonical.is_dir() {
            return Err(EngineError::InvalidProject {
                path: root.display().to_string(),
                reason: "not a directory".into(),
            });
        }

        if let Some(handle) = self.projects.read().get(&canonical) {
            return Ok(Arc::clone(handle));
        }

        let handle = Arc::new(load_project(canonical.clone())?);
        let mut projects = self.projects.write();
        if self.shut_down.load(Ordering::Acquire) {
            return Err(EngineError::RegistryShutDown);
        }
        let entry = projects.entry(canonical).or_insert(handle);
        Ok(Arc::clone(entry))
    }

    /// Drop every cached project and refuse further lookups.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        let mut projects = self.projects.write();
        info!(projects = projects.len(), "project registry shut down");
        projects.clear();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.projects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.projects.read().is_empty()
    }
}

fn load_project(root: PathBuf) -> Result<ProjectHandle, EngineError> {
    let ignore_path = root.join(IGNORE_FILE);
    let ignore_patterns = match std::fs::read_to_string(&ignore_path) {
        Ok(text) => parse_ignore(&text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => {
            return Err(EngineError::InvalidProject {
                path: ignore_path.display().to_string(),
                reason: e.to_string(),
            })
        }
    };
    debug!(root = %root.display(), patterns = ignore_patterns.len(), "project loaded");
    Ok(ProjectHandle {
        root,
        ignore_patterns,
    })
}

/// Blank lines and `#` comments are skipped; a trailing `/` is dropped so
/// directory entries match the directory itself.
fn parse_ignore(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| line.trim_end_matches('/').to_string())
        .filter(|line| !line.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_project() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("crew_project_{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn parse_ignore_skips_comments() {
        let patterns = parse_ignore("# generated\nfixtures/\n\n  *.snap  \n/\n");
        assert_eq!(patterns, vec!["fixtures", "*.snap"]);
    }

    #[test]
    fn loads_once_and_caches() {
        let dir = temp_project();
        std::fs::write(dir.join(IGNORE_FILE), "generated/\n").unwrap();
        let registry = ProjectRegistry::new();

        let first = registry.get_or_load(&dir).unwrap();
        assert_eq!(first.ignore_patterns(), ["generated".to_string()]);
        assert_eq!(first.root(), std::fs::canonicalize(&dir).unwrap());

        let second = registry.get_or_load(&dir.join(".")).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_root_is_invalid() {
        let registry = ProjectRegistry::new();
        let missing = std::env::temp_dir().join(format!("crew_missing_{}", uuid::Uuid::now_v7()));
        assert!(matches!(
            registry.get_or_load(&missing),
            Err(EngineError::InvalidProject { .. })
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn file_root_is_invalid() {
        let dir = temp_project();
        let file = dir.join("Cargo.toml");
        std::fs::write(&file, "").unwrap();
        let registry = ProjectRegistry::new();
        assert!(matches!(
            registry.get_or_load(&file),
            Err(EngineError::InvalidProject { .. })
        ));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn shutdown_clears_and_rejects() {
        let dir = temp_project();
        let registry = ProjectRegistry::new();
        registry.get_or_load(&dir).unwrap();
        registry.shutdown();

        assert!(registry.is_shut_down());
        assert!(registry.is_empty());
        assert!(matches!(
            registry.get_or_load(&dir),
            Err(EngineError::RegistryShutDown)
        ));
        std::fs::remove_dir_all(&dir).ok();
    }
}
