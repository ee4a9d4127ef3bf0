use std::path::{Component, Path, PathBuf};

use crew_core::tools::{ToolContext, ToolError};

/// Filename shapes that look like credentials. Read tools refuse them and
/// search tools skip them.
const SENSITIVE_PATTERNS: &[&str] = &[
    ".env",
    ".env.*",
    "*.pem",
    "*.key",
    "id_rsa*",
    "id_ed25519*",
    "credentials*",
    "*.p12",
    ".netrc",
    ".npmrc",
    ".pypirc",
    "secrets.*",
];

/// Directories search tools never descend into.
const SKIPPED_DIRS: &[&str] = &[".git", "node_modules", "target", "dist", "build", "__pycache__", "vendor"];

/// Path resolution confined to one root directory.
#[derive(Clone, Debug)]
pub struct Sandbox {
    root: PathBuf,
    ignore: Vec<glob::Pattern>,
}

impl Sandbox {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: normalize(&root.into()),
            ignore: Vec::new(),
        }
    }

    /// Sandbox for a tool call: the alternate root when present, with the
    /// project's ignore globs.
    pub fn for_context(ctx: &ToolContext) -> Self {
        let mut sandbox = Self::new(ctx.root());
        sandbox.ignore = ctx
            .ignore_patterns
            .iter()
            .filter_map(|p| glob::Pattern::new(p).ok())
            .collect();
        sandbox
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `file_path` against the root and reject anything outside it.
    /// Containment is checked per component, so `/root/project-other` is not
    /// inside `/root/project`.
    pub fn resolve(&self, file_path: &str) -> Result<PathBuf, ToolError> {
        if file_path.trim().is_empty() {
            return Err(ToolError::InvalidArguments("path is empty".into()));
        }
        let path = Path::new(file_path);
        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        let resolved = normalize(&joined);
        if resolved.starts_with(&self.root) && self.is_contained(&resolved) {
            Ok(resolved)
        } else {
            Err(ToolError::SandboxEscape(file_path.to_string()))
        }
    }

    /// Whether `path` still lies under the root once symlinks are followed.
    /// The deepest existing ancestor is checked, so a file that does not
    /// exist yet is judged by the directory it would be created in. A
    /// dangling link is refused since writing through it lands wherever it
    /// points.
    pub fn is_contained(&self, path: &Path) -> bool {
        let Ok(root) = std::fs::canonicalize(&self.root) else {
            return true;
        };
        for ancestor in path.ancestors() {
            match std::fs::canonicalize(ancestor) {
                Ok(real) => return real.starts_with(&root),
                Err(_) if std::fs::symlink_metadata(ancestor).is_ok() => return false,
                Err(_) => continue,
            }
        }
        false
    }

    /// Resolve a path a read tool is about to open.
    pub fn resolve_readable(&self, file_path: &str) -> Result<PathBuf, ToolError> {
        let path = self.resolve(file_path)?;
        if is_sensitive(&path) {
            return Err(ToolError::SensitivePath(self.display(&path)));
        }
        Ok(path)
    }

    /// Root-relative display form.
    pub fn display(&self, path: &Path) -> String {
        match path.strip_prefix(&self.root) {
            Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
            Ok(rel) => rel.display().to_string(),
            Err(_) => path.display().to_string(),
        }
    }

    /// Whether search tools should leave this path out: credential files,
    /// build and VCS directories, and anything the project ignores.
    pub fn is_skipped(&self, path: &Path) -> bool {
        if is_sensitive(path) {
            return true;
        }
        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        let mut prefix = PathBuf::new();
        for component in rel.components() {
            let name = component.as_os_str().to_string_lossy();
            if SKIPPED_DIRS.contains(&name.as_ref()) {
                return true;
            }
            prefix.push(component);
            if self.ignore.iter().any(|p| p.matches_path(&prefix)) {
                return true;
            }
        }
        false
    }
}

/// Lexically normalize a path: drop `.` and collapse `..`. Never touches the
/// filesystem and never climbs above the root component.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Whether the file name looks like it holds credentials.
pub fn is_sensitive(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    SENSITIVE_PATTERNS.iter().any(|pattern| {
        glob::Pattern::new(pattern)
            .map(|p| p.matches(name))
            .unwrap_or(false)
    })
}
