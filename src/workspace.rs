use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::warn;

use crate::protocol::WorkspaceHint;

const ID_HEX_LEN: usize = 16;

/// Stable identity of a workspace, derived from its root paths.
///
/// Built once at process start and never recomputed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceIdentity {
    id: String,
    name: String,
    root_paths: Vec<PathBuf>,
    stable: bool,
}

impl WorkspaceIdentity {
    /// Identity for the given roots. An empty root set gets a random id that is
    /// only valid for this process (`stable() == false`).
    pub fn from_roots<P: AsRef<Path>>(roots: &[P]) -> Self {
        let root_paths = canonical_root_set(roots);
        let name = roots
            .first()
            .and_then(|root| root.as_ref().file_name())
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "untitled".to_string());

        if root_paths.is_empty() {
            let id = uuid::Uuid::new_v4().simple().to_string()[..ID_HEX_LEN].to_string();
            warn!(workspace_id = %id, "workspace has no roots; id is process-scoped");
            return Self {
                id,
                name,
                root_paths,
                stable: false,
            };
        }

        Self {
            id: compute_workspace_id(&root_paths),
            name,
            root_paths,
            stable: true,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Canonicalized roots, sorted and deduplicated.
    pub fn root_paths(&self) -> &[PathBuf] {
        &self.root_paths
    }

    pub fn stable(&self) -> bool {
        self.stable
    }

    pub fn hint(&self) -> WorkspaceHint {
        WorkspaceHint {
            id: self.id.clone(),
            name: self.name.clone(),
            path: self
                .root_paths
                .first()
                .map(|path| path.to_string_lossy().to_string()),
        }
    }
}

/// Hash of an already canonical, sorted root set.
fn compute_workspace_id(canonical_roots: &[PathBuf]) -> String {
    let joined = canonical_roots
        .iter()
        .map(|path| path.to_string_lossy())
        .collect::<Vec<_>>()
        .join("\n");
    let digest = Sha256::digest(joined.as_bytes());
    hex::encode(digest)[..ID_HEX_LEN].to_string()
}

fn canonical_root_set<P: AsRef<Path>>(roots: &[P]) -> Vec<PathBuf> {
    let mut canonical = roots
        .iter()
        .map(|root| canonicalize_root(root.as_ref()))
        .collect::<Vec<_>>();
    canonical.sort();
    canonical.dedup();
    canonical
}

fn canonicalize_root(path: &Path) -> PathBuf {
    fold_case(std::fs::canonicalize(path).unwrap_or_else(|_| normalize_path(path)))
}

fn fold_case(path: PathBuf) -> PathBuf {
    if cfg!(any(windows, target_os = "macos")) {
        PathBuf::from(path.to_string_lossy().to_lowercase())
    } else {
        path
    }
}

/// Lexical normalization: drops `.` and resolves `..` without touching the disk.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();

    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            Component::RootDir | Component::Prefix(_) | Component::Normal(_) => {
                normalized.push(component.as_os_str());
            }
        }
    }

    normalized
}

/// Resolves `raw` against the first root and returns it only if it stays
/// inside one of `roots`.
pub fn resolve_within_roots(raw: &str, roots: &[PathBuf]) -> Option<PathBuf> {
    let first = roots.first()?;
    let path = PathBuf::from(raw.trim());
    let requested = if path.is_absolute() {
        path
    } else {
        first.join(path)
    };

    let normalized = normalize_path(&requested);
    roots
        .iter()
        .any(|root| normalized.starts_with(normalize_path(root)))
        .then_some(normalized)
}

/// Follows symlinks in an existing `path` and returns its real location if
/// that is still inside one of the canonical `roots`.
pub fn real_path_within_roots(path: &Path, roots: &[PathBuf]) -> std::io::Result<Option<PathBuf>> {
    let real = fold_case(std::fs::canonicalize(path)?);
    Ok(roots
        .iter()
        .any(|root| real.starts_with(root))
        .then_some(real))
}
