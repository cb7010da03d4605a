use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::BridgeError;
use crate::server::dispatcher::MessageHandler;
use crate::server::registry::SessionHandle;
use crate::workspace::{real_path_within_roots, resolve_within_roots, WorkspaceIdentity};

const DEFAULT_MAX_FILE_BYTES: u64 = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("context kind not supported: {0}")]
    Unsupported(String),

    #[error("{0}")]
    InvalidParams(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("context unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<ContextError> for BridgeError {
    fn from(error: ContextError) -> Self {
        match error {
            ContextError::Unsupported(kind) => BridgeError::Unsupported(kind),
            ContextError::InvalidParams(message) => BridgeError::InvalidParams(message),
            other => BridgeError::Handler(other.to_string()),
        }
    }
}

/// Editor-side data source: files, selections, diagnostics, tab lists.
#[async_trait]
pub trait ContextProvider: Send + Sync {
    async fn fetch(&self, kind: &str, params: &Value) -> Result<Value, ContextError>;
}

#[derive(Debug, Deserialize)]
struct ContextRequest {
    kind: String,
    #[serde(default)]
    params: Value,
}

/// Serves `context` envelopes from a `ContextProvider`.
pub struct ContextHandler {
    provider: Arc<dyn ContextProvider>,
}

impl ContextHandler {
    pub fn new(provider: Arc<dyn ContextProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl MessageHandler for ContextHandler {
    async fn handle(&self, _session: &SessionHandle, payload: Value) -> Result<Value, BridgeError> {
        let request: ContextRequest = serde_json::from_value(payload)
            .map_err(|error| BridgeError::InvalidParams(error.to_string()))?;
        let data = self.provider.fetch(&request.kind, &request.params).await?;
        Ok(json!({
            "kind": request.kind,
            "data": data,
        }))
    }
}

/// Filesystem-backed provider used when no editor is attached: workspace
/// metadata and file contents confined to the workspace roots.
pub struct WorkspaceContextProvider {
    identity: WorkspaceIdentity,
    max_file_bytes: u64,
}

#[derive(Debug, Deserialize)]
struct FileParams {
    path: String,
}

impl WorkspaceContextProvider {
    pub fn new(identity: WorkspaceIdentity) -> Self {
        Self {
            identity,
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
        }
    }

    pub fn with_max_file_bytes(mut self, max_file_bytes: u64) -> Self {
        self.max_file_bytes = max_file_bytes;
        self
    }

    /// Lexical check first, then the real location after following symlinks.
    fn resolve(&self, raw: &str) -> Result<PathBuf, ContextError> {
        if raw.trim().is_empty() {
            return Err(ContextError::InvalidParams("path must not be empty".to_string()));
        }
        let outside =
            || ContextError::InvalidParams("path must stay within the workspace roots".to_string());
        let requested = resolve_within_roots(raw, self.identity.root_paths()).ok_or_else(outside)?;

        match real_path_within_roots(&requested, self.identity.root_paths()) {
            Ok(Some(real)) => Ok(real),
            Ok(None) => Err(outside()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                Err(ContextError::NotFound(raw.trim().to_string()))
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn read_file(&self, params: &Value) -> Result<Value, ContextError> {
        let params: FileParams = serde_json::from_value(params.clone())
            .map_err(|error| ContextError::InvalidParams(error.to_string()))?;
        let path = self.resolve(&params.path)?;

        let metadata = tokio::fs::metadata(&path).await?;
        if !metadata.is_file() {
            return Err(ContextError::InvalidParams(format!(
                "{} is not a file",
                params.path
            )));
        }
        if metadata.len() > self.max_file_bytes {
            return Err(ContextError::Unavailable(format!(
                "{} is larger than {} bytes",
                params.path, self.max_file_bytes
            )));
        }

        let bytes = tokio::fs::read(&path).await?;
        Ok(json!({
            "path": path.to_string_lossy(),
            "content": String::from_utf8_lossy(&bytes),
            "size": metadata.len(),
        }))
    }
}

#[async_trait]
impl ContextProvider for WorkspaceContextProvider {
    async fn fetch(&self, kind: &str, params: &Value) -> Result<Value, ContextError> {
        match kind {
            "workspace" => Ok(json!({
                "id": self.identity.id(),
                "name": self.identity.name(),
                "roots": self
                    .identity
                    .root_paths()
                    .iter()
                    .map(|root| root.to_string_lossy().to_string())
                    .collect::<Vec<_>>(),
                "stable": self.identity.stable(),
            })),
            "file" => self.read_file(params).await,
            other => Err(ContextError::Unsupported(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::codes;

    fn provider(dir: &tempfile::TempDir) -> WorkspaceContextProvider {
        WorkspaceContextProvider::new(WorkspaceIdentity::from_roots(&[dir.path()]))
    }

    #[tokio::test]
    async fn reads_file_inside_workspace() {
        let dir = tempfile::tempdir().expect("create tempdir");
        std::fs::write(dir.path().join("main.rs"), "fn main() {}").expect("write file");

        let data = provider(&dir)
            .fetch("file", &json!({ "path": "main.rs" }))
            .await
            .expect("read file");
        assert_eq!(data["content"], "fn main() {}");
        assert_eq!(data["size"], 12);
    }

    #[tokio::test]
    async fn rejects_escape_from_workspace() {
        let dir = tempfile::tempdir().expect("create tempdir");
        let error = provider(&dir)
            .fetch("file", &json!({ "path": "../../etc/passwd" }))
            .await
            .expect_err("escape rejected");
        assert!(matches!(error, ContextError::InvalidParams(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_out_of_workspace_is_rejected() {
        let dir = tempfile::tempdir().expect("create tempdir");
        let outside = tempfile::tempdir().expect("create outside dir");
        std::fs::write(outside.path().join("secret.txt"), "TOP SECRET").expect("write secret");
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).expect("symlink");

        let error = provider(&dir)
            .fetch("file", &json!({ "path": "link/secret.txt" }))
            .await
            .expect_err("symlink escape rejected");
        assert!(matches!(error, ContextError::InvalidParams(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_inside_workspace_is_followed() {
        let dir = tempfile::tempdir().expect("create tempdir");
        std::fs::create_dir(dir.path().join("docs")).expect("create docs");
        std::fs::write(dir.path().join("docs/notes.md"), "notes").expect("write notes");
        std::os::unix::fs::symlink(dir.path().join("docs"), dir.path().join("alias"))
            .expect("symlink");

        let data = provider(&dir)
            .fetch("file", &json!({ "path": "alias/notes.md" }))
            .await
            .expect("read through symlink");
        assert_eq!(data["content"], "notes");
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().expect("create tempdir");
        let error = provider(&dir)
            .fetch("file", &json!({ "path": "nope.txt" }))
            .await
            .expect_err("missing file");
        assert!(matches!(error, ContextError::NotFound(_)));
    }

    #[tokio::test]
    async fn oversized_file_is_unavailable() {
        let dir = tempfile::tempdir().expect("create tempdir");
        std::fs::write(dir.path().join("big.log"), "0123456789").expect("write file");

        let error = provider(&dir)
            .with_max_file_bytes(4)
            .fetch("file", &json!({ "path": "big.log" }))
            .await
            .expect_err("too big");
        assert!(matches!(error, ContextError::Unavailable(_)));
    }

    #[tokio::test]
    async fn workspace_kind_reports_identity() {
        let dir = tempfile::tempdir().expect("create tempdir");
        let provider = provider(&dir);
        let data = provider
            .fetch("workspace", &Value::Null)
            .await
            .expect("workspace metadata");
        assert_eq!(data["id"], provider.identity.id());
        assert_eq!(data["stable"], true);
    }

    #[tokio::test]
    async fn unsupported_kind_maps_to_unsupported_code() {
        let dir = tempfile::tempdir().expect("create tempdir");
        let error = provider(&dir)
            .fetch("diagnostics", &Value::Null)
            .await
            .expect_err("no diagnostics without an editor");
        let bridge: BridgeError = error.into();
        assert_eq!(bridge.code(), codes::UNSUPPORTED);
    }
}
