//! Post-execution actions and their dispatch.
//!
//! The analyzer emits loosely typed `{"type": ..., "params": {...}}` objects
//! ([`RawAction`]). They are converted into [`Action`] before anything runs,
//! so an unknown type or malformed parameters fail the attempt up front.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::collaborators::fs::DEFAULT_FILE_MODE;
use crate::collaborators::{FileSystem, WebSearch};
use crate::error::{ActionError, SearchError};
use crate::state::StateChanges;

/// Variable key prefix under which search results are stored.
pub const SEARCH_VARIABLE_PREFIX: &str = "search:";

/// Action as produced by the analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawAction {
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl RawAction {
    pub fn new(action_type: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            action_type: action_type.into(),
            params,
        }
    }
}

/// A validated action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "params")]
pub enum Action {
    FileWrite { path: String, content: String },
    FileRead { path: String },
    FileDelete { path: String },
    DirectoryCreate { path: String },
    WebSearch { query: String },
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Action::FileWrite { .. } => "FileWrite",
            Action::FileRead { .. } => "FileRead",
            Action::FileDelete { .. } => "FileDelete",
            Action::DirectoryCreate { .. } => "DirectoryCreate",
            Action::WebSearch { .. } => "WebSearch",
        }
    }
}

#[derive(Deserialize)]
struct WriteParams {
    path: String,
    content: String,
}

#[derive(Deserialize)]
struct PathParams {
    path: String,
}

#[derive(Deserialize)]
struct SearchParams {
    query: String,
}

fn params<T: serde::de::DeserializeOwned>(raw: &RawAction) -> Result<T, ActionError> {
    serde_json::from_value(raw.params.clone()).map_err(|e| ActionError::InvalidParams {
        action_type: raw.action_type.clone(),
        reason: e.to_string(),
    })
}

fn require_non_empty(raw: &RawAction, field: &str, value: &str) -> Result<(), ActionError> {
    if value.trim().is_empty() {
        return Err(ActionError::InvalidParams {
            action_type: raw.action_type.clone(),
            reason: format!("'{}' must not be empty", field),
        });
    }
    Ok(())
}

impl TryFrom<RawAction> for Action {
    type Error = ActionError;

    /// Type names match case-insensitively and ignore `_`/`-`, so
    /// `file_write` and `FileWrite` are the same action.
    fn try_from(raw: RawAction) -> Result<Self, Self::Error> {
        let normalized: String = raw
            .action_type
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_lowercase();

        let action = match normalized.as_str() {
            "filewrite" => {
                let p: WriteParams = params(&raw)?;
                Action::FileWrite {
                    path: p.path,
                    content: p.content,
                }
            }
            "fileread" => Action::FileRead {
                path: params::<PathParams>(&raw)?.path,
            },
            "filedelete" => Action::FileDelete {
                path: params::<PathParams>(&raw)?.path,
            },
            "directorycreate" => Action::DirectoryCreate {
                path: params::<PathParams>(&raw)?.path,
            },
            "websearch" => {
                let query = params::<SearchParams>(&raw)?.query;
                require_non_empty(&raw, "query", &query)?;
                Action::WebSearch { query }
            }
            _ => return Err(ActionError::UnknownActionType(raw.action_type)),
        };

        if let Action::FileWrite { path, .. }
        | Action::FileRead { path }
        | Action::FileDelete { path }
        | Action::DirectoryCreate { path } = &action
        {
            require_non_empty(&raw, "path", path)?;
        }
        Ok(action)
    }
}

/// Joins a relative `path` onto `project_dir`.
///
/// Returns the absolute location plus the normalized key used in
/// `ProjectState.files`. Absolute paths and `..` components are rejected.
pub fn resolve_path(project_dir: &Path, path: &str) -> Result<(PathBuf, String), ActionError> {
    let unsafe_path = || ActionError::UnsafePath {
        path: path.to_string(),
    };

    let mut parts = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(unsafe_path())
            }
        }
    }
    if parts.is_empty() {
        return Err(unsafe_path());
    }

    let key = parts.join("/");
    Ok((project_dir.join(&key), key))
}

/// Runs actions against the file and search collaborators.
#[derive(Clone)]
pub struct ActionDispatcher {
    fs: Arc<dyn FileSystem>,
    search: Arc<dyn WebSearch>,
}

impl ActionDispatcher {
    pub fn new(fs: Arc<dyn FileSystem>, search: Arc<dyn WebSearch>) -> Self {
        Self { fs, search }
    }

    /// Performs `action` and records its effect in `changes`.
    ///
    /// Nothing is written to project state here; the caller applies
    /// `changes` once the whole task has succeeded.
    pub async fn execute(
        &self,
        action: &Action,
        project_dir: &Path,
        changes: &mut StateChanges,
        cancel: &CancellationToken,
    ) -> Result<(), ActionError> {
        if cancel.is_cancelled() {
            return Err(ActionError::Cancelled);
        }
        debug!(action = action.kind(), "Dispatching action");

        match action {
            Action::FileWrite { path, content } => {
                let (full, key) = resolve_path(project_dir, path)?;
                self.fs
                    .write_file(&full, content, DEFAULT_FILE_MODE)
                    .await
                    .map_err(|source| file_error(&key, source))?;
                changes.record_file(key, content.clone());
            }
            Action::FileRead { path } => {
                let (full, key) = resolve_path(project_dir, path)?;
                let content = self
                    .fs
                    .read_file(&full)
                    .await
                    .map_err(|source| file_error(&key, source))?;
                changes.record_file(key, content);
            }
            Action::FileDelete { path } => {
                let (full, key) = resolve_path(project_dir, path)?;
                self.fs
                    .delete_file(&full)
                    .await
                    .map_err(|source| file_error(&key, source))?;
                changes.record_deletion(key);
            }
            Action::DirectoryCreate { path } => {
                let (full, key) = resolve_path(project_dir, path)?;
                self.fs
                    .create_directory(&full)
                    .await
                    .map_err(|source| file_error(&key, source))?;
            }
            Action::WebSearch { query } => {
                let results = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ActionError::Cancelled),
                    results = self.search.search(query) => results?,
                };
                let encoded = serde_json::to_string(&results)
                    .map_err(|e| SearchError::ParseError(e.to_string()))?;
                info!(query = %query, results = results.len(), "Search results recorded");
                changes.set_variable(format!("{}{}", SEARCH_VARIABLE_PREFIX, query), encoded);
            }
        }
        Ok(())
    }
}

fn file_error(path: &str, source: std::io::Error) -> ActionError {
    ActionError::FileIo {
        path: path.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{DisabledSearch, LocalFileSystem, SearchResult};
    use async_trait::async_trait;
    use serde_json::json;
    use tempfile::TempDir;

    struct FixedSearch;

    #[async_trait]
    impl WebSearch for FixedSearch {
        async fn search(&self, query: &str) -> Result<Vec<SearchResult>, SearchError> {
            Ok(vec![SearchResult {
                title: format!("About {}", query),
                url: "https://example.com".to_string(),
                snippet: String::new(),
            }])
        }
    }

    fn dispatcher(search: Arc<dyn WebSearch>) -> ActionDispatcher {
        ActionDispatcher::new(Arc::new(LocalFileSystem::new()), search)
    }

    #[test]
    fn test_conversion() {
        let raw = RawAction::new("FileWrite", json!({"path": "a.txt", "content": "x"}));
        assert_eq!(
            Action::try_from(raw).unwrap(),
            Action::FileWrite {
                path: "a.txt".to_string(),
                content: "x".to_string()
            }
        );

        let raw = RawAction::new("web_search", json!({"query": "tokio"}));
        assert_eq!(
            Action::try_from(raw).unwrap(),
            Action::WebSearch {
                query: "tokio".to_string()
            }
        );
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let err = Action::try_from(RawAction::new("Deploy", json!({}))).unwrap_err();
        assert!(matches!(err, ActionError::UnknownActionType(t) if t == "Deploy"));
    }

    #[test]
    fn test_missing_params_are_rejected() {
        let err = Action::try_from(RawAction::new("FileWrite", json!({"path": "a"}))).unwrap_err();
        assert!(matches!(err, ActionError::InvalidParams { .. }));

        let err = Action::try_from(RawAction::new("FileRead", json!({"path": " "}))).unwrap_err();
        assert!(err.to_string().contains("'path' must not be empty"));
    }

    #[test]
    fn test_resolve_path() {
        let root = Path::new("/project");
        let (full, key) = resolve_path(root, "./src//main.py").unwrap();
        assert_eq!(full, PathBuf::from("/project/src/main.py"));
        assert_eq!(key, "src/main.py");

        assert!(matches!(
            resolve_path(root, "../etc/passwd"),
            Err(ActionError::UnsafePath { .. })
        ));
        assert!(resolve_path(root, "/etc/passwd").is_err());
        assert!(resolve_path(root, "a/../../b").is_err());
        assert!(resolve_path(root, ".").is_err());
    }

    #[tokio::test]
    async fn test_file_actions_record_changes() {
        let dir = TempDir::new().unwrap();
        let dispatcher = dispatcher(Arc::new(DisabledSearch));
        let cancel = CancellationToken::new();
        let mut changes = StateChanges::new();

        let write = Action::FileWrite {
            path: "out/result.txt".to_string(),
            content: "42".to_string(),
        };
        dispatcher
            .execute(&write, dir.path(), &mut changes, &cancel)
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("out/result.txt")).unwrap(),
            "42"
        );
        assert_eq!(
            changes.files["out/result.txt"].as_ref().unwrap().content,
            "42"
        );

        let delete = Action::FileDelete {
            path: "out/result.txt".to_string(),
        };
        dispatcher
            .execute(&delete, dir.path(), &mut changes, &cancel)
            .await
            .unwrap();
        assert!(changes.files["out/result.txt"].is_none());

        let mkdir = Action::DirectoryCreate {
            path: "assets".to_string(),
        };
        dispatcher
            .execute(&mkdir, dir.path(), &mut changes, &cancel)
            .await
            .unwrap();
        assert!(dir.path().join("assets").is_dir());
        assert!(!changes.files.contains_key("assets"));
    }

    #[tokio::test]
    async fn test_read_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        let err = dispatcher(Arc::new(DisabledSearch))
            .execute(
                &Action::FileRead {
                    path: "nope.txt".to_string(),
                },
                dir.path(),
                &mut StateChanges::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::FileIo { .. }));
    }

    #[tokio::test]
    async fn test_search_result_stored_as_variable() {
        let dir = TempDir::new().unwrap();
        let mut changes = StateChanges::new();
        dispatcher(Arc::new(FixedSearch))
            .execute(
                &Action::WebSearch {
                    query: "tokio".to_string(),
                },
                dir.path(),
                &mut changes,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let stored: Vec<SearchResult> =
            serde_json::from_str(&changes.variables["search:tokio"]).unwrap();
        assert_eq!(stored[0].title, "About tokio");
    }

    #[tokio::test]
    async fn test_cancelled_before_dispatch() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = dispatcher(Arc::new(FixedSearch))
            .execute(
                &Action::DirectoryCreate {
                    path: "x".to_string(),
                },
                dir.path(),
                &mut StateChanges::new(),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::Cancelled));
        assert!(!dir.path().join("x").exists());
    }
}
