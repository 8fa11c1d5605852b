//! Timestamped checkpoint files for project state.
//!
//! Each snapshot is one pretty-printed JSON document named
//! `project_state_<YYYYMMDDHHMMSS>.json` (UTC). The lexicographically greatest
//! filename is the authoritative snapshot.

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use super::project::ProjectState;
use crate::error::CheckpointError;

const FILENAME_PREFIX: &str = "project_state_";
const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

static SNAPSHOT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^project_state_\d{14}\.json$").expect("Invalid regex for snapshot filenames")
});

/// Returns true if `name` is a checkpoint filename.
pub fn is_snapshot_filename(name: &str) -> bool {
    SNAPSHOT_PATTERN.is_match(name)
}

/// Builds the checkpoint filename for a timestamp.
pub fn snapshot_filename(timestamp: DateTime<Utc>) -> String {
    format!(
        "{FILENAME_PREFIX}{}.json",
        timestamp.format(TIMESTAMP_FORMAT)
    )
}

/// Directory of project state snapshots.
///
/// Clones share one write lock, so saves through any clone are renamed into
/// place in the order they were issued.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn io_error(path: &Path, source: std::io::Error) -> CheckpointError {
        CheckpointError::Io {
            path: path.display().to_string(),
            source,
        }
    }

    /// Writes a snapshot stamped with the current time.
    pub async fn save(&self, state: &ProjectState) -> Result<PathBuf, CheckpointError> {
        self.save_at(state, Utc::now()).await
    }

    /// Writes a snapshot stamped with `timestamp`.
    ///
    /// The document is written to a temporary file and renamed into place, so
    /// a reader never sees a half-written snapshot. Saves that land on the
    /// same second overwrite each other; the last one wins.
    pub async fn save_at(
        &self,
        state: &ProjectState,
        timestamp: DateTime<Utc>,
    ) -> Result<PathBuf, CheckpointError> {
        let filename = snapshot_filename(timestamp);
        let path = self.dir.join(&filename);
        let tmp_path = self
            .dir
            .join(format!(".{filename}.{}.tmp", Uuid::new_v4().simple()));

        let json = serde_json::to_string_pretty(state).map_err(|e| CheckpointError::Json {
            path: path.display().to_string(),
            source: e,
        })?;

        let _guard = self.write_lock.lock().await;

        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Self::io_error(&self.dir, e))?;

        let mut file = fs::File::create(&tmp_path)
            .await
            .map_err(|e| Self::io_error(&tmp_path, e))?;
        file.write_all(json.as_bytes())
            .await
            .map_err(|e| Self::io_error(&tmp_path, e))?;
        file.sync_all()
            .await
            .map_err(|e| Self::io_error(&tmp_path, e))?;
        drop(file);

        if let Err(e) = fs::rename(&tmp_path, &path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(Self::io_error(&path, e));
        }

        info!(
            path = %path.display(),
            completed = state.completed_tasks.len(),
            "Checkpoint saved"
        );
        Ok(path)
    }

    /// Lists snapshot files, oldest first.
    ///
    /// A missing directory is treated as empty.
    pub async fn list(&self) -> Result<Vec<PathBuf>, CheckpointError> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Self::io_error(&self.dir, e)),
        };

        let mut snapshots = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Self::io_error(&self.dir, e))?
        {
            let name = entry.file_name();
            if name.to_str().is_some_and(is_snapshot_filename) {
                snapshots.push(entry.path());
            }
        }

        snapshots.sort();
        Ok(snapshots)
    }

    /// Path of the newest snapshot, if any.
    pub async fn latest_path(&self) -> Result<Option<PathBuf>, CheckpointError> {
        Ok(self.list().await?.pop())
    }

    /// Reads one snapshot file.
    pub async fn load(&self, path: &Path) -> Result<ProjectState, CheckpointError> {
        let contents = fs::read_to_string(path)
            .await
            .map_err(|e| Self::io_error(path, e))?;
        serde_json::from_str(&contents).map_err(|e| CheckpointError::Json {
            path: path.display().to_string(),
            source: e,
        })
    }

    /// Loads the newest snapshot.
    ///
    /// # Errors
    ///
    /// Returns `CheckpointError::NotFound` when the directory holds no snapshot.
    pub async fn load_latest(&self) -> Result<ProjectState, CheckpointError> {
        match self.load_latest_if_any().await? {
            Some((_, state)) => Ok(state),
            None => Err(CheckpointError::NotFound {
                dir: self.dir.display().to_string(),
            }),
        }
    }

    /// Loads the newest snapshot together with its path, or `None`.
    pub async fn load_latest_if_any(
        &self,
    ) -> Result<Option<(PathBuf, ProjectState)>, CheckpointError> {
        let Some(path) = self.latest_path().await? else {
            return Ok(None);
        };
        debug!(path = %path.display(), "Loading latest checkpoint");
        let state = self.load(&path).await?;
        Ok(Some((path, state)))
    }

    /// Loads the current snapshot, merges `incoming` into it and saves the result.
    ///
    /// With no existing snapshot, `incoming` is saved as is.
    pub async fn update(
        &self,
        incoming: ProjectState,
    ) -> Result<(PathBuf, ProjectState), CheckpointError> {
        let mut state = match self.load_latest_if_any().await? {
            Some((_, current)) => current,
            None => ProjectState::new(),
        };
        state.merge(incoming);
        let path = self.save(&state).await?;
        Ok((path, state))
    }
}
