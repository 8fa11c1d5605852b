//! Local disk implementation of [`FileSystem`].

use std::path::Path;

use async_trait::async_trait;
use tracing::debug;

use super::FileSystem;

/// Default permissions for files written by actions.
pub const DEFAULT_FILE_MODE: u32 = 0o644;

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileSystem;

impl LocalFileSystem {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FileSystem for LocalFileSystem {
    async fn read_file(&self, path: &Path) -> std::io::Result<String> {
        tokio::fs::read_to_string(path).await
    }

    async fn write_file(&self, path: &Path, content: &str, mode: u32) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, content).await?;
        set_mode(path, mode).await?;
        debug!(
            path = %path.display(),
            bytes = content.len(),
            mode = format!("{:o}", mode),
            "File written"
        );
        Ok(())
    }

    async fn delete_file(&self, path: &Path) -> std::io::Result<()> {
        match tokio::fs::remove_file(path).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    async fn create_directory(&self, path: &Path) -> std::io::Result<()> {
        tokio::fs::create_dir_all(path).await
    }
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_creates_parents_and_reads_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/deeper/out.txt");
        let fs = LocalFileSystem::new();

        fs.write_file(&path, "hello", DEFAULT_FILE_MODE).await.unwrap();
        assert_eq!(fs.read_file(&path).await.unwrap(), "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_write_applies_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.sh");
        LocalFileSystem::new()
            .write_file(&path, "#!/bin/sh\n", 0o755)
            .await
            .unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[tokio::test]
    async fn test_delete_missing_file_is_ok() {
        let dir = TempDir::new().unwrap();
        let fs = LocalFileSystem::new();
        fs.delete_file(&dir.path().join("absent")).await.unwrap();

        let path = dir.path().join("present");
        fs.write_file(&path, "x", DEFAULT_FILE_MODE).await.unwrap();
        fs.delete_file(&path).await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_create_directory_is_recursive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a/b/c");
        LocalFileSystem::new().create_directory(&path).await.unwrap();
        assert!(path.is_dir());
    }
}
