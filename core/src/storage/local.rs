use async_trait::async_trait;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use super::{select_keys, ObjectStorage};
use crate::error::{Result, SnapshotError};

/// Object store backed by a local directory.
///
/// Useful as a shared store mounted over NFS and in tests. Writes go to a
/// temp file in the target directory and are renamed into place, so readers
/// never see a partial object.
pub struct LocalObjectStorage {
    root: PathBuf,
}

impl LocalObjectStorage {
    /// Create a store rooted at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| {
            SnapshotError::Unavailable(format!(
                "Failed to create object store root {}: {}",
                root.display(),
                e
            ))
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reject keys that could escape the store root.
    fn validate_key(key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(SnapshotError::Config("unsafe object key: empty".into()));
        }
        if key.starts_with('/') || key.contains('\\') {
            return Err(SnapshotError::Config(format!("unsafe object key: '{key}'")));
        }
        if Path::new(key)
            .components()
            .any(|c| c == Component::ParentDir)
        {
            return Err(SnapshotError::Config(format!(
                "unsafe object key: parent traversal '{key}'"
            )));
        }
        Ok(())
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        Self::validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn atomic_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
        let dir = path
            .parent()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "no parent"))?;
        std::fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(data)?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    fn walk(root: &Path, dir: &Path, keys: &mut Vec<String>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                Self::walk(root, &path, keys)?;
                continue;
            }
            if entry.file_name().to_string_lossy().starts_with(".tmp") {
                continue;
            }
            if let Ok(rel) = path.strip_prefix(root) {
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                keys.push(key);
            }
        }
        Ok(())
    }
}

fn unavailable(action: &str, key: &str, err: impl std::fmt::Display) -> SnapshotError {
    SnapshotError::Unavailable(format!("Failed to {} {}: {}", action, key, err))
}

#[async_trait]
impl ObjectStorage for LocalObjectStorage {
    async fn upload_object(&self, key: &str, data: Vec<u8>) -> Result<()> {
        let path = self.resolve(key)?;
        let owned_key = key.to_string();
        tokio::task::spawn_blocking(move || Self::atomic_write(&path, &data))
            .await
            .map_err(|e| unavailable("upload", &owned_key, e))?
            .map_err(|e| unavailable("upload", &owned_key, e))?;

        tracing::trace!(key, "Uploaded object");
        Ok(())
    }

    async fn download_object(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.resolve(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SnapshotError::NotFound(format!("object {}", key)))
            }
            Err(e) => Err(unavailable("download", key, e)),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.resolve(key)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(unavailable("stat", key, e)),
        }
    }

    async fn list_objects(&self, prefix: &str, recursive: bool) -> Result<Vec<String>> {
        let root = self.root.clone();
        let keys = tokio::task::spawn_blocking(move || {
            let mut keys = Vec::new();
            Self::walk(&root, &root, &mut keys).map(|_| keys)
        })
        .await
        .map_err(|e| unavailable("list", prefix, e))?
        .map_err(|e| unavailable("list", prefix, e))?;

        Ok(select_keys(keys, prefix, recursive))
    }
}
