//! Snapshot handles and their on-disk layout.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use snapcache_core::config::SensitivityMode;
use snapcache_core::error::{Result, SnapshotError};

use crate::fs::{atomic_write_async, disk_usage_mib, remove_dir_if_exists};

/// Guest memory image.
pub const MEM_FILE: &str = "memfile";
/// VMM device state.
pub const SNAP_FILE: &str = "snapfile";
/// Rootfs patch applied on restore.
pub const PATCH_FILE: &str = "patchfile";
/// Snapshot metadata (JSON).
pub const INFO_FILE: &str = "info_file";
/// Chunk recipe of the memory image.
pub const RECIPE_FILE: &str = "recipe_file";
/// Working-set page list recorded after restore.
pub const WS_FILE: &str = "ws_file";

/// Persistent metadata of a snapshot, stored as `info_file`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub id: String,
    pub image: String,
    pub container_snap_name: String,
    pub mem_size_mib: u32,
    pub vcpu_count: u32,
    pub sparse: bool,
    /// Chunk size the memory image was split with, if chunked
    #[serde(default)]
    pub chunk_size: Option<u64>,
    /// Sensitivity mode the recipe was written with, if chunked
    #[serde(default)]
    pub sensitivity_mode: Option<SensitivityMode>,
}

impl SnapshotInfo {
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SnapshotError::NotFound(format!("snapshot info {}", path.display()))
            } else {
                SnapshotError::Io(format!("Failed to read {}: {}", path.display(), e))
            }
        })?;
        Self::from_slice(&content)
    }

    pub fn from_slice(content: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(content)?)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
}

/// A snapshot of one function instance: a directory holding the memory
/// image, VMM state, and metadata files.
///
/// Handles are cheap to clone; managers hand out copies and keep the
/// authoritative record themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    id: String,
    snap_dir: PathBuf,
    image: String,
    container_snap_name: String,
    mem_size_mib: u32,
    vcpu_count: u32,
    sparse: bool,
}

impl Snapshot {
    /// New snapshot `id` below `base_dir`.
    ///
    /// The container snapshot name is the id plus a creation timestamp.
    pub fn new(
        id: &str,
        base_dir: &Path,
        image: &str,
        mem_size_mib: u32,
        vcpu_count: u32,
        sparse: bool,
    ) -> Self {
        Self {
            id: id.to_string(),
            snap_dir: base_dir.join(id),
            image: image.to_string(),
            container_snap_name: format!("{}{}", id, chrono::Utc::now().format("%Y%m%d%H%M%S")),
            mem_size_mib,
            vcpu_count,
            sparse,
        }
    }

    /// Rebuild a handle from persisted metadata.
    pub fn from_info(base_dir: &Path, info: &SnapshotInfo) -> Self {
        Self {
            id: info.id.clone(),
            snap_dir: base_dir.join(&info.id),
            image: info.image.clone(),
            container_snap_name: info.container_snap_name.clone(),
            mem_size_mib: info.mem_size_mib,
            vcpu_count: info.vcpu_count,
            sparse: info.sparse,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn container_snap_name(&self) -> &str {
        &self.container_snap_name
    }

    pub fn mem_size_mib(&self) -> u32 {
        self.mem_size_mib
    }

    pub fn vcpu_count(&self) -> u32 {
        self.vcpu_count
    }

    pub fn sparse(&self) -> bool {
        self.sparse
    }

    /// `Diff` for sparse memory images, `Full` otherwise.
    pub fn snap_type(&self) -> &'static str {
        if self.sparse {
            "Diff"
        } else {
            "Full"
        }
    }

    pub fn snap_dir(&self) -> &Path {
        &self.snap_dir
    }

    pub fn mem_file_path(&self) -> PathBuf {
        self.snap_dir.join(MEM_FILE)
    }

    pub fn snap_file_path(&self) -> PathBuf {
        self.snap_dir.join(SNAP_FILE)
    }

    pub fn patch_file_path(&self) -> PathBuf {
        self.snap_dir.join(PATCH_FILE)
    }

    pub fn info_file_path(&self) -> PathBuf {
        self.snap_dir.join(INFO_FILE)
    }

    pub fn recipe_file_path(&self) -> PathBuf {
        self.snap_dir.join(RECIPE_FILE)
    }

    pub fn ws_file_path(&self) -> PathBuf {
        self.snap_dir.join(WS_FILE)
    }

    /// Create the snapshot directory. Fails if it already exists.
    pub async fn create_dir(&self) -> Result<()> {
        tokio::fs::create_dir(&self.snap_dir).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                SnapshotError::AlreadyExists(format!(
                    "snapshot directory {}",
                    self.snap_dir.display()
                ))
            } else {
                SnapshotError::Io(format!(
                    "Failed to create snapshot directory {}: {}",
                    self.snap_dir.display(),
                    e
                ))
            }
        })
    }

    /// Delete the snapshot directory and everything in it.
    pub async fn cleanup(&self) -> Result<()> {
        remove_dir_if_exists(&self.snap_dir).await
    }

    /// Space the files in the snapshot directory occupy, in whole MiB per
    /// file. A missing directory is empty.
    pub async fn disk_size_mib(&self) -> i64 {
        let Ok(mut entries) = tokio::fs::read_dir(&self.snap_dir).await else {
            return 0;
        };
        let mut total = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            if is_file {
                total += disk_usage_mib(&entry.path()).await;
            }
        }
        total
    }

    pub fn info(&self) -> SnapshotInfo {
        SnapshotInfo {
            id: self.id.clone(),
            image: self.image.clone(),
            container_snap_name: self.container_snap_name.clone(),
            mem_size_mib: self.mem_size_mib,
            vcpu_count: self.vcpu_count,
            sparse: self.sparse,
            chunk_size: None,
            sensitivity_mode: None,
        }
    }

    /// Persist `info` as this snapshot's `info_file`.
    pub async fn write_info(&self, info: &SnapshotInfo) -> Result<()> {
        atomic_write_async(self.info_file_path(), info.to_vec()?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_paths_and_names() {
        let snap = Snapshot::new("rev-1", Path::new("/snaps"), "nginx", 256, 2, false);
        assert_eq!(snap.snap_dir(), Path::new("/snaps/rev-1"));
        assert_eq!(snap.mem_file_path(), PathBuf::from("/snaps/rev-1/memfile"));
        assert_eq!(snap.recipe_file_path(), PathBuf::from("/snaps/rev-1/recipe_file"));
        assert!(snap.container_snap_name().starts_with("rev-1"));
        assert_eq!(snap.container_snap_name().len(), "rev-1".len() + 14);
        assert_eq!(snap.snap_type(), "Full");
    }

    #[test]
    fn test_sparse_is_diff() {
        let snap = Snapshot::new("rev-1", Path::new("/snaps"), "nginx", 256, 2, true);
        assert_eq!(snap.snap_type(), "Diff");
    }

    #[tokio::test]
    async fn test_create_dir_twice_fails() {
        let dir = TempDir::new().unwrap();
        let snap = Snapshot::new("rev-1", dir.path(), "nginx", 256, 2, false);
        snap.create_dir().await.unwrap();
        let result = snap.create_dir().await;
        assert!(matches!(result, Err(SnapshotError::AlreadyExists(_))));

        snap.cleanup().await.unwrap();
        assert!(!snap.snap_dir().exists());
    }

    #[tokio::test]
    async fn test_info_roundtrip() {
        let dir = TempDir::new().unwrap();
        let snap = Snapshot::new("rev-1", dir.path(), "nginx", 256, 2, true);
        snap.create_dir().await.unwrap();

        let mut info = snap.info();
        info.chunk_size = Some(4096);
        info.sensitivity_mode = Some(SensitivityMode::Partial);
        snap.write_info(&info).await.unwrap();

        let loaded = SnapshotInfo::load(&snap.info_file_path()).await.unwrap();
        assert_eq!(loaded, info);
        assert_eq!(Snapshot::from_info(dir.path(), &loaded), snap);
    }

    #[tokio::test]
    async fn test_info_without_chunk_fields() {
        let info = SnapshotInfo::from_slice(
            br#"{"id":"r","image":"i","container_snap_name":"r1","mem_size_mib":1,"vcpu_count":1,"sparse":false}"#,
        )
        .unwrap();
        assert_eq!(info.chunk_size, None);
        assert_eq!(info.sensitivity_mode, None);
    }

    #[tokio::test]
    async fn test_disk_size_counts_present_files() {
        let dir = TempDir::new().unwrap();
        let snap = Snapshot::new("rev-1", dir.path(), "nginx", 256, 2, false);
        snap.create_dir().await.unwrap();
        assert_eq!(snap.disk_size_mib().await, 0);

        std::fs::write(snap.mem_file_path(), vec![1u8; 4096]).unwrap();
        std::fs::write(snap.snap_file_path(), vec![1u8; 64]).unwrap();
        assert_eq!(snap.disk_size_mib().await, 2);
    }

    #[tokio::test]
    async fn test_disk_size_counts_recipe_and_working_set() {
        let dir = TempDir::new().unwrap();
        let snap = Snapshot::new("rev-1", dir.path(), "nginx", 256, 2, false);
        snap.create_dir().await.unwrap();

        std::fs::write(snap.mem_file_path(), vec![1u8; 4096]).unwrap();
        std::fs::write(snap.recipe_file_path(), vec![0u8; 32]).unwrap();
        std::fs::write(snap.ws_file_path(), b"0 1 2").unwrap();
        std::fs::create_dir(snap.snap_dir().join("nested")).unwrap();
        assert_eq!(snap.disk_size_mib().await, 3);
    }

    #[tokio::test]
    async fn test_disk_size_of_missing_dir_is_zero() {
        let dir = TempDir::new().unwrap();
        let snap = Snapshot::new("rev-1", dir.path(), "nginx", 256, 2, false);
        assert_eq!(snap.disk_size_mib().await, 0);
    }
}
