//! Filesystem helpers shared by the chunk cache and snapshot managers.

use std::io::Write;
use std::path::{Path, PathBuf};

use snapcache_core::error::{Result, SnapshotError};

/// Write `data` to a temp file next to `path`, then rename it into place.
///
/// Readers see either the old file, no file, or the complete new file.
pub fn atomic_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no parent"))?;
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// `atomic_write` on the blocking pool.
pub async fn atomic_write_async(path: PathBuf, data: Vec<u8>) -> Result<()> {
    let display = path.display().to_string();
    tokio::task::spawn_blocking(move || atomic_write(&path, &data))
        .await
        .map_err(|e| SnapshotError::Io(format!("Write task for {} failed: {}", display, e)))?
        .map_err(|e| SnapshotError::Io(format!("Failed to write {}: {}", display, e)))
}

/// Remove a directory tree, treating a missing directory as success.
pub async fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SnapshotError::Io(format!(
            "Failed to remove {}: {}",
            path.display(),
            e
        ))),
    }
}

/// Remove a file, treating a missing file as success.
pub async fn remove_file_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SnapshotError::Io(format!(
            "Failed to remove {}: {}",
            path.display(),
            e
        ))),
    }
}

/// Space a file actually occupies on disk, rounded up to whole MiB.
///
/// Sparse files only count allocated blocks. Missing files count as zero;
/// any existing file counts as at least 1 MiB.
pub async fn disk_usage_mib(path: &Path) -> i64 {
    const MIB: u64 = 1024 * 1024;

    match tokio::fs::metadata(path).await {
        Ok(meta) => {
            let bytes = allocated_bytes(&meta);
            (bytes.div_ceil(MIB) as i64).max(1)
        }
        Err(_) => 0,
    }
}

#[cfg(unix)]
fn allocated_bytes(meta: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.blocks() * 512
}

#[cfg(not(unix))]
fn allocated_bytes(meta: &std::fs::Metadata) -> u64 {
    meta.len()
}
