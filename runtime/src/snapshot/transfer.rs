//! Moving snapshots between local disk and the shared object store.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;

use snapcache_core::config::SnapshotConfig;
use snapcache_core::error::{Result, SnapshotError};
use snapcache_core::hash::ChunkHash;
use snapcache_core::storage::{snapshot_object_key, ObjectStorage};

use super::handle::{Snapshot, SnapshotInfo, INFO_FILE, MEM_FILE, PATCH_FILE, RECIPE_FILE, SNAP_FILE, WS_FILE};
use super::working_set::WorkingSet;
use crate::chunk::{ChunkStore, Recipe};
use crate::fs::atomic_write_async;
use crate::sensitivity::Classifier;

/// What an upload wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReport {
    /// Chunks in the memory file, 0 when uploaded whole
    pub chunks: usize,
    /// Chunks that were new to the shared store
    pub uploaded: usize,
    /// Memory file size in bytes
    pub bytes: u64,
}

/// Uploads and downloads whole snapshots.
///
/// With chunking on, memory files travel as deduplicated chunks plus a
/// recipe; the snapshot's id is the identity sensitive chunks are
/// remapped with.
#[derive(Clone)]
pub struct SnapshotTransfer {
    storage: Arc<dyn ObjectStorage>,
    store: ChunkStore,
    classifier: Classifier,
    chunking: bool,
    lazy: bool,
    ws_pulling: bool,
}

impl SnapshotTransfer {
    pub fn new(store: ChunkStore, classifier: Classifier) -> Self {
        Self {
            storage: Arc::clone(store.cache().storage()),
            store,
            classifier,
            chunking: true,
            lazy: false,
            ws_pulling: false,
        }
    }

    pub fn from_config(config: &SnapshotConfig, store: ChunkStore, classifier: Classifier) -> Self {
        Self::new(store, classifier)
            .with_chunking(config.chunking)
            .with_lazy(config.lazy, config.ws_pulling)
    }

    pub fn with_chunking(mut self, chunking: bool) -> Self {
        self.chunking = chunking;
        self
    }

    /// Fetch only the recipe on download, optionally prefetching the
    /// recorded working set.
    pub fn with_lazy(mut self, lazy: bool, ws_pulling: bool) -> Self {
        self.lazy = lazy;
        self.ws_pulling = lazy && ws_pulling;
        self
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub fn chunking(&self) -> bool {
        self.chunking
    }

    pub fn lazy(&self) -> bool {
        self.lazy
    }

    /// Upload a committed snapshot.
    ///
    /// State and metadata files go first, then the memory file. The recipe
    /// is uploaded last, once every chunk it names is stored.
    pub async fn upload(&self, snapshot: &Snapshot) -> Result<UploadReport> {
        let revision = snapshot.id();
        let mut info = snapshot.info();
        if self.chunking {
            info.chunk_size = Some(self.store.chunk_size() as u64);
            info.sensitivity_mode = Some(self.classifier.mode());
        }
        snapshot.write_info(&info).await?;

        self.upload_file(revision, &snapshot.snap_file_path(), SNAP_FILE).await?;
        self.upload_file(revision, &snapshot.info_file_path(), INFO_FILE).await?;
        if tokio::fs::metadata(snapshot.patch_file_path()).await.is_ok() {
            self.upload_file(revision, &snapshot.patch_file_path(), PATCH_FILE).await?;
        }

        let report = if self.chunking {
            let (recipe, report) = self.upload_chunks(snapshot).await?;
            recipe.save(&snapshot.recipe_file_path()).await?;
            self.upload_file(revision, &snapshot.recipe_file_path(), RECIPE_FILE).await?;
            report
        } else {
            let bytes = self.upload_file(revision, &snapshot.mem_file_path(), MEM_FILE).await?;
            UploadReport {
                bytes,
                ..Default::default()
            }
        };

        tracing::info!(
            revision,
            chunks = report.chunks,
            uploaded = report.uploaded,
            bytes = report.bytes,
            "Uploaded snapshot"
        );
        Ok(report)
    }

    /// Upload the working-set file recorded for `snapshot`.
    pub async fn upload_ws_file(&self, snapshot: &Snapshot) -> Result<()> {
        self.upload_file(snapshot.id(), &snapshot.ws_file_path(), WS_FILE).await?;
        Ok(())
    }

    /// Whether the shared store holds a restorable snapshot of `revision`.
    pub async fn exists(&self, revision: &str) -> Result<bool> {
        for file in [SNAP_FILE, INFO_FILE] {
            if !self.storage.exists(&snapshot_object_key(revision, file)).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Metadata of the stored snapshot of `revision`.
    pub async fn fetch_info(&self, revision: &str) -> Result<SnapshotInfo> {
        let data = self
            .storage
            .download_object(&snapshot_object_key(revision, INFO_FILE))
            .await?;
        SnapshotInfo::from_slice(&data)
    }

    /// Materialize the stored snapshot described by `info` into the
    /// directory of `snapshot`.
    ///
    /// In lazy mode only the recipe is fetched, plus the working set when
    /// pulling is enabled.
    pub async fn download_into(&self, snapshot: &Snapshot, info: &SnapshotInfo) -> Result<()> {
        let revision = snapshot.id();
        snapshot.write_info(info).await?;
        self.download_file(revision, SNAP_FILE, &snapshot.snap_file_path()).await?;
        self.download_optional(revision, PATCH_FILE, &snapshot.patch_file_path()).await?;
        let has_ws = self
            .download_optional(revision, WS_FILE, &snapshot.ws_file_path())
            .await?;

        let Some(chunk_size) = info.chunk_size else {
            self.download_file(revision, MEM_FILE, &snapshot.mem_file_path()).await?;
            return Ok(());
        };
        if chunk_size != self.store.chunk_size() as u64 {
            return Err(SnapshotError::InvalidRecipe(format!(
                "snapshot {} was chunked at {} bytes, store uses {}",
                revision,
                chunk_size,
                self.store.chunk_size()
            )));
        }

        self.download_file(revision, RECIPE_FILE, &snapshot.recipe_file_path()).await?;
        let recipe = Recipe::load(&snapshot.recipe_file_path()).await?;

        if self.lazy {
            if self.ws_pulling && has_ws {
                self.prefetch_working_set(snapshot).await?;
            }
            return Ok(());
        }

        self.store
            .reconstruct_to_file(&recipe, revision, &snapshot.mem_file_path())
            .await?;
        Ok(())
    }

    /// Prefetch the chunks covering the pages in `ws_file` into the local
    /// chunk cache. Returns the number of chunks requested.
    ///
    /// Failed prefetches are logged; the chunks are fetched again on demand.
    pub async fn prefetch_working_set(&self, snapshot: &Snapshot) -> Result<usize> {
        let ws = WorkingSet::load(&snapshot.ws_file_path(), self.store.chunk_size() as u64).await?;
        let recipe = Recipe::load(&snapshot.recipe_file_path()).await?;
        let hashes = ws.hashes(&recipe);

        let handles: Vec<_> = hashes.iter().map(|h| self.store.prefetch(h)).collect();
        let mut failed = 0;
        for (hash, joined) in hashes.iter().zip(futures::future::join_all(handles).await) {
            let result = joined
                .map_err(|e| SnapshotError::Io(format!("Prefetch task failed: {}", e)))
                .and_then(|r| r);
            if let Err(e) = result {
                failed += 1;
                tracing::warn!(hash = %hash, error = %e, "Working-set prefetch failed");
            }
        }

        tracing::info!(
            revision = snapshot.id(),
            chunks = hashes.len(),
            failed,
            "Pulled working set"
        );
        Ok(hashes.len())
    }

    /// Chunk, classify, and upload the memory file with at most `threads`
    /// uploads in flight. Returns the recipe of stored hashes.
    async fn upload_chunks(&self, snapshot: &Snapshot) -> Result<(Recipe, UploadReport)> {
        let path = snapshot.mem_file_path();
        let mut file = tokio::fs::File::open(&path).await.map_err(|e| {
            SnapshotError::Io(format!("Failed to open {}: {}", path.display(), e))
        })?;

        let chunker = *self.store.chunker();
        let mut buf = vec![0u8; chunker.chunk_size()];
        let mut recipe = Recipe::new();
        let mut report = UploadReport::default();
        let mut tasks: JoinSet<Result<bool>> = JoinSet::new();

        loop {
            let n = chunker.read_chunk(&mut file, &mut buf).await?;
            if n == 0 {
                break;
            }
            let data = buf[..n].to_vec();
            let plain = ChunkHash::of(&data);
            let stored = self
                .classifier
                .stored_hash(&plain, snapshot.image(), snapshot.id());
            recipe.push(stored);
            report.chunks += 1;
            report.bytes += n as u64;

            while tasks.len() >= self.store.threads() {
                report.uploaded += join_upload(&mut tasks).await?;
            }
            let store = self.store.clone();
            tasks.spawn(async move { store.upload(&stored, &data).await });

            if n < chunker.chunk_size() {
                break;
            }
        }
        while !tasks.is_empty() {
            report.uploaded += join_upload(&mut tasks).await?;
        }

        Ok((recipe, report))
    }

    /// Upload one local file. Returns its size.
    async fn upload_file(&self, revision: &str, path: &Path, name: &str) -> Result<u64> {
        let data = tokio::fs::read(path).await.map_err(|e| {
            SnapshotError::Io(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let size = data.len() as u64;
        self.storage
            .upload_object(&snapshot_object_key(revision, name), data)
            .await?;
        tracing::debug!(revision, file = name, size, "Uploaded snapshot file");
        Ok(size)
    }

    async fn download_file(&self, revision: &str, name: &str, dest: &Path) -> Result<()> {
        let data = self
            .storage
            .download_object(&snapshot_object_key(revision, name))
            .await?;
        atomic_write_async(dest.to_path_buf(), data).await
    }

    /// Download `name` if the shared store has it. Returns whether it did.
    async fn download_optional(&self, revision: &str, name: &str, dest: &Path) -> Result<bool> {
        if !self.storage.exists(&snapshot_object_key(revision, name)).await? {
            return Ok(false);
        }
        self.download_file(revision, name, dest).await?;
        Ok(true)
    }
}

async fn join_upload(tasks: &mut JoinSet<Result<bool>>) -> Result<usize> {
    match tasks.join_next().await {
        Some(joined) => {
            let uploaded = joined
                .map_err(|e| SnapshotError::Io(format!("Chunk upload task failed: {}", e)))??;
            Ok(usize::from(uploaded))
        }
        None => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LocalChunkCache;
    use crate::sensitivity::NoReferences;
    use snapcache_core::config::SensitivityMode;
    use snapcache_core::storage::MemoryObjectStorage;
    use tempfile::TempDir;

    struct Setup {
        dir: TempDir,
        storage: Arc<MemoryObjectStorage>,
        transfer: SnapshotTransfer,
    }

    fn setup(mode: SensitivityMode) -> Setup {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(MemoryObjectStorage::new());
        let cache = LocalChunkCache::new(
            &dir.path().join("_chunks"),
            storage.clone() as Arc<dyn ObjectStorage>,
            1 << 20,
            4,
        )
        .unwrap();
        let store = ChunkStore::new(Arc::new(cache), 4).unwrap();
        let transfer = SnapshotTransfer::new(store, Classifier::new(mode, Arc::new(NoReferences)));
        Setup {
            dir,
            storage,
            transfer,
        }
    }

    async fn local_snapshot(base: &Path, id: &str, mem: &[u8]) -> Snapshot {
        let snap = Snapshot::new(id, base, "nginx", 1, 1, false);
        snap.create_dir().await.unwrap();
        std::fs::write(snap.mem_file_path(), mem).unwrap();
        std::fs::write(snap.snap_file_path(), b"vmstate").unwrap();
        snap
    }

    #[tokio::test]
    async fn test_chunked_upload_writes_recipe_and_chunks() {
        let s = setup(SensitivityMode::None);
        let snap = local_snapshot(s.dir.path(), "rev-1", b"aaaabbbbaaaacc").await;

        let report = s.transfer.upload(&snap).await.unwrap();
        assert_eq!(report.chunks, 4);
        assert_eq!(report.bytes, 14);
        let stored = s
            .storage
            .keys()
            .into_iter()
            .filter(|k| k.starts_with("_chunks/"))
            .count();
        assert_eq!(stored, 3);

        let recipe = Recipe::parse(&s.storage.get("rev-1/recipe_file").unwrap()).unwrap();
        assert_eq!(recipe.len(), 4);
        assert_eq!(recipe.get(0), recipe.get(2));
        assert!(s.storage.get("rev-1/memfile").is_none());
        assert!(s.transfer.exists("rev-1").await.unwrap());

        let info = s.transfer.fetch_info("rev-1").await.unwrap();
        assert_eq!(info.chunk_size, Some(4));
        assert_eq!(info.sensitivity_mode, Some(SensitivityMode::None));
    }

    #[tokio::test]
    async fn test_unchunked_roundtrip() {
        let s = setup(SensitivityMode::None);
        let transfer = s.transfer.clone().with_chunking(false);
        let snap = local_snapshot(s.dir.path(), "rev-1", b"whole memory").await;
        transfer.upload(&snap).await.unwrap();
        assert_eq!(s.storage.get("rev-1/memfile").unwrap(), b"whole memory");

        let restore_dir = s.dir.path().join("restore");
        std::fs::create_dir(&restore_dir).unwrap();
        let info = transfer.fetch_info("rev-1").await.unwrap();
        let restored = Snapshot::from_info(&restore_dir, &info);
        restored.create_dir().await.unwrap();
        transfer.download_into(&restored, &info).await.unwrap();

        assert_eq!(std::fs::read(restored.mem_file_path()).unwrap(), b"whole memory");
        assert_eq!(std::fs::read(restored.snap_file_path()).unwrap(), b"vmstate");
    }

    #[tokio::test]
    async fn test_chunked_download_reconstructs_memory() {
        let s = setup(SensitivityMode::Full);
        let snap = local_snapshot(s.dir.path(), "rev-1", b"0123456789").await;
        s.transfer.upload(&snap).await.unwrap();
        s.transfer.store().cache().clear().await.unwrap();

        let restore_dir = s.dir.path().join("restore");
        std::fs::create_dir(&restore_dir).unwrap();
        let info = s.transfer.fetch_info("rev-1").await.unwrap();
        let restored = Snapshot::from_info(&restore_dir, &info);
        restored.create_dir().await.unwrap();
        s.transfer.download_into(&restored, &info).await.unwrap();

        assert_eq!(std::fs::read(restored.mem_file_path()).unwrap(), b"0123456789");
    }

    #[tokio::test]
    async fn test_lazy_download_fetches_only_recipe() {
        let s = setup(SensitivityMode::None);
        let snap = local_snapshot(s.dir.path(), "rev-1", b"aaaabbbbcccc").await;
        std::fs::write(snap.ws_file_path(), "1\n2\n").unwrap();
        s.transfer.upload(&snap).await.unwrap();
        s.transfer.upload_ws_file(&snap).await.unwrap();
        s.transfer.store().cache().clear().await.unwrap();

        let restore_dir = s.dir.path().join("restore");
        std::fs::create_dir(&restore_dir).unwrap();
        let info = s.transfer.fetch_info("rev-1").await.unwrap();

        let lazy = s.transfer.clone().with_lazy(true, false);
        let restored = Snapshot::from_info(&restore_dir, &info);
        restored.create_dir().await.unwrap();
        lazy.download_into(&restored, &info).await.unwrap();
        assert!(restored.recipe_file_path().exists());
        assert!(!restored.mem_file_path().exists());
        assert!(s.transfer.store().cache().is_empty());
    }

    #[tokio::test]
    async fn test_lazy_download_pulls_working_set() {
        let s = setup(SensitivityMode::None);
        let mem = vec![1u8; 4096 * 3];
        let snap = local_snapshot(s.dir.path(), "rev-1", &mem).await;
        s.transfer.upload(&snap).await.unwrap();

        // Pages 1 and 2 start chunks 1024 and 2048.
        std::fs::write(snap.ws_file_path(), "1\n2\n").unwrap();
        s.transfer.upload_ws_file(&snap).await.unwrap();
        s.transfer.store().cache().clear().await.unwrap();

        let restore_dir = s.dir.path().join("restore");
        std::fs::create_dir(&restore_dir).unwrap();
        let info = s.transfer.fetch_info("rev-1").await.unwrap();
        let restored = Snapshot::from_info(&restore_dir, &info);
        restored.create_dir().await.unwrap();

        let lazy = s.transfer.clone().with_lazy(true, true);
        lazy.download_into(&restored, &info).await.unwrap();
        assert!(restored.ws_file_path().exists());
        assert!(s.transfer.store().cache().contains(&ChunkHash::of(&[1u8; 4])));
    }

    #[tokio::test]
    async fn test_chunk_size_mismatch_is_rejected() {
        let s = setup(SensitivityMode::None);
        let snap = local_snapshot(s.dir.path(), "rev-1", b"aaaabbbb").await;
        s.transfer.upload(&snap).await.unwrap();

        let mut info = s.transfer.fetch_info("rev-1").await.unwrap();
        info.chunk_size = Some(8);
        let restore_dir = s.dir.path().join("restore");
        std::fs::create_dir(&restore_dir).unwrap();
        let restored = Snapshot::from_info(&restore_dir, &info);
        restored.create_dir().await.unwrap();

        let result = s.transfer.download_into(&restored, &info).await;
        assert!(matches!(result, Err(SnapshotError::InvalidRecipe(_))));
    }

    #[tokio::test]
    async fn test_missing_snapshot() {
        let s = setup(SensitivityMode::None);
        assert!(!s.transfer.exists("nope").await.unwrap());
        assert!(matches!(
            s.transfer.fetch_info("nope").await,
            Err(SnapshotError::NotFound(_))
        ));
    }
}
