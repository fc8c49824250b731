//! Snapshot registry backed by the shared chunk store.
//!
//! Snapshots created on this host are uploaded as deduplicated chunks;
//! snapshots created elsewhere are downloaded and reassembled on demand.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use snapcache_core::config::{SensitivityMode, SnapshotConfig};
use snapcache_core::error::{Result, SnapshotError};
use snapcache_core::event::{EventEmitter, SnapshotEventKind};
use snapcache_core::storage::{snapshot_object_key, ObjectStorage, CHUNK_PREFIX};

use super::handle::{Snapshot, SnapshotInfo, INFO_FILE, RECIPE_FILE};
use super::transfer::{SnapshotTransfer, UploadReport};
use super::SnapshotManager;
use crate::cache::LocalChunkCache;
use crate::chunk::{ChunkStore, Recipe};
use crate::fs::remove_dir_if_exists;
use crate::sensitivity::{
    Classifier, NoReferences, RecodeReport, Recoder, ReferenceChunkSet, SensitivityPolicy,
};

/// Revision of the snapshot every function boots from.
pub const BASE_REVISION: &str = "base";

struct Record {
    snapshot: Snapshot,
    ready: bool,
}

/// Registry of local snapshots with upload to and download from the
/// shared store.
pub struct ChunkedSnapshotManager {
    config: SnapshotConfig,
    store: ChunkStore,
    transfer: SnapshotTransfer,
    references: Option<Arc<ReferenceChunkSet>>,
    snapshots: Mutex<HashMap<String, Record>>,
    events: EventEmitter,
}

impl ChunkedSnapshotManager {
    /// Build a manager from `config`.
    ///
    /// In `partial` mode, reference chunks are loaded from `images_dir`.
    /// With `skip_cleanup`, snapshots and chunks left in `base_dir` are
    /// recovered; otherwise `base_dir` is wiped.
    pub async fn new(config: SnapshotConfig, storage: Arc<dyn ObjectStorage>) -> Result<Self> {
        config.validate()?;

        let references = if config.sensitivity_mode == SensitivityMode::Partial {
            let set = Arc::new(ReferenceChunkSet::new(config.chunk_size)?);
            if let Some(dir) = &config.images_dir {
                set.load_images_dir(dir).await?;
            }
            Some(set)
        } else {
            None
        };
        let policy = match &references {
            Some(set) => Arc::clone(set) as Arc<dyn SensitivityPolicy>,
            None => Arc::new(NoReferences) as Arc<dyn SensitivityPolicy>,
        };

        Self::build(config, storage, policy, references).await
    }

    /// Build a manager with a custom `partial`-mode policy.
    pub async fn with_policy(
        config: SnapshotConfig,
        storage: Arc<dyn ObjectStorage>,
        policy: Arc<dyn SensitivityPolicy>,
    ) -> Result<Self> {
        config.validate()?;
        Self::build(config, storage, policy, None).await
    }

    async fn build(
        config: SnapshotConfig,
        storage: Arc<dyn ObjectStorage>,
        policy: Arc<dyn SensitivityPolicy>,
        references: Option<Arc<ReferenceChunkSet>>,
    ) -> Result<Self> {
        if !config.skip_cleanup {
            remove_dir_if_exists(&config.base_dir).await?;
        }
        tokio::fs::create_dir_all(&config.base_dir).await.map_err(|e| {
            SnapshotError::Io(format!(
                "Failed to create snapshot directory {}: {}",
                config.base_dir.display(),
                e
            ))
        })?;

        let events = EventEmitter::default();
        let cache = LocalChunkCache::new(
            &config.chunk_dir(),
            storage,
            config.cache_size,
            config.threads,
        )?
        .with_events(events.clone())
        .with_access_history(config.access_history_len);

        let store = ChunkStore::from_config(&config, Arc::new(cache))?;
        let classifier = Classifier::new(config.sensitivity_mode, policy);
        let transfer = SnapshotTransfer::from_config(&config, store.clone(), classifier);

        tracing::info!(
            base_dir = %config.base_dir.display(),
            chunking = config.chunking,
            chunk_size = config.chunk_size,
            mode = %config.sensitivity_mode,
            lazy = config.lazy,
            "Chunked snapshot manager ready"
        );

        let manager = Self {
            config,
            store,
            transfer,
            references,
            snapshots: Mutex::new(HashMap::new()),
            events,
        };
        if manager.config.skip_cleanup {
            manager.recover_snapshots().await?;
        }
        Ok(manager)
    }

    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    pub fn base_dir(&self) -> &Path {
        &self.config.base_dir
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    pub fn cache(&self) -> &Arc<LocalChunkCache> {
        self.store.cache()
    }

    pub fn transfer(&self) -> &SnapshotTransfer {
        &self.transfer
    }

    pub fn references(&self) -> Option<&Arc<ReferenceChunkSet>> {
        self.references.as_ref()
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.snapshots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a snapshot in `creating` state and create its directory.
    pub async fn init_snapshot(
        &self,
        revision: &str,
        image: &str,
        mem_size_mib: u32,
        vcpu_count: u32,
        sparse: bool,
    ) -> Result<Snapshot> {
        let snapshot = Snapshot::new(
            revision,
            &self.config.base_dir,
            image,
            mem_size_mib,
            vcpu_count,
            sparse,
        );
        self.register(snapshot).await
    }

    /// Persist the snapshot's metadata and mark it ready.
    pub async fn commit_snapshot(&self, revision: &str) -> Result<()> {
        let snapshot = self.creating(revision)?;
        let mut info = snapshot.info();
        if self.config.chunking {
            info.chunk_size = Some(self.config.chunk_size);
            info.sensitivity_mode = Some(self.config.sensitivity_mode);
        }
        snapshot.write_info(&info).await?;
        self.mark_ready(revision)
    }

    pub fn acquire_snapshot(&self, revision: &str) -> Result<Snapshot> {
        let snapshots = self.snapshots.lock();
        let record = snapshots
            .get(revision)
            .ok_or_else(|| SnapshotError::NotFound(format!("snapshot {}", revision)))?;
        if !record.ready {
            return Err(SnapshotError::NotUsable(format!(
                "snapshot {} is still being created",
                revision
            )));
        }
        Ok(record.snapshot.clone())
    }

    /// Forget a snapshot and remove its directory.
    pub async fn delete_snapshot(&self, revision: &str) -> Result<()> {
        let record = self
            .snapshots
            .lock()
            .remove(revision)
            .ok_or_else(|| SnapshotError::NotFound(format!("snapshot {}", revision)))?;
        record.snapshot.cleanup().await?;

        tracing::info!(revision, "Snapshot deleted");
        self.events.emit(SnapshotEventKind::Deleted {
            revision: revision.to_string(),
        });
        Ok(())
    }

    /// Upload a ready snapshot to the shared store.
    pub async fn upload_snapshot(&self, revision: &str) -> Result<UploadReport> {
        let snapshot = self.acquire_snapshot(revision)?;
        let report = self.transfer.upload(&snapshot).await?;
        self.events.emit(SnapshotEventKind::Uploaded {
            revision: revision.to_string(),
            chunks: report.chunks,
            uploaded: report.uploaded,
        });
        Ok(report)
    }

    /// Upload the working set recorded for a ready snapshot.
    pub async fn upload_ws_file(&self, revision: &str) -> Result<()> {
        let snapshot = self.acquire_snapshot(revision)?;
        self.transfer.upload_ws_file(&snapshot).await
    }

    /// Fetch a snapshot from the shared store and register it as ready.
    ///
    /// A failed download leaves nothing behind.
    pub async fn download_snapshot(&self, revision: &str) -> Result<Snapshot> {
        let info = self.transfer.fetch_info(revision).await?;
        let snapshot = self
            .register(Snapshot::from_info(&self.config.base_dir, &info))
            .await?;

        if let Err(e) = self.transfer.download_into(&snapshot, &info).await {
            tracing::warn!(revision, error = %e, "Snapshot download failed");
            if let Err(cleanup) = self.delete_snapshot(revision).await {
                tracing::warn!(revision, error = %cleanup, "Failed to discard partial snapshot");
            }
            return Err(e);
        }

        self.mark_ready(revision)?;
        self.events.emit(SnapshotEventKind::Downloaded {
            revision: revision.to_string(),
        });
        Ok(snapshot)
    }

    /// Whether the shared store holds a restorable snapshot of `revision`.
    pub async fn snapshot_exists(&self, revision: &str) -> Result<bool> {
        self.transfer.exists(revision).await
    }

    /// Re-register snapshot directories and cached chunks found in
    /// `base_dir`. Returns `(snapshots, chunks)` recovered.
    ///
    /// Directories without a readable `info_file` are skipped.
    pub async fn recover_snapshots(&self) -> Result<(usize, usize)> {
        let base_dir = &self.config.base_dir;
        let mut entries = match tokio::fs::read_dir(base_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((0, 0)),
            Err(e) => {
                return Err(SnapshotError::Io(format!(
                    "Failed to read {}: {}",
                    base_dir.display(),
                    e
                )))
            }
        };

        let mut recovered = 0;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == CHUNK_PREFIX || name.starts_with('.') || !entry.file_type().await?.is_dir() {
                continue;
            }

            let info = match SnapshotInfo::load(&entry.path().join(INFO_FILE)).await {
                Ok(info) if info.id == name => info,
                Ok(info) => {
                    tracing::warn!(dir = %name, id = %info.id, "Skipping snapshot with mismatched id");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(dir = %name, error = %e, "Skipping directory without snapshot info");
                    continue;
                }
            };

            let snapshot = Snapshot::from_info(base_dir, &info);
            self.snapshots
                .lock()
                .insert(name.clone(), Record { snapshot, ready: true });
            recovered += 1;
            tracing::debug!(revision = %name, "Recovered snapshot");
        }

        let chunks = self.cache().recover().await?;
        tracing::info!(snapshots = recovered, chunks, "Recovered snapshot state");
        Ok((recovered, chunks))
    }

    /// Drop every locally cached chunk.
    pub async fn clean_chunks(&self) -> Result<()> {
        self.cache().clear().await
    }

    /// Mark every chunk of the base snapshot's memory as shareable.
    ///
    /// Needs the base snapshot registered locally with a recipe. Returns
    /// the number of distinct base chunks known afterwards.
    pub async fn prepare_base_snapshot_chunks(&self) -> Result<usize> {
        let Some(references) = &self.references else {
            return Ok(0);
        };
        if !self.config.chunking {
            return Ok(0);
        }

        let base = self.acquire_snapshot(BASE_REVISION)?;
        let recipe = Recipe::load(&base.recipe_file_path()).await?;
        let count = references.load_base_recipe(&recipe);

        tracing::debug!(chunks = count, "Loaded base snapshot chunks");
        Ok(count)
    }

    /// Migrate a stored snapshot's recipe to `new_mode`.
    ///
    /// Rewritten recipes and metadata are uploaded only if a slot changed.
    pub async fn recode_remote(
        &self,
        revision: &str,
        new_mode: SensitivityMode,
    ) -> Result<RecodeReport> {
        let mut info = self.transfer.fetch_info(revision).await?;
        if info.chunk_size.is_none() {
            return Err(SnapshotError::InvalidRecipe(format!(
                "snapshot {} is not chunked",
                revision
            )));
        }
        let old_mode = info.sensitivity_mode.unwrap_or_default();

        let storage = self.cache().storage();
        let recipe_key = snapshot_object_key(revision, RECIPE_FILE);
        let mut recipe = Recipe::parse(&storage.download_object(&recipe_key).await?)?;

        let recoder = Recoder::new(self.store.clone(), self.transfer.classifier().clone());
        let report = recoder
            .recode(&mut recipe, old_mode, new_mode, revision, &info.image)
            .await?;

        if report.modified() || old_mode != new_mode {
            storage.upload_object(&recipe_key, recipe.to_bytes()).await?;
            info.sensitivity_mode = Some(new_mode);
            storage
                .upload_object(&snapshot_object_key(revision, INFO_FILE), info.to_vec()?)
                .await?;
            self.events.emit(SnapshotEventKind::Recoded {
                revision: revision.to_string(),
                from: old_mode,
                to: new_mode,
                rewritten: report.rewritten,
            });
        }

        tracing::info!(
            revision,
            from = %old_mode,
            to = %new_mode,
            rewritten = report.rewritten,
            "Recoded stored snapshot"
        );
        Ok(report)
    }

    async fn register(&self, snapshot: Snapshot) -> Result<Snapshot> {
        let revision = snapshot.id().to_string();
        {
            let mut snapshots = self.snapshots.lock();
            if let Some(existing) = snapshots.get(&revision) {
                return Err(SnapshotError::AlreadyExists(format!(
                    "snapshot {} ({})",
                    revision,
                    if existing.ready { "ready" } else { "creating" }
                )));
            }
            snapshots.insert(
                revision.clone(),
                Record {
                    snapshot: snapshot.clone(),
                    ready: false,
                },
            );
        }

        if let Err(e) = snapshot.create_dir().await {
            self.snapshots.lock().remove(&revision);
            return Err(e);
        }

        tracing::debug!(revision = %revision, image = snapshot.image(), "Snapshot creating");
        self.events.emit(SnapshotEventKind::Creating { revision });
        Ok(snapshot)
    }

    fn creating(&self, revision: &str) -> Result<Snapshot> {
        let snapshots = self.snapshots.lock();
        let record = snapshots
            .get(revision)
            .ok_or_else(|| SnapshotError::NotFound(format!("snapshot {}", revision)))?;
        if record.ready {
            return Err(SnapshotError::AlreadyExists(format!(
                "snapshot {} already committed",
                revision
            )));
        }
        Ok(record.snapshot.clone())
    }

    fn mark_ready(&self, revision: &str) -> Result<()> {
        let mut snapshots = self.snapshots.lock();
        let record = snapshots
            .get_mut(revision)
            .ok_or_else(|| SnapshotError::NotFound(format!("snapshot {}", revision)))?;
        if record.ready {
            return Err(SnapshotError::AlreadyExists(format!(
                "snapshot {} already committed",
                revision
            )));
        }
        record.ready = true;

        tracing::info!(revision, "Snapshot committed");
        self.events.emit(SnapshotEventKind::Committed {
            revision: revision.to_string(),
        });
        Ok(())
    }
}

#[async_trait]
impl SnapshotManager for ChunkedSnapshotManager {
    async fn init(
        &self,
        id: &str,
        image: &str,
        _cold_start_ms: i64,
        mem_size_mib: u32,
        vcpu_count: u32,
        sparse: bool,
    ) -> Result<(Vec<String>, Snapshot)> {
        let snapshot = self
            .init_snapshot(id, image, mem_size_mib, vcpu_count, sparse)
            .await?;
        Ok((Vec::new(), snapshot))
    }

    async fn commit(&self, id: &str) -> Result<()> {
        self.commit_snapshot(id).await
    }

    fn acquire(&self, key: &str) -> Result<Snapshot> {
        self.acquire_snapshot(key)
    }

    /// Ready snapshots are shared read-only; release only checks the
    /// revision is known.
    fn release(&self, key: &str) -> Result<()> {
        self.acquire_snapshot(key).map(|_| ())
    }
}
