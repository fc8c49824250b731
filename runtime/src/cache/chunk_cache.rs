//! Local on-disk chunk cache in front of the shared object store.
//!
//! Chunks live under `<cache_dir>/<first two hex chars>/<hex>`. The cache is
//! bounded by a byte budget and evicts least-recently-used chunks. Remote
//! fetches run on a bounded worker pool and concurrent requests for the same
//! missing chunk share a single fetch.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;

use snapcache_core::error::{Result, SnapshotError};
use snapcache_core::event::{EventEmitter, SnapshotEventKind};
use snapcache_core::hash::ChunkHash;
use snapcache_core::storage::ObjectStorage;

use super::lru::LruIndex;
use crate::fs::{atomic_write, remove_file_if_exists};
use crate::metrics::CacheMetrics;

/// Lookup counters for one chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkAccessStats {
    pub calls: u64,
    pub hits: u64,
}

/// Whether a history record is a lookup or an eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessKind {
    Access,
    Evict,
}

impl AccessKind {
    /// `+` for a lookup, `-` for an eviction.
    pub fn sign(self) -> char {
        match self {
            Self::Access => '+',
            Self::Evict => '-',
        }
    }
}

/// One chunk history record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRecord {
    pub at: DateTime<Utc>,
    pub kind: AccessKind,
    pub hash: ChunkHash,
}

/// Most recent records, oldest dropped first.
struct AccessHistory {
    limit: usize,
    records: VecDeque<AccessRecord>,
}

impl AccessHistory {
    fn push(&mut self, kind: AccessKind, hash: ChunkHash) {
        if self.records.len() == self.limit {
            self.records.pop_front();
        }
        self.records.push_back(AccessRecord {
            at: Utc::now(),
            kind,
            hash,
        });
    }
}

#[derive(Clone)]
enum FetchState {
    Pending,
    Ready(Arc<[u8]>),
    Failed(SnapshotError),
}

enum Role {
    Leader(watch::Sender<FetchState>),
    Follower(watch::Receiver<FetchState>),
}

type InflightMap = Mutex<HashMap<ChunkHash, watch::Receiver<FetchState>>>;

/// Removes the in-flight entry when the leading fetch finishes or is dropped.
struct InflightGuard<'a> {
    inflight: &'a InflightMap,
    hash: ChunkHash,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.inflight.lock().remove(&self.hash);
    }
}

/// Byte-budgeted LRU cache of chunk objects on local disk.
///
/// Cached bytes are the objects exactly as stored remotely (sealed when
/// encryption is on); verification happens in the chunk store.
pub struct LocalChunkCache {
    dir: PathBuf,
    storage: Arc<dyn ObjectStorage>,
    capacity_bytes: u64,
    workers: Arc<Semaphore>,
    threads: usize,
    index: Mutex<LruIndex>,
    inflight: InflightMap,
    stats: DashMap<ChunkHash, ChunkAccessStats>,
    history: Option<Mutex<AccessHistory>>,
    metrics: CacheMetrics,
    events: Option<EventEmitter>,
}

impl LocalChunkCache {
    /// Create a cache rooted at `dir` with a `capacity_bytes` budget and
    /// `threads` concurrent remote fetches.
    pub fn new(
        dir: &Path,
        storage: Arc<dyn ObjectStorage>,
        capacity_bytes: u64,
        threads: usize,
    ) -> Result<Self> {
        if threads == 0 {
            return Err(SnapshotError::Config("threads must be positive".to_string()));
        }
        std::fs::create_dir_all(dir).map_err(|e| {
            SnapshotError::Io(format!(
                "Failed to create chunk cache directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        Ok(Self {
            dir: dir.to_path_buf(),
            storage,
            capacity_bytes,
            workers: Arc::new(Semaphore::new(threads)),
            threads,
            index: Mutex::new(LruIndex::new()),
            inflight: Mutex::new(HashMap::new()),
            stats: DashMap::new(),
            history: None,
            metrics: CacheMetrics::new()?,
            events: None,
        })
    }

    /// Keep the last `limit` lookups and evictions. Zero disables the
    /// history.
    pub fn with_access_history(mut self, limit: usize) -> Self {
        self.history = (limit > 0).then(|| {
            Mutex::new(AccessHistory {
                limit,
                records: VecDeque::with_capacity(limit.min(4096)),
            })
        });
        self
    }

    /// Emit eviction and corruption events.
    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Remote fetch slots currently free.
    pub fn available_workers(&self) -> usize {
        self.workers.available_permits()
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    pub fn storage(&self) -> &Arc<dyn ObjectStorage> {
        &self.storage
    }

    pub fn len(&self) -> usize {
        self.index.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> u64 {
        self.index.lock().total_bytes()
    }

    pub fn contains(&self, hash: &ChunkHash) -> bool {
        self.index.lock().contains(hash)
    }

    /// Lookup counters for `hash`.
    pub fn chunk_stats(&self, hash: &ChunkHash) -> Option<ChunkAccessStats> {
        self.stats.get(hash).map(|s| *s)
    }

    /// Recorded lookups and evictions, oldest first. Empty unless history
    /// is enabled.
    pub fn access_history(&self) -> Vec<AccessRecord> {
        self.history
            .as_ref()
            .map(|h| h.lock().records.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Read a chunk from local disk only.
    pub async fn get(&self, hash: &ChunkHash) -> Result<Option<Arc<[u8]>>> {
        let found = self.read_cached(hash).await?;
        if found.is_some() {
            self.record_access(hash, true);
        }
        Ok(found)
    }

    /// Return a chunk's stored bytes, fetching it from the object store on
    /// a miss.
    ///
    /// Concurrent calls for the same missing chunk issue one remote fetch
    /// and all receive its outcome. If the caller driving that fetch goes
    /// away, a waiting caller takes over.
    pub async fn download_and_return_chunk(&self, hash: &ChunkHash) -> Result<Arc<[u8]>> {
        if let Some(data) = self.read_cached(hash).await? {
            self.record_access(hash, true);
            return Ok(data);
        }
        self.record_access(hash, false);

        loop {
            let role = {
                let mut inflight = self.inflight.lock();
                match inflight.get(hash) {
                    Some(rx) => Role::Follower(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(FetchState::Pending);
                        inflight.insert(*hash, rx);
                        Role::Leader(tx)
                    }
                }
            };

            match role {
                Role::Leader(tx) => {
                    let _guard = InflightGuard {
                        inflight: &self.inflight,
                        hash: *hash,
                    };

                    // A previous leader may have published between our miss and registration.
                    let result = match self.read_cached(hash).await {
                        Ok(Some(data)) => Ok(data),
                        Ok(None) => self.fetch_remote(hash).await,
                        Err(e) => Err(e),
                    };

                    tx.send_replace(match &result {
                        Ok(data) => FetchState::Ready(Arc::clone(data)),
                        Err(e) => FetchState::Failed(e.clone()),
                    });
                    return result;
                }
                Role::Follower(mut rx) => {
                    self.metrics.record_coalesced();
                    let state = match rx
                        .wait_for(|s| !matches!(s, FetchState::Pending))
                        .await
                    {
                        Ok(state) => Some(state.clone()),
                        Err(_) => None,
                    };

                    match state {
                        Some(FetchState::Ready(data)) => return Ok(data),
                        Some(FetchState::Failed(e)) => return Err(e),
                        // Leader dropped without an outcome; retry.
                        _ => continue,
                    }
                }
            }
        }
    }

    /// Start fetching a chunk in the background.
    ///
    /// Completion is observable through later lookups; the handle may be
    /// dropped.
    pub fn download_chunk(self: &Arc<Self>, hash: &ChunkHash) -> JoinHandle<Result<()>> {
        let cache = Arc::clone(self);
        let hash = *hash;
        tokio::spawn(async move {
            cache.download_and_return_chunk(&hash).await.map(|_| ())
        })
    }

    /// Add stored bytes for `hash`, e.g. right after uploading them.
    pub async fn insert(&self, hash: &ChunkHash, data: &[u8]) -> Result<()> {
        if self.contains(hash) {
            return Ok(());
        }
        self.publish(hash, Arc::from(data)).await
    }

    /// Drop a chunk from the cache.
    pub async fn remove(&self, hash: &ChunkHash) -> Result<()> {
        let removed = {
            let mut index = self.index.lock();
            let removed = index.remove(hash).is_some();
            self.metrics.set_cached(index.total_bytes(), index.len());
            removed
        };
        if removed {
            remove_file_if_exists(&hash.shard_path(&self.dir)).await?;
        }
        Ok(())
    }

    /// Drop a chunk that failed verification.
    pub async fn invalidate_corrupt(&self, hash: &ChunkHash) -> Result<()> {
        self.metrics.record_corrupt();
        tracing::warn!(hash = %hash, "Dropping corrupt chunk from local cache");
        if let Some(emitter) = &self.events {
            emitter.emit(SnapshotEventKind::ChunkCorrupt { hash: *hash });
        }
        self.remove(hash).await
    }

    /// Remove every cached chunk and reset counters.
    pub async fn clear(&self) -> Result<()> {
        let dropped = {
            let mut index = self.index.lock();
            let dropped = index.clear();
            self.metrics.set_cached(0, 0);
            dropped.len()
        };
        self.stats.clear();
        if let Some(history) = &self.history {
            history.lock().records.clear();
        }

        crate::fs::remove_dir_if_exists(&self.dir).await?;
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            SnapshotError::Io(format!(
                "Failed to recreate chunk cache directory {}: {}",
                self.dir.display(),
                e
            ))
        })?;

        tracing::info!(dir = %self.dir.display(), dropped, "Cleared chunk cache");
        Ok(())
    }

    /// Index chunks already on disk, e.g. after a restart.
    ///
    /// Leftover temp files from interrupted writes are deleted. Returns the
    /// number of chunks registered.
    pub async fn recover(&self) -> Result<usize> {
        let dir = self.dir.clone();
        let found = tokio::task::spawn_blocking(move || scan_chunk_dir(&dir))
            .await
            .map_err(|e| SnapshotError::Io(format!("Chunk scan task failed: {}", e)))??;

        let count = found.len();
        {
            let mut index = self.index.lock();
            for (hash, size) in found {
                index.insert(hash, size);
            }
        }
        self.enforce_budget().await;

        tracing::info!(dir = %self.dir.display(), chunks = count, "Recovered chunk cache");
        Ok(count)
    }

    async fn read_cached(&self, hash: &ChunkHash) -> Result<Option<Arc<[u8]>>> {
        let present = self.index.lock().touch(hash);
        if !present {
            return Ok(None);
        }

        let path = hash.shard_path(&self.dir);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(Arc::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Evicted between the index lookup and the read.
                let mut index = self.index.lock();
                index.remove(hash);
                self.metrics.set_cached(index.total_bytes(), index.len());
                Ok(None)
            }
            Err(e) => Err(SnapshotError::Io(format!(
                "Failed to read cached chunk {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn fetch_remote(&self, hash: &ChunkHash) -> Result<Arc<[u8]>> {
        let _permit = self
            .workers
            .acquire()
            .await
            .map_err(|_| SnapshotError::Unavailable("chunk worker pool closed".to_string()))?;

        self.metrics.record_remote_fetch();
        let data: Arc<[u8]> = Arc::from(self.storage.download_object(&hash.object_key()).await?);

        tracing::trace!(hash = %hash, size = data.len(), "Fetched chunk");
        self.publish(hash, Arc::clone(&data)).await?;
        Ok(data)
    }

    /// Write the chunk file atomically, then index it.
    async fn publish(&self, hash: &ChunkHash, data: Arc<[u8]>) -> Result<()> {
        let path = hash.shard_path(&self.dir);
        let size = data.len() as u64;
        let display = path.display().to_string();

        tokio::task::spawn_blocking(move || atomic_write(&path, &data))
            .await
            .map_err(|e| SnapshotError::Io(format!("Write task for {} failed: {}", display, e)))?
            .map_err(|e| SnapshotError::Io(format!("Failed to cache chunk {}: {}", display, e)))?;

        self.index.lock().insert(*hash, size);
        self.enforce_budget().await;
        Ok(())
    }

    async fn enforce_budget(&self) {
        let victims = {
            let mut index = self.index.lock();
            let victims = index.evict_to(self.capacity_bytes);
            self.metrics.set_cached(index.total_bytes(), index.len());
            victims
        };
        if victims.is_empty() {
            return;
        }

        self.metrics.record_evictions(victims.len() as u64);
        if let Some(history) = &self.history {
            let mut history = history.lock();
            for hash in &victims {
                history.push(AccessKind::Evict, *hash);
            }
        }
        for hash in &victims {
            if let Err(e) = remove_file_if_exists(&hash.shard_path(&self.dir)).await {
                tracing::warn!(hash = %hash, error = %e, "Failed to delete evicted chunk");
            }
        }

        tracing::debug!(evicted = victims.len(), "Evicted chunks from local cache");
        if let Some(emitter) = &self.events {
            emitter.emit(SnapshotEventKind::ChunksEvicted { hashes: victims });
        }
    }

    fn record_access(&self, hash: &ChunkHash, hit: bool) {
        if hit {
            self.metrics.record_hit();
        } else {
            self.metrics.record_miss();
        }

        let mut stats = self.stats.entry(*hash).or_default();
        stats.calls += 1;
        if hit {
            stats.hits += 1;
        }
        drop(stats);

        if let Some(history) = &self.history {
            history.lock().push(AccessKind::Access, *hash);
        }
    }
}

/// Walk the shard directories and collect `(hash, size)` for every chunk.
fn scan_chunk_dir(dir: &Path) -> Result<Vec<(ChunkHash, u64)>> {
    let mut found = Vec::new();
    let read_dir = |path: &Path| {
        std::fs::read_dir(path).map_err(|e| {
            SnapshotError::Io(format!("Failed to read {}: {}", path.display(), e))
        })
    };

    for shard in read_dir(dir)? {
        let shard = shard?;
        if !shard.file_type()?.is_dir() {
            continue;
        }
        for entry in read_dir(&shard.path())? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            match name.parse::<ChunkHash>() {
                Ok(hash) => found.push((hash, entry.metadata()?.len())),
                Err(_) => {
                    // Interrupted atomic write.
                    let _ = std::fs::remove_file(entry.path());
                }
            }
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapcache_core::storage::MemoryObjectStorage;
    use std::time::Duration;
    use tempfile::TempDir;

    fn setup(capacity: u64, threads: usize) -> (TempDir, Arc<MemoryObjectStorage>, Arc<LocalChunkCache>) {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(MemoryObjectStorage::new());
        let cache = LocalChunkCache::new(
            &dir.path().join("_chunks"),
            storage.clone() as Arc<dyn ObjectStorage>,
            capacity,
            threads,
        )
        .unwrap();
        (dir, storage, Arc::new(cache))
    }

    fn remote_chunk(storage: &MemoryObjectStorage, data: &[u8]) -> ChunkHash {
        let hash = ChunkHash::of(data);
        storage.put(&hash.object_key(), data.to_vec());
        hash
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let (_dir, storage, cache) = setup(1 << 20, 4);
        let hash = remote_chunk(&storage, b"page one");

        let data = cache.download_and_return_chunk(&hash).await.unwrap();
        assert_eq!(&*data, b"page one");
        assert!(cache.contains(&hash));
        assert!(hash.shard_path(cache.dir()).is_file());

        let again = cache.download_and_return_chunk(&hash).await.unwrap();
        assert_eq!(&*again, b"page one");
        assert_eq!(storage.download_count(), 1);

        let stats = cache.chunk_stats(&hash).unwrap();
        assert_eq!(stats, ChunkAccessStats { calls: 2, hits: 1 });
        let metrics = cache.metrics().snapshot();
        assert_eq!(metrics.hits, 1);
        assert_eq!(metrics.misses, 1);
    }

    #[tokio::test]
    async fn test_missing_remote_is_not_found() {
        let (_dir, _storage, cache) = setup(1 << 20, 4);
        let hash = ChunkHash::of(b"absent");
        let result = cache.download_and_return_chunk(&hash).await;
        assert!(matches!(result, Err(SnapshotError::NotFound(_))));
        assert!(!cache.contains(&hash));
    }

    #[tokio::test]
    async fn test_concurrent_requests_coalesce() {
        let (_dir, storage, cache) = setup(1 << 20, 4);
        storage.set_latency(Duration::from_millis(100));
        let hash = remote_chunk(&storage, b"shared page");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache.download_and_return_chunk(&hash).await
            }));
        }
        for handle in handles {
            let data = handle.await.unwrap().unwrap();
            assert_eq!(&*data, b"shared page");
        }

        assert_eq!(storage.download_count(), 1);
        assert_eq!(cache.metrics().snapshot().remote_fetches, 1);
    }

    #[tokio::test]
    async fn test_failure_fans_out_to_waiters() {
        let (_dir, storage, cache) = setup(1 << 20, 4);
        storage.set_latency(Duration::from_millis(50));
        let hash = ChunkHash::of(b"never uploaded");

        let a = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.download_and_return_chunk(&hash).await })
        };
        let b = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.download_and_return_chunk(&hash).await })
        };

        assert!(matches!(a.await.unwrap(), Err(SnapshotError::NotFound(_))));
        assert!(matches!(b.await.unwrap(), Err(SnapshotError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_cancelled_leader_hands_over() {
        let (_dir, storage, cache) = setup(1 << 20, 4);
        storage.set_latency(Duration::from_millis(200));
        let hash = remote_chunk(&storage, b"slow page");

        let leader = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.download_and_return_chunk(&hash).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let follower = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.download_and_return_chunk(&hash).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        leader.abort();

        let data = follower.await.unwrap().unwrap();
        assert_eq!(&*data, b"slow page");
    }

    #[tokio::test]
    async fn test_evicts_least_recently_used() {
        let (_dir, storage, cache) = setup(100, 2);
        let a = remote_chunk(&storage, &[1u8; 40]);
        let b = remote_chunk(&storage, &[2u8; 40]);
        let c = remote_chunk(&storage, &[3u8; 40]);

        cache.download_and_return_chunk(&a).await.unwrap();
        cache.download_and_return_chunk(&b).await.unwrap();
        cache.download_and_return_chunk(&a).await.unwrap();
        cache.download_and_return_chunk(&c).await.unwrap();

        assert!(cache.contains(&a));
        assert!(!cache.contains(&b));
        assert!(cache.contains(&c));
        assert!(!b.shard_path(cache.dir()).exists());
        assert!(cache.total_bytes() <= 100);
        assert_eq!(cache.metrics().snapshot().evictions, 1);
    }

    #[tokio::test]
    async fn test_worker_pool_bounds_fetches() {
        let (_dir, storage, cache) = setup(1 << 20, 2);
        storage.set_latency(Duration::from_millis(100));
        let hashes: Vec<_> = (0..4u8).map(|n| remote_chunk(&storage, &[n; 8])).collect();

        let mut handles = Vec::new();
        for hash in &hashes {
            let cache = Arc::clone(&cache);
            let hash = *hash;
            handles.push(tokio::spawn(async move {
                cache.download_and_return_chunk(&hash).await
            }));
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.available_workers(), 0);

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(cache.available_workers(), 2);
        assert_eq!(storage.download_count(), 4);
    }

    #[tokio::test]
    async fn test_download_chunk_in_background() {
        let (_dir, storage, cache) = setup(1 << 20, 2);
        let hash = remote_chunk(&storage, b"prefetched");

        cache.download_chunk(&hash).await.unwrap().unwrap();
        assert!(cache.contains(&hash));
        assert_eq!(&*cache.get(&hash).await.unwrap().unwrap(), b"prefetched");
    }

    #[tokio::test]
    async fn test_insert_and_remove() {
        let (_dir, storage, cache) = setup(1 << 20, 2);
        let hash = ChunkHash::of(b"local");

        cache.insert(&hash, b"local").await.unwrap();
        assert_eq!(&*cache.download_and_return_chunk(&hash).await.unwrap(), b"local");
        assert_eq!(storage.download_count(), 0);

        cache.remove(&hash).await.unwrap();
        assert!(!cache.contains(&hash));
        assert!(!hash.shard_path(cache.dir()).exists());
    }

    #[tokio::test]
    async fn test_recover_indexes_existing_files() {
        let (dir, storage, cache) = setup(1 << 20, 2);
        let a = ChunkHash::of(b"a");
        cache.insert(&a, b"a").await.unwrap();
        std::fs::write(cache.dir().join(&a.to_hex()[..2]).join(".tmpXYZ"), b"junk").unwrap();
        drop(cache);

        let reopened = LocalChunkCache::new(
            &dir.path().join("_chunks"),
            storage as Arc<dyn ObjectStorage>,
            1 << 20,
            2,
        )
        .unwrap();
        assert_eq!(reopened.recover().await.unwrap(), 1);
        assert!(reopened.contains(&a));
        assert!(!reopened.dir().join(&a.to_hex()[..2]).join(".tmpXYZ").exists());
    }

    #[tokio::test]
    async fn test_file_deleted_behind_index_is_refetched() {
        let (_dir, storage, cache) = setup(1 << 20, 2);
        let hash = remote_chunk(&storage, b"fragile");
        cache.download_and_return_chunk(&hash).await.unwrap();
        std::fs::remove_file(hash.shard_path(cache.dir())).unwrap();

        let data = cache.download_and_return_chunk(&hash).await.unwrap();
        assert_eq!(&*data, b"fragile");
        assert_eq!(storage.download_count(), 2);
    }

    #[tokio::test]
    async fn test_clear() {
        let (_dir, storage, cache) = setup(1 << 20, 2);
        let hash = remote_chunk(&storage, b"x");
        cache.download_and_return_chunk(&hash).await.unwrap();

        cache.clear().await.unwrap();
        assert!(cache.is_empty());
        assert!(cache.dir().is_dir());
        assert!(cache.chunk_stats(&hash).is_none());
    }

    #[tokio::test]
    async fn test_access_history() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(MemoryObjectStorage::new());
        let cache = LocalChunkCache::new(
            dir.path(),
            storage.clone() as Arc<dyn ObjectStorage>,
            1 << 20,
            2,
        )
        .unwrap()
        .with_access_history(16);
        let hash = remote_chunk(&storage, b"h");

        cache.download_and_return_chunk(&hash).await.unwrap();
        cache.download_and_return_chunk(&hash).await.unwrap();

        let history = cache.access_history();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|r| r.kind == AccessKind::Access && r.hash == hash));
        assert_eq!(history[0].kind.sign(), '+');
    }

    #[tokio::test]
    async fn test_access_history_records_evictions_and_is_bounded() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(MemoryObjectStorage::new());
        let cache = LocalChunkCache::new(
            dir.path(),
            storage.clone() as Arc<dyn ObjectStorage>,
            8,
            2,
        )
        .unwrap()
        .with_access_history(3);
        let first = remote_chunk(&storage, b"aaaaaa");
        let second = remote_chunk(&storage, b"bbbbbb");

        cache.download_and_return_chunk(&first).await.unwrap();
        cache.download_and_return_chunk(&second).await.unwrap();

        let history = cache.access_history();
        let kinds: Vec<_> = history.iter().map(|r| (r.kind, r.hash)).collect();
        assert_eq!(
            kinds,
            vec![
                (AccessKind::Access, first),
                (AccessKind::Access, second),
                (AccessKind::Evict, first),
            ]
        );

        cache.download_and_return_chunk(&second).await.unwrap();
        let history = cache.access_history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].hash, second);
        assert_eq!(history[2].kind, AccessKind::Access);
    }

    #[tokio::test]
    async fn test_zero_length_history_is_disabled() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(MemoryObjectStorage::new());
        let cache = LocalChunkCache::new(
            dir.path(),
            storage.clone() as Arc<dyn ObjectStorage>,
            1 << 20,
            2,
        )
        .unwrap()
        .with_access_history(0);
        let hash = remote_chunk(&storage, b"h");
        cache.download_and_return_chunk(&hash).await.unwrap();
        assert!(cache.access_history().is_empty());
    }
}
