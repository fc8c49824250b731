//! Content-addressed chunk store over the shared object store.

use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinHandle, JoinSet};

use snapcache_core::config::SnapshotConfig;
use snapcache_core::error::{Result, SnapshotError};
use snapcache_core::hash::ChunkHash;
use snapcache_core::storage::ObjectStorage;

use super::chunker::{ChunkSpan, Chunker};
use super::cipher::ChunkCipher;
use super::recipe::Recipe;
use crate::cache::LocalChunkCache;

/// Uploads, downloads, and reassembles chunks.
///
/// Downloads go through the local chunk cache and are verified against
/// the requested hash, either directly or as a hash remapped with the
/// caller's snapshot identity.
#[derive(Clone)]
pub struct ChunkStore {
    storage: Arc<dyn ObjectStorage>,
    cache: Arc<LocalChunkCache>,
    cipher: Option<Arc<ChunkCipher>>,
    chunker: Chunker,
    threads: usize,
    timeout: Option<Duration>,
}

impl ChunkStore {
    pub fn new(cache: Arc<LocalChunkCache>, chunk_size: u64) -> Result<Self> {
        Ok(Self {
            storage: Arc::clone(cache.storage()),
            threads: cache.threads(),
            cache,
            cipher: None,
            chunker: Chunker::new(chunk_size)?,
            timeout: None,
        })
    }

    /// Build a store with the sealing and deadline settings of `config`.
    pub fn from_config(config: &SnapshotConfig, cache: Arc<LocalChunkCache>) -> Result<Self> {
        let mut store = Self::new(cache, config.chunk_size)?;
        if config.encryption {
            let secret = config
                .encryption_key
                .as_deref()
                .ok_or_else(|| SnapshotError::Config("encryption requires encryption_key".to_string()))?;
            store = store.with_cipher(ChunkCipher::new(secret.as_bytes())?);
        }
        if let Some(timeout) = config.download_timeout() {
            store = store.with_timeout(timeout);
        }
        Ok(store)
    }

    /// Seal chunks before upload and open them after download.
    pub fn with_cipher(mut self, cipher: ChunkCipher) -> Self {
        self.cipher = Some(Arc::new(cipher));
        self
    }

    /// Fail a single chunk download with `Timeout` after `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn chunker(&self) -> &Chunker {
        &self.chunker
    }

    pub fn chunk_size(&self) -> usize {
        self.chunker.chunk_size()
    }

    pub fn cache(&self) -> &Arc<LocalChunkCache> {
        &self.cache
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Split a file into chunks and hash them.
    pub async fn chunk(&self, path: &Path) -> Result<Vec<ChunkSpan>> {
        self.chunker.chunk_file(path).await
    }

    /// Whether `hash` is available locally or in the shared store.
    pub async fn exists(&self, hash: &ChunkHash) -> Result<bool> {
        if self.cache.contains(hash) {
            return Ok(true);
        }
        self.storage.exists(&hash.object_key()).await
    }

    /// Store a chunk under `hash` unless it is already present.
    ///
    /// Returns whether a new object was written.
    pub async fn upload(&self, hash: &ChunkHash, data: &[u8]) -> Result<bool> {
        if self.exists(hash).await? {
            return Ok(false);
        }

        let stored = match &self.cipher {
            Some(cipher) => cipher.seal(hash, data)?,
            None => data.to_vec(),
        };
        self.storage
            .upload_object(&hash.object_key(), stored.clone())
            .await?;
        self.cache.insert(hash, &stored).await?;

        tracing::trace!(hash = %hash, size = data.len(), "Uploaded chunk");
        Ok(true)
    }

    /// Fetch and verify the chunk stored under `hash`.
    ///
    /// `identity` is the snapshot the chunk belongs to; it is needed to
    /// verify chunks stored under a remapped hash. A cached copy that fails
    /// verification is only evicted if it differs from the shared store's.
    pub async fn download(&self, hash: &ChunkHash, identity: &str) -> Result<Arc<[u8]>> {
        let fetch = self.cache.download_and_return_chunk(hash);
        let stored = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, fetch).await.map_err(|_| {
                SnapshotError::Timeout(format!("chunk {} not fetched within {:?}", hash, timeout))
            })??,
            None => fetch.await?,
        };

        match self.verify(hash, identity, &stored) {
            Ok(data) => Ok(data),
            Err(e) => self.recheck_against_remote(hash, identity, &stored, e).await,
        }
    }

    /// Open stored bytes and check them against `hash`.
    fn verify(&self, hash: &ChunkHash, identity: &str, stored: &Arc<[u8]>) -> Result<Arc<[u8]>> {
        let data: Arc<[u8]> = match &self.cipher {
            Some(cipher) => Arc::from(cipher.open(hash, stored)?),
            None => Arc::clone(stored),
        };
        if !hash.matches(&data, identity) {
            return Err(SnapshotError::Corrupt {
                hash: hash.to_hex(),
                message: format!("content does not match hash for identity '{}'", identity),
            });
        }
        Ok(data)
    }

    /// Handle a cached chunk that failed verification.
    ///
    /// Identical bytes in the shared store mean the local copy is intact
    /// (usually a request under the wrong identity) and the error stands.
    /// Otherwise the local copy is damaged and is replaced by the remote one.
    async fn recheck_against_remote(
        &self,
        hash: &ChunkHash,
        identity: &str,
        stored: &[u8],
        err: SnapshotError,
    ) -> Result<Arc<[u8]>> {
        let remote = self.storage.download_object(&hash.object_key()).await?;
        if remote.as_slice() == stored {
            tracing::debug!(hash = %hash, identity, error = %err, "Chunk failed verification");
            return Err(err);
        }

        self.cache.invalidate_corrupt(hash).await?;
        let remote: Arc<[u8]> = Arc::from(remote);
        let data = self.verify(hash, identity, &remote)?;
        self.cache.insert(hash, &remote).await?;
        tracing::info!(hash = %hash, "Replaced damaged cached chunk");
        Ok(data)
    }

    /// Start fetching a chunk into the local cache without waiting.
    pub fn prefetch(&self, hash: &ChunkHash) -> JoinHandle<Result<()>> {
        self.cache.download_chunk(hash)
    }

    /// Reassemble the bytes a recipe describes.
    pub async fn reconstruct(&self, recipe: &Recipe, identity: &str) -> Result<Vec<u8>> {
        let mut parts: Vec<Option<Arc<[u8]>>> = vec![None; recipe.len()];
        self.fetch_ordered(recipe, identity, |idx, data| {
            parts[idx] = Some(data);
            Ok(())
        })
        .await?;

        let mut out = Vec::with_capacity(recipe.len() * self.chunk_size());
        for part in parts.into_iter().flatten() {
            out.extend_from_slice(&part);
        }
        Ok(out)
    }

    /// Reassemble a recipe into `path`.
    ///
    /// The file appears only once every chunk is written; on failure no
    /// partial file is left behind. Returns the number of bytes written.
    pub async fn reconstruct_to_file(
        &self,
        recipe: &Recipe,
        identity: &str,
        path: &Path,
    ) -> Result<u64> {
        let dir = path
            .parent()
            .ok_or_else(|| SnapshotError::Io(format!("{} has no parent", path.display())))?;
        let tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| {
            SnapshotError::Io(format!("Failed to create temp file in {}: {}", dir.display(), e))
        })?;

        let chunk_size = self.chunk_size() as u64;
        let mut written = 0u64;
        self.fetch_ordered(recipe, identity, |idx, data| {
            tmp.as_file()
                .write_all_at(&data, idx as u64 * chunk_size)
                .map_err(|e| SnapshotError::Io(format!("Failed to write chunk {}: {}", idx, e)))?;
            written += data.len() as u64;
            Ok(())
        })
        .await?;

        tmp.persist(path).map_err(|e| {
            SnapshotError::Io(format!("Failed to persist {}: {}", path.display(), e.error))
        })?;

        tracing::debug!(
            path = %path.display(),
            chunks = recipe.len(),
            bytes = written,
            "Reconstructed memory file"
        );
        Ok(written)
    }

    /// Download every slot with at most `threads` in flight, handing each
    /// chunk to `sink` with its slot index as it arrives.
    ///
    /// Stops at the first failure; outstanding downloads are aborted.
    async fn fetch_ordered<F>(&self, recipe: &Recipe, identity: &str, mut sink: F) -> Result<()>
    where
        F: FnMut(usize, Arc<[u8]>) -> Result<()>,
    {
        let identity: Arc<str> = Arc::from(identity);
        let hashes = recipe.hashes();
        let mut tasks = JoinSet::new();
        let mut next = 0;

        loop {
            while tasks.len() < self.threads && next < hashes.len() {
                let store = self.clone();
                let hash = hashes[next];
                let identity = Arc::clone(&identity);
                let idx = next;
                tasks.spawn(async move { store.download(&hash, &identity).await.map(|d| (idx, d)) });
                next += 1;
            }

            match tasks.join_next().await {
                Some(joined) => {
                    let (idx, data) = joined.map_err(|e| {
                        SnapshotError::Io(format!("Chunk download task failed: {}", e))
                    })??;
                    sink(idx, data)?;
                }
                None => break,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapcache_core::storage::MemoryObjectStorage;
    use tempfile::TempDir;

    fn setup(chunk_size: u64) -> (TempDir, Arc<MemoryObjectStorage>, ChunkStore) {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(MemoryObjectStorage::new());
        let cache = LocalChunkCache::new(
            &dir.path().join("_chunks"),
            storage.clone() as Arc<dyn ObjectStorage>,
            1 << 20,
            4,
        )
        .unwrap();
        let store = ChunkStore::new(Arc::new(cache), chunk_size).unwrap();
        (dir, storage, store)
    }

    #[tokio::test]
    async fn test_upload_is_idempotent() {
        let (_dir, storage, store) = setup(8);
        let hash = ChunkHash::of(b"chunk");

        assert!(store.upload(&hash, b"chunk").await.unwrap());
        assert!(!store.upload(&hash, b"chunk").await.unwrap());
        assert_eq!(storage.upload_count(), 1);
        assert_eq!(storage.get(&hash.object_key()).unwrap(), b"chunk");
    }

    #[tokio::test]
    async fn test_upload_skips_when_remote_has_it() {
        let (_dir, storage, store) = setup(8);
        let hash = ChunkHash::of(b"chunk");
        storage.put(&hash.object_key(), b"chunk".to_vec());

        assert!(!store.upload(&hash, b"chunk").await.unwrap());
        assert_eq!(storage.upload_count(), 0);
    }

    #[tokio::test]
    async fn test_download_verifies_plain_and_remapped() {
        let (_dir, storage, store) = setup(8);
        let plain = ChunkHash::of(b"secret");
        let remapped = plain.remap("rev-1");
        storage.put(&remapped.object_key(), b"secret".to_vec());
        storage.put(&plain.object_key(), b"secret".to_vec());

        assert_eq!(&*store.download(&plain, "any").await.unwrap(), b"secret");
        assert_eq!(&*store.download(&remapped, "rev-1").await.unwrap(), b"secret");
    }

    #[tokio::test]
    async fn test_download_rejects_tampered_remote() {
        let (_dir, storage, store) = setup(8);
        let hash = ChunkHash::of(b"original");
        storage.put(&hash.object_key(), b"tampered".to_vec());

        let result = store.download(&hash, "rev-1").await;
        assert!(matches!(result, Err(SnapshotError::Corrupt { .. })));
        // Evicting would only refetch the same bytes.
        assert!(store.cache().contains(&hash));
        assert_eq!(store.cache().metrics().snapshot().corrupt, 0);
    }

    #[tokio::test]
    async fn test_damaged_cached_chunk_is_replaced() {
        let (_dir, storage, store) = setup(8);
        let hash = ChunkHash::of(b"original");
        storage.put(&hash.object_key(), b"original".to_vec());
        store.download(&hash, "rev-1").await.unwrap();
        std::fs::write(hash.shard_path(store.cache().dir()), b"bitrot!!").unwrap();

        let data = store.download(&hash, "rev-1").await.unwrap();
        assert_eq!(&*data, b"original");
        assert_eq!(store.cache().metrics().snapshot().corrupt, 1);
        assert_eq!(
            std::fs::read(hash.shard_path(store.cache().dir())).unwrap(),
            b"original"
        );
    }

    #[tokio::test]
    async fn test_remapped_chunk_fails_for_other_identity() {
        let (_dir, storage, store) = setup(8);
        let remapped = ChunkHash::of(b"secret").remap("rev-1");
        storage.put(&remapped.object_key(), b"secret".to_vec());

        let result = store.download(&remapped, "rev-2").await;
        assert!(matches!(result, Err(SnapshotError::Corrupt { .. })));
        assert!(store.cache().contains(&remapped));
        assert_eq!(store.cache().metrics().snapshot().corrupt, 0);

        let downloads = storage.download_count();
        assert_eq!(&*store.download(&remapped, "rev-1").await.unwrap(), b"secret");
        assert_eq!(storage.download_count(), downloads);
    }

    #[tokio::test]
    async fn test_sealed_roundtrip() {
        let (_dir, storage, store) = setup(8);
        let store = store.with_cipher(ChunkCipher::new(b"key").unwrap());
        let hash = ChunkHash::of(b"private");

        store.upload(&hash, b"private").await.unwrap();
        let remote = storage.get(&hash.object_key()).unwrap();
        assert_ne!(remote, b"private");

        store.cache().clear().await.unwrap();
        assert_eq!(&*store.download(&hash, "rev-1").await.unwrap(), b"private");
    }

    #[tokio::test]
    async fn test_reconstruct_in_order() {
        let (_dir, _storage, store) = setup(4);
        let data: Vec<u8> = (0..37u8).collect();
        let spans = store.chunker().chunk_bytes(&data);

        let mut recipe = Recipe::new();
        for span in &spans {
            let bytes = &data[span.offset as usize..span.offset as usize + span.len];
            store.upload(&span.hash, bytes).await.unwrap();
            recipe.push(span.hash);
        }
        store.cache().clear().await.unwrap();

        assert_eq!(store.reconstruct(&recipe, "rev-1").await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_reconstruct_to_file() {
        let (dir, _storage, store) = setup(4);
        let data: Vec<u8> = (0..10u8).collect();
        let mut recipe = Recipe::new();
        for span in store.chunker().chunk_bytes(&data) {
            let bytes = &data[span.offset as usize..span.offset as usize + span.len];
            store.upload(&span.hash, bytes).await.unwrap();
            recipe.push(span.hash);
        }

        let out = dir.path().join("memfile");
        assert_eq!(store.reconstruct_to_file(&recipe, "rev-1", &out).await.unwrap(), 10);
        assert_eq!(std::fs::read(&out).unwrap(), data);
    }

    #[tokio::test]
    async fn test_reconstruct_fails_on_missing_chunk() {
        let (dir, _storage, store) = setup(4);
        let recipe = Recipe::from_hashes(vec![ChunkHash::of(b"gone")]);
        let out = dir.path().join("memfile");

        let result = store.reconstruct_to_file(&recipe, "rev-1", &out).await;
        assert!(matches!(result, Err(SnapshotError::NotFound(_))));
        assert!(!out.exists());
    }

    #[tokio::test]
    async fn test_download_times_out() {
        let (_dir, storage, store) = setup(8);
        let store = store.with_timeout(Duration::from_millis(20));
        storage.set_latency(Duration::from_millis(500));
        let hash = ChunkHash::of(b"slow");
        storage.put(&hash.object_key(), b"slow".to_vec());

        let result = store.download(&hash, "rev-1").await;
        assert!(matches!(result, Err(SnapshotError::Timeout(_))));
        assert!(!store.cache().contains(&hash));
    }

    #[tokio::test]
    async fn test_unavailable_store() {
        let (_dir, storage, store) = setup(8);
        storage.set_offline(true);
        let result = store.download(&ChunkHash::of(b"x"), "rev-1").await;
        assert!(matches!(result, Err(SnapshotError::Unavailable(_))));
    }
}
