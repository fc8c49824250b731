use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use super::{select_keys, ObjectStorage};
use crate::error::{Result, SnapshotError};

/// In-memory object store.
///
/// Counts every request and can be switched offline or slowed down, which
/// lets tests observe deduplication and request coalescing.
#[derive(Default)]
pub struct MemoryObjectStorage {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    offline: AtomicBool,
    latency_ms: AtomicU64,
    uploads: AtomicU64,
    downloads: AtomicU64,
}

impl MemoryObjectStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every request fail with `Unavailable` while set.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Delay every download by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of `upload_object` calls that stored data.
    pub fn upload_count(&self) -> u64 {
        self.uploads.load(Ordering::SeqCst)
    }

    /// Number of `download_object` calls that reached the store.
    pub fn download_count(&self) -> u64 {
        self.downloads.load(Ordering::SeqCst)
    }

    /// Raw object bytes, bypassing counters.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().get(key).cloned()
    }

    /// Replace an object directly, bypassing counters.
    pub fn put(&self, key: &str, data: Vec<u8>) {
        self.objects.lock().insert(key.to_string(), data);
    }

    /// Remove an object directly.
    pub fn remove(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().remove(key)
    }

    /// All stored keys in order.
    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().keys().cloned().collect()
    }

    fn check_online(&self, key: &str) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SnapshotError::Unavailable(format!(
                "object store offline while accessing {}",
                key
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStorage for MemoryObjectStorage {
    async fn upload_object(&self, key: &str, data: Vec<u8>) -> Result<()> {
        self.check_online(key)?;
        self.objects.lock().insert(key.to_string(), data);
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn download_object(&self, key: &str) -> Result<Vec<u8>> {
        self.check_online(key)?;
        self.downloads.fetch_add(1, Ordering::SeqCst);

        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        self.objects
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| SnapshotError::NotFound(format!("object {}", key)))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.check_online(key)?;
        Ok(self.objects.lock().contains_key(key))
    }

    async fn list_objects(&self, prefix: &str, recursive: bool) -> Result<Vec<String>> {
        self.check_online(prefix)?;
        let keys: Vec<String> = self.objects.lock().keys().cloned().collect();
        Ok(select_keys(keys, prefix, recursive))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counts_requests() {
        let store = MemoryObjectStorage::new();
        store.upload_object("a/b", vec![1, 2]).await.unwrap();
        assert_eq!(store.download_object("a/b").await.unwrap(), vec![1, 2]);
        assert_eq!(store.upload_count(), 1);
        assert_eq!(store.download_count(), 1);
    }

    #[tokio::test]
    async fn test_offline_fails_unavailable() {
        let store = MemoryObjectStorage::new();
        store.put("a/b", vec![1]);
        store.set_offline(true);

        let result = store.download_object("a/b").await;
        assert!(matches!(result, Err(SnapshotError::Unavailable(_))));
        assert!(store.exists("a/b").await.is_err());

        store.set_offline(false);
        assert!(store.exists("a/b").await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_is_not_found() {
        let store = MemoryObjectStorage::new();
        let result = store.download_object("nope").await;
        assert!(matches!(result, Err(SnapshotError::NotFound(_))));
    }
}
