//! Per-image snapshot pool without capacity accounting.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;

use snapcache_core::error::{Result, SnapshotError};

use super::handle::Snapshot;
use super::SnapshotManager;
use crate::fs::remove_dir_if_exists;

#[derive(Default)]
struct State {
    creating: HashMap<String, Snapshot>,
    idle: HashMap<String, VecDeque<Snapshot>>,
    active: HashMap<String, Snapshot>,
}

impl State {
    fn is_idle(&self, id: &str) -> bool {
        self.idle.values().flatten().any(|s| s.id() == id)
    }
}

/// Pools snapshots by image; each snapshot serves one consumer at a time.
///
/// A snapshot moves creating → idle → active → idle → ... and is never
/// deleted by the manager.
pub struct RegularSnapshotManager {
    base_dir: PathBuf,
    state: Mutex<State>,
}

impl RegularSnapshotManager {
    /// Create a manager owning `base_dir`, discarding its contents.
    pub async fn new(base_dir: &Path) -> Result<Self> {
        remove_dir_if_exists(base_dir).await?;
        tokio::fs::create_dir_all(base_dir).await.map_err(|e| {
            SnapshotError::Io(format!(
                "Failed to create snapshot directory {}: {}",
                base_dir.display(),
                e
            ))
        })?;

        Ok(Self {
            base_dir: base_dir.to_path_buf(),
            state: Mutex::new(State::default()),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Idle snapshots available for `image`.
    pub fn idle_count(&self, image: &str) -> usize {
        self.state.lock().idle.get(image).map_or(0, VecDeque::len)
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    pub async fn init_snapshot(
        &self,
        vm_id: &str,
        image: &str,
        mem_size_mib: u32,
        vcpu_count: u32,
        sparse: bool,
    ) -> Result<Snapshot> {
        let snapshot = Snapshot::new(vm_id, &self.base_dir, image, mem_size_mib, vcpu_count, sparse);
        {
            let mut state = self.state.lock();
            if state.creating.contains_key(vm_id)
                || state.active.contains_key(vm_id)
                || state.is_idle(vm_id)
            {
                return Err(SnapshotError::AlreadyExists(format!("snapshot {}", vm_id)));
            }
            state.creating.insert(vm_id.to_string(), snapshot.clone());
        }

        if let Err(e) = snapshot.create_dir().await {
            self.state.lock().creating.remove(vm_id);
            return Err(e);
        }

        tracing::debug!(vm_id, image, "Snapshot creating");
        Ok(snapshot)
    }

    /// Move a created snapshot to the back of its image's idle pool.
    pub fn commit_snapshot(&self, vm_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        let snapshot = state
            .creating
            .remove(vm_id)
            .ok_or_else(|| SnapshotError::NotFound(format!("creating snapshot {}", vm_id)))?;
        state
            .idle
            .entry(snapshot.image().to_string())
            .or_default()
            .push_back(snapshot);

        tracing::debug!(vm_id, "Snapshot committed");
        Ok(())
    }

    /// Hand out the oldest idle snapshot of `image`.
    pub fn acquire_snapshot(&self, image: &str) -> Result<Snapshot> {
        let mut state = self.state.lock();
        let snapshot = state
            .idle
            .get_mut(image)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| SnapshotError::NotFound(format!("idle snapshot for image {}", image)))?;
        state
            .active
            .insert(snapshot.id().to_string(), snapshot.clone());

        tracing::debug!(image, id = snapshot.id(), "Snapshot acquired");
        Ok(snapshot)
    }

    /// Return an active snapshot to its image's idle pool.
    pub fn release_snapshot(&self, consumer_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        let snapshot = state
            .active
            .remove(consumer_id)
            .ok_or_else(|| SnapshotError::NotFound(format!("active snapshot {}", consumer_id)))?;
        state
            .idle
            .entry(snapshot.image().to_string())
            .or_default()
            .push_back(snapshot);

        tracing::debug!(consumer_id, "Snapshot released");
        Ok(())
    }
}

#[async_trait]
impl SnapshotManager for RegularSnapshotManager {
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
        self.commit_snapshot(id)
    }

    fn acquire(&self, key: &str) -> Result<Snapshot> {
        self.acquire_snapshot(key)
    }

    fn release(&self, key: &str) -> Result<()> {
        self.release_snapshot(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn manager() -> (TempDir, RegularSnapshotManager) {
        let dir = TempDir::new().unwrap();
        let mgr = RegularSnapshotManager::new(&dir.path().join("snaps")).await.unwrap();
        (dir, mgr)
    }

    #[tokio::test]
    async fn test_pool_cycle() {
        let (_dir, mgr) = manager().await;
        let snap = mgr.init_snapshot("vm-1", "nginx", 256, 1, false).await.unwrap();
        assert!(snap.snap_dir().exists());

        assert!(matches!(mgr.acquire_snapshot("nginx"), Err(SnapshotError::NotFound(_))));
        mgr.commit_snapshot("vm-1").unwrap();
        assert_eq!(mgr.idle_count("nginx"), 1);

        let acquired = mgr.acquire_snapshot("nginx").unwrap();
        assert_eq!(acquired.id(), "vm-1");
        assert_eq!(mgr.idle_count("nginx"), 0);
        assert!(matches!(mgr.acquire_snapshot("nginx"), Err(SnapshotError::NotFound(_))));

        mgr.release_snapshot("vm-1").unwrap();
        assert_eq!(mgr.idle_count("nginx"), 1);
        assert_eq!(mgr.active_count(), 0);
    }

    #[tokio::test]
    async fn test_acquire_is_fifo_per_image() {
        let (_dir, mgr) = manager().await;
        for id in ["vm-1", "vm-2"] {
            mgr.init_snapshot(id, "nginx", 256, 1, false).await.unwrap();
            mgr.commit_snapshot(id).unwrap();
        }
        mgr.init_snapshot("vm-3", "redis", 256, 1, false).await.unwrap();
        mgr.commit_snapshot("vm-3").unwrap();

        assert_eq!(mgr.acquire_snapshot("nginx").unwrap().id(), "vm-1");
        assert_eq!(mgr.acquire_snapshot("redis").unwrap().id(), "vm-3");
        mgr.release_snapshot("vm-1").unwrap();
        assert_eq!(mgr.acquire_snapshot("nginx").unwrap().id(), "vm-2");
        assert_eq!(mgr.acquire_snapshot("nginx").unwrap().id(), "vm-1");
    }

    #[tokio::test]
    async fn test_duplicate_ids_rejected_in_every_state() {
        let (_dir, mgr) = manager().await;
        mgr.init_snapshot("vm-1", "nginx", 256, 1, false).await.unwrap();
        let creating = mgr.init_snapshot("vm-1", "nginx", 256, 1, false).await;
        assert!(matches!(creating, Err(SnapshotError::AlreadyExists(_))));

        mgr.commit_snapshot("vm-1").unwrap();
        let idle = mgr.init_snapshot("vm-1", "nginx", 256, 1, false).await;
        assert!(matches!(idle, Err(SnapshotError::AlreadyExists(_))));

        mgr.acquire_snapshot("nginx").unwrap();
        let active = mgr.init_snapshot("vm-1", "nginx", 256, 1, false).await;
        assert!(matches!(active, Err(SnapshotError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_commit_and_release_unknown() {
        let (_dir, mgr) = manager().await;
        assert!(matches!(mgr.commit_snapshot("vm-9"), Err(SnapshotError::NotFound(_))));
        assert!(matches!(mgr.release_snapshot("vm-9"), Err(SnapshotError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_through_manager_trait() {
        let (_dir, mgr) = manager().await;
        let mgr: &dyn SnapshotManager = &mgr;
        let (evicted, _) = mgr.init("vm-1", "nginx", 100, 256, 1, false).await.unwrap();
        assert!(evicted.is_empty());
        mgr.commit("vm-1").await.unwrap();
        assert_eq!(mgr.acquire("nginx").unwrap().id(), "vm-1");
        mgr.release("vm-1").unwrap();
    }
}
