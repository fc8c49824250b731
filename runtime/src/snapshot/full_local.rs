//! Capacity-bounded local snapshot cache with score-based eviction.
//!
//! Every committed snapshot that nobody is using sits in a min-heap keyed
//! by its retention score. Admitting a new snapshot that does not fit
//! evicts from the bottom of the heap until it does. The logical clock
//! advances to the score of each evicted snapshot, so snapshots used after
//! an eviction outrank everything that was already cold.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;

use snapcache_core::error::{Result, SnapshotError};
use snapcache_core::event::{EventEmitter, SnapshotEventKind};

use super::handle::Snapshot;
use super::heap::ScoreHeap;
use super::stats::SnapshotStats;
use super::transfer::SnapshotTransfer;
use super::SnapshotManager;
use crate::fs::remove_dir_if_exists;

/// Disk estimate for a new snapshot: memory size plus 25% for state and
/// patch files, rounded up.
pub fn estimate_size_mib(mem_size_mib: u32) -> i64 {
    (mem_size_mib as i64 * 5 + 3) / 4
}

struct Entry {
    snapshot: Snapshot,
    stats: SnapshotStats,
}

#[derive(Default)]
struct State {
    entries: HashMap<String, Entry>,
    evictable: ScoreHeap,
    used_mib: i64,
    clock: i64,
    /// Revisions whose directory has not been moved aside yet.
    removing: HashSet<String>,
}

/// A snapshot removed from the books but not yet from disk.
struct Evicted {
    revision: String,
    container_snap_name: String,
    snap_dir: PathBuf,
    graveyard: PathBuf,
}

/// Keeps whole snapshots on local disk under a capacity budget.
pub struct FullLocalSnapshotManager {
    base_dir: PathBuf,
    capacity_mib: i64,
    state: Mutex<State>,
    events: Option<EventEmitter>,
}

impl FullLocalSnapshotManager {
    /// Create a manager owning `base_dir`.
    ///
    /// Anything already below `base_dir` is discarded.
    pub async fn new(base_dir: &Path, capacity_mib: i64) -> Result<Self> {
        if capacity_mib <= 0 {
            return Err(SnapshotError::Config(format!(
                "capacity_mib must be positive, got {}",
                capacity_mib
            )));
        }

        remove_dir_if_exists(base_dir).await?;
        tokio::fs::create_dir_all(base_dir).await.map_err(|e| {
            SnapshotError::Io(format!(
                "Failed to create snapshot directory {}: {}",
                base_dir.display(),
                e
            ))
        })?;

        tracing::info!(
            base_dir = %base_dir.display(),
            capacity_mib,
            "Full local snapshot manager ready"
        );

        Ok(Self {
            base_dir: base_dir.to_path_buf(),
            capacity_mib,
            state: Mutex::new(State::default()),
            events: None,
        })
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// `(used_mib, capacity_mib)`.
    pub fn capacity(&self) -> (i64, i64) {
        (self.state.lock().used_mib, self.capacity_mib)
    }

    pub fn clock(&self) -> i64 {
        self.state.lock().clock
    }

    pub fn stats(&self, revision: &str) -> Option<SnapshotStats> {
        self.state.lock().entries.get(revision).map(|e| e.stats.clone())
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a new snapshot and create its directory.
    ///
    /// Evicts unused snapshots if the estimated footprint does not fit.
    /// Returns the container snapshot names of evicted snapshots, which the
    /// caller must release, along with the new handle.
    ///
    /// If eviction cannot free enough space, fails with
    /// `InsufficientSpace` and evicts nothing. Any later failure is wrapped
    /// in `InitFailed` carrying the names of the snapshots already evicted.
    pub async fn init_snapshot(
        &self,
        revision: &str,
        image: &str,
        cold_start_ms: i64,
        mem_size_mib: u32,
        vcpu_count: u32,
        sparse: bool,
    ) -> Result<(Vec<String>, Snapshot)> {
        let estimate = estimate_size_mib(mem_size_mib);
        let snapshot = Snapshot::new(
            revision,
            &self.base_dir,
            image,
            mem_size_mib,
            vcpu_count,
            sparse,
        );

        let evicted = {
            let mut state = self.state.lock();
            if state.entries.contains_key(revision) {
                return Err(SnapshotError::AlreadyExists(format!("snapshot {}", revision)));
            }
            if state.removing.contains(revision) {
                return Err(SnapshotError::AlreadyExists(format!(
                    "snapshot {} is still being removed",
                    revision
                )));
            }

            let evicted = self.free_space_locked(&mut state, estimate)?;

            state.used_mib += estimate;
            let stats = SnapshotStats::new(revision, cold_start_ms, estimate, state.clock);
            state.entries.insert(
                revision.to_string(),
                Entry {
                    snapshot: snapshot.clone(),
                    stats,
                },
            );
            evicted
        };

        let removed = self.finish_eviction(&evicted).await;

        if let Err(e) = snapshot.create_dir().await {
            let mut state = self.state.lock();
            if let Some(entry) = state.entries.remove(revision) {
                state.used_mib -= entry.stats.size_mib;
            }
            return Err(e.with_evicted(removed));
        }

        tracing::info!(
            revision,
            image,
            estimate_mib = estimate,
            evicted = removed.len(),
            "Snapshot creating"
        );
        self.emit(SnapshotEventKind::Creating {
            revision: revision.to_string(),
        });

        Ok((removed, snapshot))
    }

    /// Mark a snapshot usable and charge its actual disk size.
    pub async fn commit_snapshot(&self, revision: &str) -> Result<()> {
        let (snapshot, estimate) = {
            let state = self.state.lock();
            let entry = state
                .entries
                .get(revision)
                .ok_or_else(|| SnapshotError::NotFound(format!("snapshot {}", revision)))?;
            if entry.stats.usable {
                return Err(SnapshotError::AlreadyExists(format!(
                    "snapshot {} already committed",
                    revision
                )));
            }
            (entry.snapshot.clone(), entry.stats.size_mib)
        };

        let actual = snapshot.disk_size_mib().await;
        if actual > estimate {
            tracing::warn!(
                revision,
                actual_mib = actual,
                estimate_mib = estimate,
                "Snapshot larger than its estimate, charging the estimate"
            );
        }
        let size = actual.min(estimate);

        {
            let mut state = self.state.lock();
            let state = &mut *state;
            let entry = state
                .entries
                .get_mut(revision)
                .ok_or_else(|| SnapshotError::NotFound(format!("snapshot {}", revision)))?;
            if entry.stats.usable {
                return Err(SnapshotError::AlreadyExists(format!(
                    "snapshot {} already committed",
                    revision
                )));
            }

            state.used_mib += size - entry.stats.size_mib;
            entry.stats.size_mib = size;
            entry.stats.usable = true;
            entry.stats.update_score();
            state.evictable.push(revision, entry.stats.score);
        }

        tracing::info!(revision, size_mib = size, "Snapshot committed");
        self.emit(SnapshotEventKind::Committed {
            revision: revision.to_string(),
        });
        Ok(())
    }

    /// Take a reference on a usable snapshot. It cannot be evicted until
    /// released.
    pub fn acquire_snapshot(&self, revision: &str) -> Result<Snapshot> {
        let mut state = self.state.lock();
        let state = &mut *state;
        let entry = state
            .entries
            .get_mut(revision)
            .ok_or_else(|| SnapshotError::NotFound(format!("snapshot {}", revision)))?;
        if !entry.stats.usable {
            return Err(SnapshotError::NotUsable(format!(
                "snapshot {} is still being created",
                revision
            )));
        }

        if entry.stats.num_using == 0 {
            state.evictable.remove(revision);
        }
        entry.stats.num_using += 1;
        entry.stats.freq += 1;
        entry.stats.last_used_clock = state.clock;

        tracing::debug!(revision, consumers = entry.stats.num_using, "Snapshot acquired");
        Ok(entry.snapshot.clone())
    }

    /// Drop a reference. The last release makes the snapshot evictable.
    pub fn release_snapshot(&self, revision: &str) -> Result<()> {
        let mut state = self.state.lock();
        let state = &mut *state;
        let entry = state
            .entries
            .get_mut(revision)
            .ok_or_else(|| SnapshotError::NotFound(format!("snapshot {}", revision)))?;
        if entry.stats.num_using == 0 {
            return Err(SnapshotError::NotInUse(format!("snapshot {}", revision)));
        }

        entry.stats.num_using -= 1;
        if entry.stats.num_using == 0 {
            entry.stats.update_score();
            state.evictable.push(revision, entry.stats.score);
        }

        tracing::debug!(revision, consumers = entry.stats.num_using, "Snapshot released");
        Ok(())
    }

    /// Remove an unused snapshot, committed or still creating.
    ///
    /// Returns its container snapshot name for the caller to release.
    pub async fn delete_snapshot(&self, revision: &str) -> Result<String> {
        let evicted = {
            let mut state = self.state.lock();
            let entry = state
                .entries
                .get(revision)
                .ok_or_else(|| SnapshotError::NotFound(format!("snapshot {}", revision)))?;
            if entry.stats.num_using > 0 {
                return Err(SnapshotError::InUse {
                    id: revision.to_string(),
                    consumers: entry.stats.num_using,
                });
            }
            state.evictable.remove(revision);
            self.forget_locked(&mut state, revision)
        };

        let name = evicted
            .as_ref()
            .map(|e| e.container_snap_name.clone())
            .unwrap_or_default();
        if let Some(evicted) = evicted {
            self.bury(&evicted).await?;
        }

        tracing::info!(revision, "Snapshot deleted");
        self.emit(SnapshotEventKind::Deleted {
            revision: revision.to_string(),
        });
        Ok(name)
    }

    /// Admit a snapshot by materializing it from the shared store.
    ///
    /// Runs the regular init and commit path around the download; a failed
    /// download releases the reservation. Errors after admission carry the
    /// names of snapshots evicted to make room.
    pub async fn restore_from_remote(
        &self,
        transfer: &SnapshotTransfer,
        revision: &str,
        cold_start_ms: i64,
    ) -> Result<(Vec<String>, Snapshot)> {
        let info = transfer.fetch_info(revision).await?;
        let (evicted, snapshot) = self
            .init_snapshot(
                revision,
                &info.image,
                cold_start_ms,
                info.mem_size_mib,
                info.vcpu_count,
                info.sparse,
            )
            .await?;

        if let Err(e) = transfer.download_into(&snapshot, &info).await {
            tracing::warn!(revision, error = %e, "Restore from shared store failed");
            if let Err(cleanup) = self.delete_snapshot(revision).await {
                tracing::warn!(revision, error = %cleanup, "Failed to discard partial snapshot");
            }
            return Err(e.with_evicted(evicted));
        }

        if let Err(e) = self.commit_snapshot(revision).await {
            return Err(e.with_evicted(evicted));
        }
        Ok((evicted, snapshot))
    }

    /// Pop evictable snapshots until `needed_mib` fits.
    ///
    /// Checks feasibility first so a failure leaves the state untouched.
    fn free_space_locked(&self, state: &mut State, needed_mib: i64) -> Result<Vec<Evicted>> {
        let available = self.capacity_mib - state.used_mib;
        if needed_mib <= available {
            return Ok(Vec::new());
        }

        let reclaimable: i64 = state
            .evictable
            .keys()
            .filter_map(|k| state.entries.get(k))
            .map(|e| e.stats.size_mib)
            .sum();
        if available + reclaimable < needed_mib {
            return Err(SnapshotError::InsufficientSpace {
                needed_mib,
                available_mib: available + reclaimable,
            });
        }

        let mut evicted = Vec::new();
        let mut freed = 0;
        while available + freed < needed_mib {
            let Some((revision, _)) = state.evictable.pop() else {
                break;
            };
            let Some(entry) = state.entries.get_mut(&revision) else {
                continue;
            };
            debug_assert_eq!(entry.stats.num_using, 0);

            entry.stats.update_score();
            state.clock = state.clock.max(entry.stats.score);
            freed += entry.stats.size_mib;
            if let Some(e) = self.forget_locked(state, &revision) {
                evicted.push(e);
            }
        }
        Ok(evicted)
    }

    /// Drop a snapshot from the books and reserve a graveyard path for its
    /// directory.
    ///
    /// No filesystem work happens here. The revision stays in `removing`
    /// until [`Self::bury`] has moved the directory aside, so it cannot be
    /// re-created on top of it.
    fn forget_locked(&self, state: &mut State, revision: &str) -> Option<Evicted> {
        let entry = state.entries.remove(revision)?;
        state.used_mib -= entry.stats.size_mib;
        state.removing.insert(revision.to_string());

        let graveyard = self
            .base_dir
            .join(format!(".evicted-{}-{}", revision, uuid::Uuid::new_v4()));
        Some(Evicted {
            revision: revision.to_string(),
            container_snap_name: entry.snapshot.container_snap_name().to_string(),
            snap_dir: entry.snapshot.snap_dir().to_path_buf(),
            graveyard,
        })
    }

    /// Move a forgotten snapshot's directory to its graveyard, release the
    /// revision, then delete the graveyard.
    async fn bury(&self, evicted: &Evicted) -> Result<()> {
        let moved = match tokio::fs::rename(&evicted.snap_dir, &evicted.graveyard).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                tracing::warn!(
                    revision = %evicted.revision,
                    error = %e,
                    "Failed to move snapshot directory aside, deleting in place"
                );
                let result = remove_dir_if_exists(&evicted.snap_dir).await;
                self.state.lock().removing.remove(&evicted.revision);
                return result;
            }
        };

        self.state.lock().removing.remove(&evicted.revision);
        if moved {
            remove_dir_if_exists(&evicted.graveyard).await?;
        }
        Ok(())
    }

    async fn finish_eviction(&self, evicted: &[Evicted]) -> Vec<String> {
        let mut names = Vec::with_capacity(evicted.len());
        for e in evicted {
            if let Err(err) = self.bury(e).await {
                tracing::warn!(revision = %e.revision, error = %err, "Failed to remove evicted snapshot");
            }
            tracing::info!(revision = %e.revision, "Snapshot evicted");
            self.emit(SnapshotEventKind::Evicted {
                revision: e.revision.clone(),
                container_snap_name: e.container_snap_name.clone(),
            });
            names.push(e.container_snap_name.clone());
        }
        names
    }

    fn emit(&self, kind: SnapshotEventKind) {
        if let Some(emitter) = &self.events {
            emitter.emit(kind);
        }
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        let state = self.state.lock();
        let charged: i64 = state.entries.values().map(|e| e.stats.size_mib).sum();
        assert_eq!(charged, state.used_mib);
        assert!(state.used_mib <= self.capacity_mib);
        assert!(state.removing.is_empty());
        for key in state.evictable.keys() {
            let entry = &state.entries[key];
            assert!(entry.stats.usable);
            assert_eq!(entry.stats.num_using, 0);
        }
    }
}

#[async_trait]
impl SnapshotManager for FullLocalSnapshotManager {
    async fn init(
        &self,
        id: &str,
        image: &str,
        cold_start_ms: i64,
        mem_size_mib: u32,
        vcpu_count: u32,
        sparse: bool,
    ) -> Result<(Vec<String>, Snapshot)> {
        self.init_snapshot(id, image, cold_start_ms, mem_size_mib, vcpu_count, sparse)
            .await
    }

    async fn commit(&self, id: &str) -> Result<()> {
        self.commit_snapshot(id).await
    }

    fn acquire(&self, key: &str) -> Result<Snapshot> {
        self.acquire_snapshot(key)
    }

    fn release(&self, key: &str) -> Result<()> {
        self.release_snapshot(key)
    }
}
