//! Snapshot lifecycle managers.
//!
//! Three managers share one contract: `init` registers a snapshot being
//! created, `commit` makes it available, `acquire` and `release` bracket
//! its use.
//!
//! - [`FullLocalSnapshotManager`] keeps snapshots by revision on local
//!   disk under a capacity budget and evicts the least valuable unused ones.
//! - [`RegularSnapshotManager`] pools snapshots by image, one consumer per
//!   snapshot, and never evicts.
//! - [`ChunkedSnapshotManager`] keeps snapshots by revision and moves them
//!   through the shared chunk store.

pub mod chunked;
pub mod full_local;
pub mod handle;
pub mod heap;
pub mod regular;
pub mod stats;
pub mod transfer;
pub mod working_set;

pub use chunked::{ChunkedSnapshotManager, BASE_REVISION};
pub use full_local::{estimate_size_mib, FullLocalSnapshotManager};
pub use handle::{Snapshot, SnapshotInfo};
pub use heap::ScoreHeap;
pub use regular::RegularSnapshotManager;
pub use stats::SnapshotStats;
pub use transfer::{SnapshotTransfer, UploadReport};
pub use working_set::WorkingSet;

use async_trait::async_trait;

use snapcache_core::error::Result;

/// Common snapshot lifecycle.
///
/// `acquire` and `release` keys are manager specific: the revision for
/// the full-local and chunked managers, the image and then the snapshot id
/// for the regular pool.
#[async_trait]
pub trait SnapshotManager: Send + Sync {
    /// Register a new snapshot and create its directory.
    ///
    /// Returns container snapshot names the caller must release for any
    /// snapshots evicted to make room.
    async fn init(
        &self,
        id: &str,
        image: &str,
        cold_start_ms: i64,
        mem_size_mib: u32,
        vcpu_count: u32,
        sparse: bool,
    ) -> Result<(Vec<String>, Snapshot)>;

    async fn commit(&self, id: &str) -> Result<()>;

    fn acquire(&self, key: &str) -> Result<Snapshot>;

    fn release(&self, key: &str) -> Result<()>;
}
