//! snapcache runtime - snapshot cache engine for microVM cold starts.
//!
//! This crate provides the chunk store, the local chunk cache, chunk
//! sensitivity classification, and the snapshot lifecycle managers.

pub mod cache;
pub mod chunk;
pub mod fs;
pub mod metrics;
pub mod sensitivity;
pub mod snapshot;

// Re-export common types
pub use cache::{AccessKind, AccessRecord, ChunkAccessStats, LocalChunkCache};
pub use chunk::{ChunkCipher, ChunkSpan, ChunkStore, Chunker, Recipe};
pub use metrics::{CacheMetrics, CacheMetricsSnapshot};
pub use sensitivity::{
    remap, Classifier, NoReferences, RecodeReport, Recoder, ReferenceChunkSet, SensitivityPolicy,
};
pub use snapshot::{
    ChunkedSnapshotManager, FullLocalSnapshotManager, RegularSnapshotManager, Snapshot,
    SnapshotInfo, SnapshotManager, SnapshotStats, SnapshotTransfer, UploadReport, WorkingSet,
};

/// snapcache runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
