//! Snapcache Core - Foundational Types and Abstractions
//!
//! Errors, configuration, chunk hashes, logging setup, lifecycle events,
//! and the remote object storage abstraction shared by the snapshot cache.

pub mod config;
pub mod error;
pub mod event;
pub mod hash;
pub mod log;
pub mod storage;

// Re-export commonly used types
pub use config::{SensitivityMode, SnapshotConfig};
pub use error::{Result, SnapshotError};
pub use event::{EventEmitter, EventSubscriber, SnapshotEvent, SnapshotEventKind};
pub use hash::{ChunkHash, HASH_LEN};
pub use log::{init_tracing, LogConfig, LogLevel};
pub use storage::{LocalObjectStorage, MemoryObjectStorage, ObjectStorage};

/// Snapcache version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
