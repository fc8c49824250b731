//! Chunk sensitivity classification and hash remapping.
//!
//! A chunk is sensitive when it may carry data private to one snapshot.
//! Sensitive chunks are stored under `remap(plain, identity)` so they are
//! never shared between snapshots; everything else is stored under its
//! plain hash and deduplicates freely.

pub mod recode;
pub mod reference;

pub use recode::{RecodeReport, Recoder};
pub use reference::ReferenceChunkSet;

use std::sync::Arc;

use snapcache_core::config::SensitivityMode;
use snapcache_core::hash::ChunkHash;

/// Decides which chunks are sensitive in `partial` mode.
pub trait SensitivityPolicy: Send + Sync {
    /// Whether the chunk with plain hash `hash`, taken from a snapshot of
    /// `image`, should be treated as private to that snapshot.
    fn is_sensitive(&self, hash: &ChunkHash, image: &str) -> bool;
}

/// Policy that treats every chunk as shareable.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoReferences;

impl SensitivityPolicy for NoReferences {
    fn is_sensitive(&self, _hash: &ChunkHash, _image: &str) -> bool {
        false
    }
}

/// Applies a sensitivity mode, delegating `partial` to a policy.
#[derive(Clone)]
pub struct Classifier {
    mode: SensitivityMode,
    policy: Arc<dyn SensitivityPolicy>,
}

impl Classifier {
    pub fn new(mode: SensitivityMode, policy: Arc<dyn SensitivityPolicy>) -> Self {
        Self { mode, policy }
    }

    pub fn mode(&self) -> SensitivityMode {
        self.mode
    }

    /// Same policy under a different mode.
    pub fn with_mode(&self, mode: SensitivityMode) -> Self {
        Self {
            mode,
            policy: Arc::clone(&self.policy),
        }
    }

    pub fn is_sensitive(&self, hash: &ChunkHash, image: &str) -> bool {
        match self.mode {
            SensitivityMode::None => false,
            SensitivityMode::Full => true,
            SensitivityMode::Partial => self.policy.is_sensitive(hash, image),
        }
    }

    /// Hash a chunk with plain hash `plain` is stored under.
    pub fn stored_hash(&self, plain: &ChunkHash, image: &str, identity: &str) -> ChunkHash {
        if self.is_sensitive(plain, image) {
            remap(plain, identity)
        } else {
            *plain
        }
    }
}

impl std::fmt::Debug for Classifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Classifier").field("mode", &self.mode).finish()
    }
}

/// Identity-bound hash of a sensitive chunk.
pub fn remap(plain: &ChunkHash, identity: &str) -> ChunkHash {
    plain.remap(identity)
}
