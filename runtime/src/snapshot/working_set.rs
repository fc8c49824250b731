//! Working-set page lists recorded after a restore.
//!
//! A `ws_file` holds one header line followed by one guest page number per
//! line. Pulling the working set means prefetching the chunks those pages
//! fall into before the guest touches them.

use std::collections::BTreeSet;
use std::path::Path;

use snapcache_core::error::{Result, SnapshotError};
use snapcache_core::hash::ChunkHash;

use crate::chunk::Recipe;

/// Guest page size the page numbers refer to.
pub const PAGE_SIZE: u64 = 4096;

/// Chunk indices touched by a working set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkingSet {
    chunks: BTreeSet<usize>,
}

impl WorkingSet {
    /// Parse a page list into the chunk indices it covers.
    ///
    /// Lines that are not page numbers are skipped.
    pub fn parse(content: &str, chunk_size: u64) -> Result<Self> {
        if chunk_size == 0 {
            return Err(SnapshotError::Config("chunk_size must be positive".to_string()));
        }

        let mut lines = content.lines();
        if lines.next().is_none() {
            return Err(SnapshotError::InvalidRecipe(
                "working set file is empty".to_string(),
            ));
        }

        let chunks = lines
            .filter_map(|line| line.trim().parse::<u64>().ok())
            .map(|page| (page * PAGE_SIZE / chunk_size) as usize)
            .collect();
        Ok(Self { chunks })
    }

    pub async fn load(path: &Path, chunk_size: u64) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SnapshotError::NotFound(format!("working set {}", path.display()))
            } else {
                SnapshotError::Io(format!("Failed to read {}: {}", path.display(), e))
            }
        })?;
        Self::parse(&content, chunk_size)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunk_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.chunks.iter().copied()
    }

    /// Distinct recipe hashes the working set needs. Pages past the end of
    /// the recipe are ignored.
    pub fn hashes(&self, recipe: &Recipe) -> Vec<ChunkHash> {
        let distinct: BTreeSet<ChunkHash> = self
            .chunks
            .iter()
            .filter_map(|&idx| recipe.get(idx).copied())
            .collect();
        distinct.into_iter().collect()
    }
}
