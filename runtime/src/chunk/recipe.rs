//! Chunk recipes.
//!
//! A recipe is the ordered list of stored chunk hashes of one memory file,
//! serialized as the raw concatenation of 16-byte hashes with no header.

use std::path::Path;

use snapcache_core::error::{Result, SnapshotError};
use snapcache_core::hash::{ChunkHash, HASH_LEN};

use crate::fs::atomic_write_async;

/// Ordered chunk hashes that reconstruct one memory file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recipe {
    slots: Vec<ChunkHash>,
}

impl Recipe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
        }
    }

    pub fn from_hashes(slots: Vec<ChunkHash>) -> Self {
        Self { slots }
    }

    /// Parse a serialized recipe.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() % HASH_LEN != 0 {
            return Err(SnapshotError::InvalidRecipe(format!(
                "length {} is not a multiple of {}",
                bytes.len(),
                HASH_LEN
            )));
        }
        let slots = bytes
            .chunks_exact(HASH_LEN)
            .filter_map(ChunkHash::from_slice)
            .collect();
        Ok(Self { slots })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.slots.len() * HASH_LEN);
        for hash in &self.slots {
            out.extend_from_slice(hash.as_bytes());
        }
        out
    }

    /// Read a recipe file from disk.
    pub async fn load(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SnapshotError::NotFound(format!("recipe {}", path.display()))
            } else {
                SnapshotError::Io(format!("Failed to read recipe {}: {}", path.display(), e))
            }
        })?;
        Self::parse(&bytes)
    }

    /// Write the recipe to disk, replacing any previous file atomically.
    pub async fn save(&self, path: &Path) -> Result<()> {
        atomic_write_async(path.to_path_buf(), self.to_bytes()).await
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ChunkHash> {
        self.slots.get(index)
    }

    /// Replace the hash in slot `index`. Returns false when out of range.
    pub fn set(&mut self, index: usize, hash: ChunkHash) -> bool {
        match self.slots.get_mut(index) {
            Some(slot) => {
                *slot = hash;
                true
            }
            None => false,
        }
    }

    pub fn push(&mut self, hash: ChunkHash) {
        self.slots.push(hash);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ChunkHash> {
        self.slots.iter()
    }

    pub fn hashes(&self) -> &[ChunkHash] {
        &self.slots
    }
}

impl<'a> IntoIterator for &'a Recipe {
    type Item = &'a ChunkHash;
    type IntoIter = std::slice::Iter<'a, ChunkHash>;

    fn into_iter(self) -> Self::IntoIter {
        self.slots.iter()
    }
}
