//! Byte-budgeted LRU index over cached chunks.

use std::collections::{BTreeMap, HashMap};

use snapcache_core::hash::ChunkHash;

#[derive(Debug, Clone, Copy)]
struct Entry {
    size: u64,
    tick: u64,
}

/// Tracks which chunks are on disk, their sizes, and recency.
///
/// Holds no file handles; the cache owns the files and consults this index
/// to decide what to evict.
#[derive(Debug, Default)]
pub(crate) struct LruIndex {
    entries: HashMap<ChunkHash, Entry>,
    order: BTreeMap<u64, ChunkHash>,
    next_tick: u64,
    total_bytes: u64,
}

impl LruIndex {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn bump(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    /// Mark `hash` as most recently used. Returns false if absent.
    pub(crate) fn touch(&mut self, hash: &ChunkHash) -> bool {
        let tick = self.bump();
        match self.entries.get_mut(hash) {
            Some(entry) => {
                self.order.remove(&entry.tick);
                entry.tick = tick;
                self.order.insert(tick, *hash);
                true
            }
            None => false,
        }
    }

    /// Record `hash` as cached with `size` bytes, most recently used.
    pub(crate) fn insert(&mut self, hash: ChunkHash, size: u64) {
        let tick = self.bump();
        if let Some(old) = self.entries.insert(hash, Entry { size, tick }) {
            self.order.remove(&old.tick);
            self.total_bytes -= old.size;
        }
        self.order.insert(tick, hash);
        self.total_bytes += size;
    }

    pub(crate) fn remove(&mut self, hash: &ChunkHash) -> Option<u64> {
        let entry = self.entries.remove(hash)?;
        self.order.remove(&entry.tick);
        self.total_bytes -= entry.size;
        Some(entry.size)
    }

    pub(crate) fn contains(&self, hash: &ChunkHash) -> bool {
        self.entries.contains_key(hash)
    }

    /// Remove least-recently-used entries until the total fits `budget`.
    pub(crate) fn evict_to(&mut self, budget: u64) -> Vec<ChunkHash> {
        let mut victims = Vec::new();
        while self.total_bytes > budget {
            let Some((&tick, &hash)) = self.order.iter().next() else {
                break;
            };
            self.order.remove(&tick);
            if let Some(entry) = self.entries.remove(&hash) {
                self.total_bytes -= entry.size;
            }
            victims.push(hash);
        }
        victims
    }

    pub(crate) fn clear(&mut self) -> Vec<ChunkHash> {
        self.order.clear();
        self.total_bytes = 0;
        self.entries.drain().map(|(hash, _)| hash).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn total_bytes(&self) -> u64 {
        self.total_bytes
    }
}
