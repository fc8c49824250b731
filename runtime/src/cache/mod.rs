//! Cache module for cold start optimization.
//!
//! `LocalChunkCache` keeps recently used chunk objects on local disk in
//! front of the shared object store.

pub mod chunk_cache;
mod lru;

pub use chunk_cache::{AccessKind, AccessRecord, ChunkAccessStats, LocalChunkCache};
