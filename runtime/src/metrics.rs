//! Metrics and observability

use prometheus::{IntCounter, IntGauge, Registry};
use serde::{Deserialize, Serialize};

use snapcache_core::error::{Result, SnapshotError};

/// Point-in-time view of the chunk cache counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetricsSnapshot {
    /// Lookups served from local disk
    pub hits: u64,

    /// Lookups that needed the remote store
    pub misses: u64,

    /// Remote fetches actually issued
    pub remote_fetches: u64,

    /// Callers that waited on another caller's fetch
    pub coalesced: u64,

    /// Chunks evicted to stay within budget
    pub evictions: u64,

    /// Chunks that failed verification
    pub corrupt: u64,

    /// Bytes currently cached
    pub cached_bytes: i64,

    /// Chunks currently cached
    pub cached_chunks: i64,
}

/// Prometheus-backed chunk cache metrics.
#[derive(Clone)]
pub struct CacheMetrics {
    registry: Registry,
    hits: IntCounter,
    misses: IntCounter,
    remote_fetches: IntCounter,
    coalesced: IntCounter,
    evictions: IntCounter,
    corrupt: IntCounter,
    cached_bytes: IntGauge,
    cached_chunks: IntGauge,
}

impl CacheMetrics {
    /// Create metrics registered in a fresh registry.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let hits = counter(&registry, "snapcache_chunk_hits_total", "Chunk lookups served locally")?;
        let misses = counter(&registry, "snapcache_chunk_misses_total", "Chunk lookups that missed")?;
        let remote_fetches = counter(
            &registry,
            "snapcache_chunk_remote_fetches_total",
            "Chunk fetches issued to the object store",
        )?;
        let coalesced = counter(
            &registry,
            "snapcache_chunk_coalesced_total",
            "Chunk lookups that joined an in-flight fetch",
        )?;
        let evictions = counter(&registry, "snapcache_chunk_evictions_total", "Chunks evicted")?;
        let corrupt = counter(
            &registry,
            "snapcache_chunk_corrupt_total",
            "Chunks that failed verification",
        )?;
        let cached_bytes = gauge(&registry, "snapcache_chunk_cached_bytes", "Bytes in the chunk cache")?;
        let cached_chunks = gauge(&registry, "snapcache_chunk_cached_chunks", "Chunks in the chunk cache")?;

        Ok(Self {
            registry,
            hits,
            misses,
            remote_fetches,
            coalesced,
            evictions,
            corrupt,
            cached_bytes,
            cached_chunks,
        })
    }

    /// Registry to expose through a metrics endpoint.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_hit(&self) {
        self.hits.inc();
    }

    pub fn record_miss(&self) {
        self.misses.inc();
    }

    pub fn record_remote_fetch(&self) {
        self.remote_fetches.inc();
    }

    pub fn record_coalesced(&self) {
        self.coalesced.inc();
    }

    pub fn record_evictions(&self, count: u64) {
        self.evictions.inc_by(count);
    }

    pub fn record_corrupt(&self) {
        self.corrupt.inc();
    }

    pub fn set_cached(&self, bytes: u64, chunks: usize) {
        self.cached_bytes.set(bytes as i64);
        self.cached_chunks.set(chunks as i64);
    }

    pub fn snapshot(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            hits: self.hits.get(),
            misses: self.misses.get(),
            remote_fetches: self.remote_fetches.get(),
            coalesced: self.coalesced.get(),
            evictions: self.evictions.get(),
            corrupt: self.corrupt.get(),
            cached_bytes: self.cached_bytes.get(),
            cached_chunks: self.cached_chunks.get(),
        }
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter> {
    let counter = IntCounter::new(name, help)
        .map_err(|e| SnapshotError::Config(format!("Invalid metric {}: {}", name, e)))?;
    registry
        .register(Box::new(counter.clone()))
        .map_err(|e| SnapshotError::Config(format!("Failed to register {}: {}", name, e)))?;
    Ok(counter)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge> {
    let gauge = IntGauge::new(name, help)
        .map_err(|e| SnapshotError::Config(format!("Invalid metric {}: {}", name, e)))?;
    registry
        .register(Box::new(gauge.clone()))
        .map_err(|e| SnapshotError::Config(format!("Failed to register {}: {}", name, e)))?;
    Ok(gauge)
}
