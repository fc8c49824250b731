use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::{Path, PathBuf};

use crate::error::{Result, SnapshotError};

/// Default chunk size in bytes (one guest page)
pub const DEFAULT_CHUNK_SIZE: u64 = 4096;

/// Default local chunk cache budget in bytes (1 GiB)
pub const DEFAULT_CACHE_SIZE: u64 = 1024 * 1024 * 1024;

/// Default number of concurrent chunk transfers
pub const DEFAULT_THREADS: usize = 16;

/// Default disk budget for full local snapshots in MiB (100 GiB)
pub const DEFAULT_CAPACITY_MIB: i64 = 100 * 1024;

/// Snapshot cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Root directory for snapshot folders and the chunk cache
    pub base_dir: PathBuf,

    /// Store memory files as chunks plus a recipe
    pub chunking: bool,

    /// Chunk size in bytes
    pub chunk_size: u64,

    /// Local chunk cache budget in bytes
    pub cache_size: u64,

    /// Maximum concurrent chunk transfers
    pub threads: usize,

    /// Sensitivity mode used when chunking
    pub sensitivity_mode: SensitivityMode,

    /// Seal chunks before they leave the host
    pub encryption: bool,

    /// Secret the chunk sealing key is derived from
    pub encryption_key: Option<String>,

    /// Disk budget for full local snapshots in MiB
    pub capacity_mib: i64,

    /// Keep the base directory on startup and recover what is there
    pub skip_cleanup: bool,

    /// Fetch only the recipe on download; chunks are pulled on demand
    pub lazy: bool,

    /// Prefetch working-set chunks after a lazy download
    pub ws_pulling: bool,

    /// Per-chunk download deadline in milliseconds
    pub download_timeout_ms: Option<u64>,

    /// Directory holding `<image>/container.tar` and `rootfs.tar`
    pub images_dir: Option<PathBuf>,

    /// Chunk lookups and evictions to keep in the cache's access history;
    /// 0 disables it
    pub access_history_len: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            chunking: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
            cache_size: DEFAULT_CACHE_SIZE,
            threads: DEFAULT_THREADS,
            sensitivity_mode: SensitivityMode::None,
            encryption: false,
            encryption_key: None,
            capacity_mib: DEFAULT_CAPACITY_MIB,
            skip_cleanup: false,
            lazy: false,
            ws_pulling: false,
            download_timeout_ms: None,
            images_dir: None,
            access_history_len: 0,
        }
    }
}

impl SnapshotConfig {
    /// Load configuration from a JSON or YAML file, chosen by extension.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SnapshotError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
            _ => serde_json::from_str(&content)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the cache cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(SnapshotError::Config("chunk_size must be positive".to_string()));
        }
        if self.cache_size == 0 {
            return Err(SnapshotError::Config("cache_size must be positive".to_string()));
        }
        if self.threads == 0 {
            return Err(SnapshotError::Config("threads must be positive".to_string()));
        }
        if self.capacity_mib <= 0 {
            return Err(SnapshotError::Config("capacity_mib must be positive".to_string()));
        }
        if self.encryption && self.encryption_key.as_deref().map_or(true, str::is_empty) {
            return Err(SnapshotError::Config(
                "encryption requires encryption_key".to_string(),
            ));
        }
        if self.ws_pulling && !self.lazy {
            return Err(SnapshotError::Config(
                "ws_pulling requires lazy downloads".to_string(),
            ));
        }
        Ok(())
    }

    /// Directory holding the local chunk cache.
    pub fn chunk_dir(&self) -> PathBuf {
        self.base_dir.join(crate::storage::CHUNK_PREFIX)
    }

    /// Per-chunk download deadline, if configured.
    pub fn download_timeout(&self) -> Option<std::time::Duration> {
        self.download_timeout_ms.map(std::time::Duration::from_millis)
    }
}

fn default_base_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".snapcache"))
        .unwrap_or_else(|| PathBuf::from("/tmp/snapcache"))
}

/// How chunks are addressed in the shared store.
///
/// Sensitive chunks are stored under a hash remapped with the snapshot
/// identity, so they never deduplicate across snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SensitivityMode {
    /// No chunk is sensitive
    #[default]
    None,
    /// Chunks not found in reference images are sensitive
    Partial,
    /// Every chunk is sensitive
    Full,
}

impl SensitivityMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Partial => "partial",
            Self::Full => "full",
        }
    }
}

impl std::fmt::Display for SensitivityMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SensitivityMode {
    type Err = SnapshotError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "partial" => Ok(Self::Partial),
            "full" => Ok(Self::Full),
            _ => Err(SnapshotError::Config(format!(
                "unknown sensitivity mode: '{}' (supported: none, partial, full)",
                s
            ))),
        }
    }
}

impl Serialize for SensitivityMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for SensitivityMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
