use thiserror::Error;

/// Snapshot cache error types.
///
/// Payloads are plain strings so an error can be cloned and handed to every
/// caller waiting on the same in-flight chunk fetch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    /// Unknown snapshot, chunk, or remote object
    #[error("Not found: {0}")]
    NotFound(String),

    /// Snapshot already being created or already registered
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Snapshot exists but has not been committed yet
    #[error("Snapshot not usable: {0}")]
    NotUsable(String),

    /// Release called on a snapshot with no active consumers
    #[error("Snapshot not in use: {0}")]
    NotInUse(String),

    /// Snapshot still has active consumers
    #[error("Snapshot {id} is in use by {consumers} consumer(s)")]
    InUse { id: String, consumers: u32 },

    /// Eviction cannot free enough space for a new snapshot
    #[error("Insufficient space: need {needed_mib} MiB, {available_mib} MiB can be made available")]
    InsufficientSpace { needed_mib: i64, available_mib: i64 },

    /// Downloaded chunk failed integrity verification
    #[error("Corrupt chunk {hash}: {message}")]
    Corrupt { hash: String, message: String },

    /// Remote object store failed or is unreachable
    #[error("Object store unavailable: {0}")]
    Unavailable(String),

    /// Recipe length is not a multiple of the hash width
    #[error("Invalid recipe: {0}")]
    InvalidRecipe(String),

    /// Deadline elapsed
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Local filesystem error
    #[error("I/O error: {0}")]
    Io(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Chunk sealing or opening failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Admitting a snapshot failed after other snapshots were evicted.
    ///
    /// `evicted` holds their container snapshot names, which the caller
    /// still has to release.
    #[error("{cause} ({} snapshot(s) evicted)", .evicted.len())]
    InitFailed {
        evicted: Vec<String>,
        cause: Box<SnapshotError>,
    },
}

impl SnapshotError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::InitFailed { cause, .. } => cause.is_retryable(),
            _ => matches!(self, Self::Unavailable(_) | Self::Timeout(_) | Self::Io(_)),
        }
    }

    /// Whether the caller should give up on the snapshot path and cold boot.
    ///
    /// Remote and integrity failures leave the caller with no usable memory
    /// image; state errors (NotUsable, InUse, ...) are the caller's bug and
    /// should surface instead.
    pub fn is_cold_start_fallback(&self) -> bool {
        match self {
            Self::InitFailed { cause, .. } => cause.is_cold_start_fallback(),
            _ => matches!(
                self,
                Self::NotFound(_)
                    | Self::Corrupt { .. }
                    | Self::Unavailable(_)
                    | Self::Timeout(_)
                    | Self::InvalidRecipe(_)
                    | Self::InsufficientSpace { .. }
            ),
        }
    }

    /// Container snapshot names evicted before this error occurred.
    pub fn evicted_snapshots(&self) -> &[String] {
        match self {
            Self::InitFailed { evicted, .. } => evicted,
            _ => &[],
        }
    }

    /// Attach evicted snapshot names to an error. No-op when none were
    /// evicted.
    pub fn with_evicted(self, evicted: Vec<String>) -> Self {
        if evicted.is_empty() {
            return self;
        }
        match self {
            Self::InitFailed {
                evicted: mut earlier,
                cause,
            } => {
                earlier.extend(evicted);
                Self::InitFailed {
                    evicted: earlier,
                    cause,
                }
            }
            other => Self::InitFailed {
                evicted,
                cause: Box::new(other),
            },
        }
    }
}

impl From<std::io::Error> for SnapshotError {
    fn from(err: std::io::Error) -> Self {
        SnapshotError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for SnapshotError {
    fn from(err: serde_json::Error) -> Self {
        SnapshotError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for SnapshotError {
    fn from(err: serde_yaml::Error) -> Self {
        SnapshotError::Serialization(err.to_string())
    }
}

/// Result type alias for snapshot cache operations
pub type Result<T> = std::result::Result<T, SnapshotError>;
