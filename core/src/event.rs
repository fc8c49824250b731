//! Snapshot and chunk lifecycle events.
//!
//! Managers and the chunk cache publish typed events on a broadcast
//! channel. Publishing never blocks; a subscriber that falls behind skips
//! the events it missed.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config::SensitivityMode;
use crate::hash::ChunkHash;

/// What happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SnapshotEventKind {
    Creating {
        revision: String,
    },
    Committed {
        revision: String,
    },
    /// Removed to make room; `container_snap_name` still has to be released.
    Evicted {
        revision: String,
        container_snap_name: String,
    },
    Deleted {
        revision: String,
    },
    Uploaded {
        revision: String,
        chunks: usize,
        uploaded: usize,
    },
    Downloaded {
        revision: String,
    },
    Recoded {
        revision: String,
        from: SensitivityMode,
        to: SensitivityMode,
        rewritten: usize,
    },
    ChunksEvicted {
        hashes: Vec<ChunkHash>,
    },
    ChunkCorrupt {
        hash: ChunkHash,
    },
}

impl SnapshotEventKind {
    /// Dotted event name, e.g. `snapshot.committed`.
    pub fn key(&self) -> &'static str {
        match self {
            Self::Creating { .. } => "snapshot.creating",
            Self::Committed { .. } => "snapshot.committed",
            Self::Evicted { .. } => "snapshot.evicted",
            Self::Deleted { .. } => "snapshot.deleted",
            Self::Uploaded { .. } => "snapshot.uploaded",
            Self::Downloaded { .. } => "snapshot.downloaded",
            Self::Recoded { .. } => "snapshot.recoded",
            Self::ChunksEvicted { .. } => "chunk.evicted",
            Self::ChunkCorrupt { .. } => "chunk.corrupt",
        }
    }

    /// Revision the event is about, `None` for chunk events.
    pub fn revision(&self) -> Option<&str> {
        match self {
            Self::Creating { revision }
            | Self::Committed { revision }
            | Self::Evicted { revision, .. }
            | Self::Deleted { revision }
            | Self::Uploaded { revision, .. }
            | Self::Downloaded { revision }
            | Self::Recoded { revision, .. } => Some(revision),
            Self::ChunksEvicted { .. } | Self::ChunkCorrupt { .. } => None,
        }
    }
}

/// A timestamped lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEvent {
    #[serde(flatten)]
    pub kind: SnapshotEventKind,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl SnapshotEvent {
    pub fn key(&self) -> &'static str {
        self.kind.key()
    }
}

/// Broadcasts lifecycle events to any number of subscribers.
#[derive(Clone)]
pub struct EventEmitter {
    sender: broadcast::Sender<SnapshotEvent>,
}

impl EventEmitter {
    /// Create an emitter that buffers up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Stamp and publish an event. Dropped when nobody is subscribed.
    pub fn emit(&self, kind: SnapshotEventKind) {
        let _ = self.sender.send(SnapshotEvent {
            kind,
            timestamp: chrono::Utc::now(),
        });
    }

    pub fn subscribe(&self) -> EventSubscriber {
        EventSubscriber {
            receiver: self.sender.subscribe(),
        }
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Receiving end of an [`EventEmitter`].
pub struct EventSubscriber {
    receiver: broadcast::Receiver<SnapshotEvent>,
}

impl EventSubscriber {
    /// Next event, or `None` once every emitter is gone.
    pub async fn recv(&mut self) -> Option<SnapshotEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next already-published event, without waiting.
    pub fn try_recv(&mut self) -> Option<SnapshotEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Drain everything published so far.
    pub fn drain(&mut self) -> Vec<SnapshotEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}
