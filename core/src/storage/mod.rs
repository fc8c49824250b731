//! Remote object storage abstraction.
//!
//! The cache talks to a flat key/value object store. Chunks live under
//! `_chunks/<first two hex chars>/<hex>`, whole snapshot files under
//! `<revision>/<file name>`.

mod local;
mod memory;

pub use local::LocalObjectStorage;
pub use memory::MemoryObjectStorage;

use async_trait::async_trait;
use std::collections::BTreeSet;

use crate::error::Result;

/// Key prefix shared by all chunk objects.
pub const CHUNK_PREFIX: &str = "_chunks";

/// Object key of a whole snapshot file.
pub fn snapshot_object_key(revision: &str, file_name: &str) -> String {
    format!("{}/{}", revision, file_name)
}

/// Flat object store.
///
/// `download_object` fails with `NotFound` for a missing key and
/// `Unavailable` for any transport failure.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Store `data` under `key`, replacing any previous value.
    async fn upload_object(&self, key: &str, data: Vec<u8>) -> Result<()>;

    /// Fetch the object stored under `key`.
    async fn download_object(&self, key: &str) -> Result<Vec<u8>>;

    /// Whether an object is stored under `key`.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// List keys under `prefix`.
    ///
    /// Non-recursive listings collapse deeper keys into their next path
    /// segment followed by `/`, the way S3 reports common prefixes.
    async fn list_objects(&self, prefix: &str, recursive: bool) -> Result<Vec<String>>;
}

/// Filter `keys` by `prefix` and collapse them for non-recursive listings.
pub(crate) fn select_keys<I>(keys: I, prefix: &str, recursive: bool) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut selected = BTreeSet::new();
    for key in keys {
        let Some(rest) = key.strip_prefix(prefix) else {
            continue;
        };
        if recursive {
            selected.insert(key.clone());
            continue;
        }
        match rest.find('/') {
            Some(idx) => {
                selected.insert(format!("{}{}", prefix, &rest[..=idx]));
            }
            None => {
                selected.insert(key.clone());
            }
        }
    }
    selected.into_iter().collect()
}
