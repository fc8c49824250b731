//! Chunk content addresses.

use md5::{Digest, Md5};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::{Path, PathBuf};

use crate::error::SnapshotError;

/// Width of a chunk hash in bytes.
pub const HASH_LEN: usize = 16;

/// 128-bit chunk address.
///
/// A plain hash is the MD5 of the chunk bytes. A sensitive chunk is stored
/// under `remap(plain, identity)`, which ties it to one snapshot.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkHash([u8; HASH_LEN]);

impl ChunkHash {
    pub const fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// Read a hash from a slice of exactly `HASH_LEN` bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; HASH_LEN] = bytes.try_into().ok()?;
        Some(Self(array))
    }

    /// Plain content hash of `data`.
    pub fn of(data: &[u8]) -> Self {
        Self::digest(&[data])
    }

    /// Identity-bound hash: MD5 over the hash bytes followed by the identity.
    pub fn remap(&self, identity: &str) -> Self {
        Self::digest(&[&self.0, identity.as_bytes()])
    }

    /// True when `data` hashes to `self` directly or after remapping with `identity`.
    pub fn matches(&self, data: &[u8], identity: &str) -> bool {
        let plain = Self::of(data);
        plain == *self || plain.remap(identity) == *self
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Object key of this chunk in the shared store: `_chunks/ab/abcd...`
    pub fn object_key(&self) -> String {
        let hex = self.to_hex();
        format!("{}/{}/{}", crate::storage::CHUNK_PREFIX, &hex[..2], hex)
    }

    /// Sharded path of this chunk below a local cache root: `root/ab/abcd...`
    pub fn shard_path(&self, root: &Path) -> PathBuf {
        let hex = self.to_hex();
        root.join(&hex[..2]).join(hex)
    }

    fn digest(parts: &[&[u8]]) -> Self {
        let mut hasher = Md5::new();
        for part in parts {
            hasher.update(part);
        }
        let mut out = [0u8; HASH_LEN];
        out.copy_from_slice(&hasher.finalize());
        Self(out)
    }
}

impl std::fmt::Display for ChunkHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::fmt::Debug for ChunkHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ChunkHash({})", self.to_hex())
    }
}

impl std::str::FromStr for ChunkHash {
    type Err = SnapshotError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let bytes = hex::decode(s)
            .map_err(|e| SnapshotError::Serialization(format!("Invalid chunk hash '{}': {}", s, e)))?;
        Self::from_slice(&bytes).ok_or_else(|| {
            SnapshotError::Serialization(format!(
                "Invalid chunk hash '{}': expected {} bytes, got {}",
                s,
                HASH_LEN,
                bytes.len()
            ))
        })
    }
}

impl Serialize for ChunkHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ChunkHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_of_matches_known_md5() {
        // md5("") and md5("abc")
        assert_eq!(ChunkHash::of(b"").to_hex(), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(ChunkHash::of(b"abc").to_hex(), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn test_remap_is_md5_of_hash_and_identity() {
        let plain = ChunkHash::of(b"page");
        let mut joined = plain.as_bytes().to_vec();
        joined.extend_from_slice(b"rev-1");
        assert_eq!(plain.remap("rev-1"), ChunkHash::of(&joined));
    }

    #[test]
    fn test_remap_depends_on_identity() {
        let plain = ChunkHash::of(b"page");
        assert_ne!(plain.remap("rev-1"), plain.remap("rev-2"));
        assert_ne!(plain.remap("rev-1"), plain);
        assert_eq!(plain.remap("rev-1"), plain.remap("rev-1"));
    }

    #[test]
    fn test_matches_plain_and_remapped() {
        let data = b"guest memory";
        let plain = ChunkHash::of(data);
        assert!(plain.matches(data, "rev-1"));
        assert!(plain.remap("rev-1").matches(data, "rev-1"));
        assert!(!plain.remap("rev-1").matches(data, "rev-2"));
        assert!(!plain.matches(b"other", "rev-1"));
    }

    #[test]
    fn test_object_key_and_shard_path() {
        let hash: ChunkHash = "0123456789abcdef0123456789abcdef".parse().unwrap();
        assert_eq!(hash.object_key(), "_chunks/01/0123456789abcdef0123456789abcdef");
        assert_eq!(
            hash.shard_path(Path::new("/cache")),
            PathBuf::from("/cache/01/0123456789abcdef0123456789abcdef")
        );
    }

    #[test]
    fn test_from_str_rejects_bad_input() {
        assert!("xyz".parse::<ChunkHash>().is_err());
        assert!("0123".parse::<ChunkHash>().is_err());
    }

    #[test]
    fn test_from_slice_length() {
        assert!(ChunkHash::from_slice(&[0u8; 16]).is_some());
        assert!(ChunkHash::from_slice(&[0u8; 15]).is_none());
    }

    #[test]
    fn test_serde_as_hex_string() {
        let hash = ChunkHash::of(b"abc");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, "\"900150983cd24fb0d6963f7d28e17f72\"");
        let back: ChunkHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }
}
