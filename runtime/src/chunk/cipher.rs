//! Chunk sealing for the shared object store.
//!
//! ## Key Derivation
//!
//! The sealing key is derived using HKDF-SHA256:
//! - IKM: the configured encryption secret
//! - Salt: "snapcache-chunk-v1"
//! - Info: "chunk-sealing"
//!
//! ## Encryption
//!
//! AES-256-GCM. The nonce is the first 12 bytes of the chunk's stored hash,
//! so sealing the same chunk twice yields the same object and deduplication
//! across uploads keeps working. A stored hash only ever names one plaintext,
//! so a nonce is never reused with different data.
//!
//! Sealed object format: `ciphertext || tag (16 bytes)`. The stored hash is
//! also bound as additional authenticated data.

use ring::aead::{self, Aad, BoundKey, Nonce, NonceSequence, NONCE_LEN};
use ring::hkdf;

use snapcache_core::error::{Result, SnapshotError};
use snapcache_core::hash::ChunkHash;

/// Salt for HKDF key derivation.
const HKDF_SALT: &[u8] = b"snapcache-chunk-v1";

/// HKDF info for the chunk sealing key.
const HKDF_INFO: &[u8] = b"chunk-sealing";

/// Seals and opens chunk payloads.
pub struct ChunkCipher {
    key: [u8; 32],
}

impl ChunkCipher {
    /// Derive the sealing key from a secret.
    pub fn new(secret: &[u8]) -> Result<Self> {
        if secret.is_empty() {
            return Err(SnapshotError::Config("encryption key must not be empty".to_string()));
        }

        let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, HKDF_SALT);
        let prk = salt.extract(secret);
        let info = [HKDF_INFO];
        let okm = prk
            .expand(&info, HkdfLen(32))
            .map_err(|_| SnapshotError::Crypto("HKDF expand failed".to_string()))?;

        let mut key = [0u8; 32];
        okm.fill(&mut key)
            .map_err(|_| SnapshotError::Crypto("HKDF fill failed".to_string()))?;

        Ok(Self { key })
    }

    /// Encrypt a chunk stored under `hash`.
    pub fn seal(&self, hash: &ChunkHash, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut in_out = plaintext.to_vec();
        let unbound_key = aead::UnboundKey::new(&aead::AES_256_GCM, &self.key)
            .map_err(|_| SnapshotError::Crypto("Failed to create AES-256-GCM key".to_string()))?;

        let mut sealing_key = aead::SealingKey::new(unbound_key, SingleNonce::for_hash(hash));
        sealing_key
            .seal_in_place_append_tag(Aad::from(hash.as_bytes()), &mut in_out)
            .map_err(|_| SnapshotError::Crypto(format!("AES-256-GCM seal failed for {}", hash)))?;

        Ok(in_out)
    }

    /// Decrypt a chunk stored under `hash`.
    ///
    /// A failed tag check means the object was altered or stored under the
    /// wrong key and is reported as `Corrupt`.
    pub fn open(&self, hash: &ChunkHash, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < aead::AES_256_GCM.tag_len() {
            return Err(SnapshotError::Corrupt {
                hash: hash.to_hex(),
                message: "sealed chunk shorter than tag".to_string(),
            });
        }

        let mut in_out = sealed.to_vec();
        let unbound_key = aead::UnboundKey::new(&aead::AES_256_GCM, &self.key)
            .map_err(|_| SnapshotError::Crypto("Failed to create AES-256-GCM key".to_string()))?;

        let mut opening_key = aead::OpeningKey::new(unbound_key, SingleNonce::for_hash(hash));
        let plaintext = opening_key
            .open_in_place(Aad::from(hash.as_bytes()), &mut in_out)
            .map_err(|_| SnapshotError::Corrupt {
                hash: hash.to_hex(),
                message: "authentication tag mismatch".to_string(),
            })?;

        Ok(plaintext.to_vec())
    }
}

impl std::fmt::Debug for ChunkCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkCipher").finish_non_exhaustive()
    }
}

/// A NonceSequence that yields a single nonce then fails.
struct SingleNonce {
    nonce: Option<[u8; NONCE_LEN]>,
}

impl SingleNonce {
    fn for_hash(hash: &ChunkHash) -> Self {
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&hash.as_bytes()[..NONCE_LEN]);
        Self { nonce: Some(nonce) }
    }
}

impl NonceSequence for SingleNonce {
    fn advance(&mut self) -> std::result::Result<Nonce, ring::error::Unspecified> {
        self.nonce
            .take()
            .map(Nonce::assume_unique_for_key)
            .ok_or(ring::error::Unspecified)
    }
}

/// HKDF output length wrapper for ring.
struct HkdfLen(usize);

impl hkdf::KeyType for HkdfLen {
    fn len(&self) -> usize {
        self.0
    }
}
