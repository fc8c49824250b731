//! Reference chunk sets for `partial` sensitivity.
//!
//! Chunks that also appear in public material (the container image, the
//! guest rootfs, the base snapshot every function boots from) cannot carry
//! private data and are safe to share.

use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::path::Path;

use parking_lot::RwLock;

use snapcache_core::error::{Result, SnapshotError};
use snapcache_core::hash::ChunkHash;

use super::SensitivityPolicy;
use crate::chunk::{Chunker, Recipe};

/// Archive holding an image's filesystem, below `<images_dir>/<image>/`.
pub const CONTAINER_TAR: &str = "container.tar";

/// Archive holding the shared guest rootfs, below `<images_dir>/`.
pub const ROOTFS_TAR: &str = "rootfs.tar";

/// Known non-sensitive chunk hashes, per image and shared.
pub struct ReferenceChunkSet {
    chunker: Chunker,
    images: RwLock<HashMap<String, HashSet<ChunkHash>>>,
    rootfs: RwLock<HashSet<ChunkHash>>,
    base: RwLock<HashSet<ChunkHash>>,
}

impl ReferenceChunkSet {
    pub fn new(chunk_size: u64) -> Result<Self> {
        Ok(Self {
            chunker: Chunker::new(chunk_size)?,
            images: RwLock::new(HashMap::new()),
            rootfs: RwLock::new(HashSet::new()),
            base: RwLock::new(HashSet::new()),
        })
    }

    /// Short image name: the last path segment without its tag.
    ///
    /// `docker.io/library/nginx:1.25` becomes `nginx`.
    pub fn normalize_image_name(image: &str) -> &str {
        let name = image.rsplit('/').next().unwrap_or(image);
        name.split(':').next().unwrap_or(name)
    }

    pub fn add_image_chunks(&self, image: &str, hashes: impl IntoIterator<Item = ChunkHash>) {
        let name = Self::normalize_image_name(image).to_string();
        self.images.write().entry(name).or_default().extend(hashes);
    }

    pub fn add_rootfs_chunks(&self, hashes: impl IntoIterator<Item = ChunkHash>) {
        self.rootfs.write().extend(hashes);
    }

    /// Treat every chunk of the base snapshot's memory as shareable.
    pub fn load_base_recipe(&self, recipe: &Recipe) -> usize {
        let mut base = self.base.write();
        base.extend(recipe.iter().copied());
        base.len()
    }

    /// Hash every file in an image archive.
    pub async fn load_image_tar(&self, image: &str, path: &Path) -> Result<usize> {
        let hashes = self.hash_tar(path).await?;
        let count = hashes.len();
        self.add_image_chunks(image, hashes);

        tracing::debug!(image, path = %path.display(), chunks = count, "Loaded image reference chunks");
        Ok(count)
    }

    /// Hash every file in the guest rootfs archive.
    pub async fn load_rootfs_tar(&self, path: &Path) -> Result<usize> {
        let hashes = self.hash_tar(path).await?;
        let count = hashes.len();
        self.add_rootfs_chunks(hashes);

        tracing::debug!(path = %path.display(), chunks = count, "Loaded rootfs reference chunks");
        Ok(count)
    }

    /// Load `<dir>/rootfs.tar` and every `<dir>/<image>/container.tar`.
    ///
    /// Returns the number of archives loaded.
    pub async fn load_images_dir(&self, dir: &Path) -> Result<usize> {
        let mut loaded = 0;

        let rootfs = dir.join(ROOTFS_TAR);
        if tokio::fs::metadata(&rootfs).await.is_ok() {
            self.load_rootfs_tar(&rootfs).await?;
            loaded += 1;
        }

        let mut entries = tokio::fs::read_dir(dir).await.map_err(|e| {
            SnapshotError::Io(format!("Failed to read images dir {}: {}", dir.display(), e))
        })?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let archive = entry.path().join(CONTAINER_TAR);
            if tokio::fs::metadata(&archive).await.is_err() {
                continue;
            }
            let image = entry.file_name().to_string_lossy().into_owned();
            self.load_image_tar(&image, &archive).await?;
            loaded += 1;
        }

        tracing::info!(dir = %dir.display(), archives = loaded, "Loaded reference images");
        Ok(loaded)
    }

    /// Number of reference chunks known for `image`.
    pub fn image_chunk_count(&self, image: &str) -> usize {
        self.images
            .read()
            .get(Self::normalize_image_name(image))
            .map_or(0, HashSet::len)
    }

    pub fn base_chunk_count(&self) -> usize {
        self.base.read().len()
    }

    async fn hash_tar(&self, path: &Path) -> Result<HashSet<ChunkHash>> {
        let chunker = self.chunker;
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || hash_tar_entries(&chunker, &path))
            .await
            .map_err(|e| SnapshotError::Io(format!("Archive hashing task failed: {}", e)))?
    }
}

impl SensitivityPolicy for ReferenceChunkSet {
    fn is_sensitive(&self, hash: &ChunkHash, image: &str) -> bool {
        if image.is_empty() {
            return false;
        }

        let name = Self::normalize_image_name(image);
        if self
            .images
            .read()
            .get(name)
            .is_some_and(|chunks| chunks.contains(hash))
        {
            return false;
        }
        if self.rootfs.read().contains(hash) || self.base.read().contains(hash) {
            return false;
        }
        true
    }
}

impl std::fmt::Debug for ReferenceChunkSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceChunkSet")
            .field("images", &self.images.read().len())
            .field("rootfs", &self.rootfs.read().len())
            .field("base", &self.base.read().len())
            .finish()
    }
}

/// Chunk every regular file in a tar archive; file tails are zero-padded.
fn hash_tar_entries(chunker: &Chunker, path: &Path) -> Result<HashSet<ChunkHash>> {
    let file = std::fs::File::open(path).map_err(|e| {
        SnapshotError::Io(format!("Failed to open archive {}: {}", path.display(), e))
    })?;
    let mut archive = tar::Archive::new(file);
    let mut hashes = HashSet::new();
    let mut buf = vec![0u8; chunker.chunk_size()];

    let entries = archive.entries().map_err(|e| {
        SnapshotError::Io(format!("Failed to read archive {}: {}", path.display(), e))
    })?;
    for entry in entries {
        let mut entry = entry.map_err(|e| {
            SnapshotError::Io(format!("Corrupt archive entry in {}: {}", path.display(), e))
        })?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        loop {
            let mut filled = 0;
            while filled < buf.len() {
                let n = entry.read(&mut buf[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                break;
            }
            hashes.insert(chunker.padded_hash(&buf[..filled]));
            if filled < buf.len() {
                break;
            }
        }
    }
    Ok(hashes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_tar(path: &Path, files: &[(&str, &[u8])]) {
        let file = std::fs::File::create(path).unwrap();
        let mut builder = tar::Builder::new(file);
        for (name, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.finish().unwrap();
    }

    #[test]
    fn test_normalize_image_name() {
        assert_eq!(ReferenceChunkSet::normalize_image_name("docker.io/library/nginx:1.25"), "nginx");
        assert_eq!(ReferenceChunkSet::normalize_image_name("localhost:5000/app:latest"), "app");
        assert_eq!(ReferenceChunkSet::normalize_image_name("base"), "base");
    }

    #[test]
    fn test_empty_image_is_never_sensitive() {
        let set = ReferenceChunkSet::new(4096).unwrap();
        assert!(!set.is_sensitive(&ChunkHash::of(b"anything"), ""));
    }

    #[test]
    fn test_unknown_chunk_is_sensitive() {
        let set = ReferenceChunkSet::new(4096).unwrap();
        assert!(set.is_sensitive(&ChunkHash::of(b"private"), "nginx"));
    }

    #[test]
    fn test_image_chunks_match_by_normalized_name() {
        let set = ReferenceChunkSet::new(4096).unwrap();
        let hash = ChunkHash::of(b"libc page");
        set.add_image_chunks("nginx", [hash]);

        assert!(!set.is_sensitive(&hash, "docker.io/library/nginx:1.25"));
        assert!(set.is_sensitive(&hash, "redis"));
        assert_eq!(set.image_chunk_count("nginx:latest"), 1);
    }

    #[test]
    fn test_base_recipe_chunks_are_shareable() {
        let set = ReferenceChunkSet::new(4096).unwrap();
        let hash = ChunkHash::of(b"kernel page");
        set.load_base_recipe(&Recipe::from_hashes(vec![hash]));

        assert!(!set.is_sensitive(&hash, "base"));
        assert!(!set.is_sensitive(&hash, "nginx"));
        assert_eq!(set.base_chunk_count(), 1);
    }

    #[test]
    fn test_rootfs_chunks_are_shareable() {
        let set = ReferenceChunkSet::new(4096).unwrap();
        let hash = ChunkHash::of(b"busybox");
        set.add_rootfs_chunks([hash]);
        assert!(!set.is_sensitive(&hash, "any-image"));
    }

    #[tokio::test]
    async fn test_load_image_tar_pads_tails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("container.tar");
        let mut content = vec![7u8; 4];
        content.extend_from_slice(b"ab");
        write_tar(&path, &[("bin/app", content.as_slice())]);

        let set = ReferenceChunkSet::new(4).unwrap();
        assert_eq!(set.load_image_tar("app", &path).await.unwrap(), 2);

        assert!(!set.is_sensitive(&ChunkHash::of(&[7, 7, 7, 7]), "app"));
        assert!(!set.is_sensitive(&ChunkHash::of(&[b'a', b'b', 0, 0]), "app"));
        assert!(set.is_sensitive(&ChunkHash::of(b"ab"), "app"));
    }

    #[tokio::test]
    async fn test_load_images_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("nginx")).unwrap();
        write_tar(&dir.path().join("nginx").join(CONTAINER_TAR), &[("etc/nginx.conf", &b"worker"[..])]);
        write_tar(&dir.path().join(ROOTFS_TAR), &[("sbin/init", &b"init"[..])]);

        let set = ReferenceChunkSet::new(4096).unwrap();
        assert_eq!(set.load_images_dir(dir.path()).await.unwrap(), 2);
        assert_eq!(set.image_chunk_count("nginx"), 1);

        let padded_init = Chunker::new(4096).unwrap().padded_hash(b"init");
        assert!(!set.is_sensitive(&padded_init, "redis"));
    }
}
