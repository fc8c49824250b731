//! Fixed-size chunking of memory files.

use std::path::Path;

use tokio::io::{AsyncRead, AsyncReadExt};

use snapcache_core::error::{Result, SnapshotError};
use snapcache_core::hash::ChunkHash;

/// One chunk of a file: its plain hash and where it sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    pub hash: ChunkHash,
    pub offset: u64,
    pub len: usize,
}

/// Splits byte streams into `chunk_size` pieces.
///
/// Every chunk is exactly `chunk_size` bytes except possibly the last one,
/// which is hashed over its real length without padding.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    chunk_size: usize,
}

impl Chunker {
    pub fn new(chunk_size: u64) -> Result<Self> {
        if chunk_size == 0 {
            return Err(SnapshotError::Config("chunk_size must be positive".to_string()));
        }
        let chunk_size = usize::try_from(chunk_size)
            .map_err(|_| SnapshotError::Config(format!("chunk_size {} too large", chunk_size)))?;
        Ok(Self { chunk_size })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Number of chunks a file of `len` bytes splits into.
    pub fn chunk_count(&self, len: u64) -> usize {
        len.div_ceil(self.chunk_size as u64) as usize
    }

    /// Hash every chunk of an in-memory buffer.
    pub fn chunk_bytes(&self, data: &[u8]) -> Vec<ChunkSpan> {
        data.chunks(self.chunk_size)
            .enumerate()
            .map(|(i, chunk)| ChunkSpan {
                hash: ChunkHash::of(chunk),
                offset: (i * self.chunk_size) as u64,
                len: chunk.len(),
            })
            .collect()
    }

    /// Hash every chunk of a file.
    pub async fn chunk_file(&self, path: &Path) -> Result<Vec<ChunkSpan>> {
        let mut file = tokio::fs::File::open(path).await.map_err(|e| {
            SnapshotError::Io(format!("Failed to open {}: {}", path.display(), e))
        })?;

        let mut spans = Vec::new();
        let mut buf = vec![0u8; self.chunk_size];
        let mut offset = 0u64;
        loop {
            let n = self.read_chunk(&mut file, &mut buf).await?;
            if n == 0 {
                break;
            }
            spans.push(ChunkSpan {
                hash: ChunkHash::of(&buf[..n]),
                offset,
                len: n,
            });
            offset += n as u64;
            if n < self.chunk_size {
                break;
            }
        }
        Ok(spans)
    }

    /// Fill `buf` from `reader` until it holds a whole chunk or the input ends.
    ///
    /// Returns the number of bytes read; `0` means end of input.
    pub async fn read_chunk<R>(&self, reader: &mut R, buf: &mut [u8]) -> Result<usize>
    where
        R: AsyncRead + Unpin,
    {
        let want = self.chunk_size.min(buf.len());
        let mut filled = 0;
        while filled < want {
            let n = reader.read(&mut buf[filled..want]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    /// Hash of `data` zero-padded to a full chunk.
    ///
    /// Used for reference chunks taken from image archives, whose file
    /// tails are page-aligned once loaded into guest memory.
    pub fn padded_hash(&self, data: &[u8]) -> ChunkHash {
        if data.len() >= self.chunk_size {
            return ChunkHash::of(&data[..self.chunk_size]);
        }
        let mut padded = vec![0u8; self.chunk_size];
        padded[..data.len()].copy_from_slice(data);
        ChunkHash::of(&padded)
    }
}
