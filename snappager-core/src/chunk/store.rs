//! Chunk store backed by a local directory.
//!
//! Each chunk lives in `<root>/<hex hash>`, the layout of a mounted or
//! pre-synced object-store cache.

use std::path::{Path, PathBuf};

use super::{validate_chunk_size, ChunkStore};
use crate::error::ChunkError;

#[derive(Debug, Clone)]
pub struct DirChunkStore {
    root: PathBuf,
    chunk_size: u64,
}

impl DirChunkStore {
    pub fn new(root: impl Into<PathBuf>, chunk_size: u64) -> Result<Self, ChunkError> {
        validate_chunk_size(chunk_size)?;
        Ok(Self {
            root: root.into(),
            chunk_size,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File holding the chunk named `hex_hash`.
    pub fn chunk_path(&self, hex_hash: &str) -> PathBuf {
        self.root.join(hex_hash)
    }
}

impl ChunkStore for DirChunkStore {
    fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    fn download_and_return_chunk(&self, hex_hash: &str) -> Result<Vec<u8>, ChunkError> {
        let path = self.chunk_path(hex_hash);
        std::fs::read(&path).map_err(|e| ChunkError::Download {
            hash: hex_hash.to_string(),
            reason: format!("{}: {}", path.display(), e),
        })
    }
}
