// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Content-addressed chunk retrieval for lazy restores.
//!
//! In lazy mode guest memory is described by a recipe of content hashes.
//! Chunks are fetched from a [`ChunkStore`] on first use and pinned in a
//! process-wide [`ChunkCache`].

mod cache;
mod flight;
mod store;

pub use cache::{Chunk, ChunkCache};
pub use flight::SingleFlight;
pub use store::DirChunkStore;

use crate::error::ChunkError;

/// Smallest chunk size accepted: one base page.
pub const MIN_CHUNK_SIZE: u64 = 4096;

/// Remote content-addressed store of memory chunks.
pub trait ChunkStore: Send + Sync {
    /// Bytes of guest memory covered by one recipe hash.
    fn chunk_size(&self) -> u64;

    /// Fetch the chunk named by a lowercase hex hash.
    ///
    /// May block on network I/O.
    fn download_and_return_chunk(&self, hex_hash: &str) -> Result<Vec<u8>, ChunkError>;
}

/// Check that `chunk_size` is a power of two of at least one base page.
pub fn validate_chunk_size(chunk_size: u64) -> Result<(), ChunkError> {
    if chunk_size < MIN_CHUNK_SIZE || !chunk_size.is_power_of_two() {
        return Err(ChunkError::InvalidChunkSize {
            chunk_size,
            reason: format!("must be a power of two >= {}", MIN_CHUNK_SIZE),
        });
    }
    Ok(())
}
