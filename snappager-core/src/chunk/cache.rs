//! Process-wide cache of fetched chunks using DashMap.
//!
//! Entries are never evicted: a chunk fetched once stays pinned for the life
//! of the process, which keeps every source pointer handed to the kernel valid.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use super::flight::SingleFlight;
use super::ChunkStore;
use crate::error::ChunkError;
use crate::types::ChunkHash;

/// One fetched chunk, pinned in memory.
#[derive(Debug)]
pub struct Chunk {
    hash: ChunkHash,
    bytes: Box<[u8]>,
}

impl Chunk {
    pub fn new(hash: ChunkHash, bytes: Vec<u8>) -> Self {
        Self {
            hash,
            bytes: bytes.into_boxed_slice(),
        }
    }

    pub fn hash(&self) -> ChunkHash {
        self.hash
    }

    /// Stable base address of the chunk bytes.
    pub fn address(&self) -> *const u8 {
        self.bytes.as_ptr()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Get-or-fetch cache keyed by content hash.
///
/// Requests for the same hash coalesce into one download; requests for
/// different hashes proceed independently.
pub struct ChunkCache {
    store: Arc<dyn ChunkStore>,
    /// Unbounded: no eviction policy.
    flights: DashMap<ChunkHash, Arc<SingleFlight<Chunk>>>,
    downloads: AtomicU64,
}

impl ChunkCache {
    pub fn new(store: Arc<dyn ChunkStore>) -> Self {
        Self {
            store,
            flights: DashMap::new(),
            downloads: AtomicU64::new(0),
        }
    }

    /// Chunk size of the underlying store.
    pub fn chunk_size(&self) -> u64 {
        self.store.chunk_size()
    }

    /// Resolve `hash` to pinned chunk bytes, downloading it on first use.
    pub fn map_chunk(&self, hash: ChunkHash) -> Result<Arc<Chunk>, ChunkError> {
        let flight = match self.flights.get(&hash) {
            Some(entry) => Arc::clone(entry.value()),
            None => Arc::clone(
                self.flights
                    .entry(hash)
                    .or_insert_with(|| Arc::new(SingleFlight::new()))
                    .value(),
            ),
        };

        flight.get_or_try_init(|| {
            let hex_hash = hash.to_hex();
            let started = std::time::Instant::now();
            let bytes = self.store.download_and_return_chunk(&hex_hash)?;
            self.downloads.fetch_add(1, Ordering::Relaxed);

            tracing::debug!(
                hash = %hex_hash,
                len = bytes.len(),
                elapsed_us = started.elapsed().as_micros() as u64,
                "Fetched chunk"
            );
            Ok(Chunk::new(hash, bytes))
        })
    }

    /// Number of completed downloads.
    pub fn downloads(&self) -> u64 {
        self.downloads.load(Ordering::Relaxed)
    }

    /// Number of hashes seen, fetched or in flight.
    pub fn len(&self) -> usize {
        self.flights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flights.is_empty()
    }
}

impl std::fmt::Debug for ChunkCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkCache")
            .field("chunk_size", &self.store.chunk_size())
            .field("entries", &self.flights.len())
            .field("downloads", &self.downloads())
            .finish()
    }
}
