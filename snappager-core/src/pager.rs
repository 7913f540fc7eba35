// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Page population operations shared by every handler of a runtime.
//!
//! Resolves a faulting page to source bytes, either in the mapped backing
//! file or in a remotely fetched chunk, and issues the population ioctls.
//! The first fault of each handler also pre-populates the working set.

use std::fs::File;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crate::chunk::{validate_chunk_size, Chunk, ChunkCache, ChunkStore};
use crate::error::{ChunkError, FaultError, PagerError, PagerResult};
use crate::memory::BackingMemory;
use crate::tracer::PageFaultTracer;
use crate::types::{ChunkHash, PageSize, Region, HASH_SIZE};
use crate::uffd::abi::{
    UffdioContinue, UffdioCopy, UffdioRange, UffdioZeropage, UFFDIO_COPY_MODE_DONTWAKE,
};
use crate::uffd::UserFault;
use crate::working_set::WorkingSet;

/// Where guest memory contents come from.
#[derive(Debug)]
pub enum BackingSource {
    /// The mapped file is raw guest memory.
    Local(BackingMemory),
    /// The mapped file is a recipe of one hash per chunk of guest memory.
    Lazy {
        recipe: BackingMemory,
        chunks: ChunkCache,
    },
}

impl BackingSource {
    /// Map `file` and pick the eager or lazy interpretation.
    pub fn open(
        file: &File,
        lazy: bool,
        chunk_store: Option<Arc<dyn ChunkStore>>,
    ) -> PagerResult<Self> {
        let mapped = BackingMemory::map(file)?;
        if !lazy {
            return Ok(Self::Local(mapped));
        }

        let store = chunk_store.ok_or(ChunkError::StoreMissing)?;
        validate_chunk_size(store.chunk_size())?;
        Ok(Self::Lazy {
            recipe: mapped,
            chunks: ChunkCache::new(store),
        })
    }

    /// Size of the guest memory this source describes.
    pub fn logical_size(&self) -> u64 {
        match self {
            Self::Local(mem) => mem.size() as u64,
            Self::Lazy { recipe, chunks } => {
                (recipe.size() as u64).saturating_mul(chunks.chunk_size()) / HASH_SIZE as u64
            }
        }
    }

    pub fn is_lazy(&self) -> bool {
        matches!(self, Self::Lazy { .. })
    }
}

/// Offset of the recipe hash covering `file_offset`.
pub fn recipe_offset(file_offset: u64, chunk_size: u64) -> u64 {
    file_offset / chunk_size * HASH_SIZE as u64
}

/// Source bytes for one population ioctl. Keeps a fetched chunk alive.
enum SourcePage<'a> {
    Local(&'a [u8]),
    Chunk { chunk: Arc<Chunk>, offset: usize },
}

impl SourcePage<'_> {
    fn address(&self) -> u64 {
        match self {
            Self::Local(bytes) => bytes.as_ptr() as u64,
            Self::Chunk { chunk, offset } => chunk.address() as u64 + *offset as u64,
        }
    }
}

/// One-shot flag claimed by the first populate call of a handler.
#[derive(Debug, Default)]
pub struct InsertionGuard(AtomicBool);

impl InsertionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// True for exactly one caller.
    pub fn try_claim(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_claimed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

fn errno(err: &io::Error) -> i32 {
    err.raw_os_error().unwrap_or_default()
}

/// Thread-safe population operations shared across all handlers of a runtime.
#[derive(Debug)]
pub struct PageOperations {
    source: BackingSource,
    working_set: WorkingSet,
    threads: usize,
    tracer: PageFaultTracer,
}

impl PageOperations {
    pub fn new(
        source: BackingSource,
        working_set: WorkingSet,
        threads: usize,
        tracer: PageFaultTracer,
    ) -> Self {
        Self {
            source,
            working_set,
            threads: threads.max(1),
            tracer,
        }
    }

    pub fn source(&self) -> &BackingSource {
        &self.source
    }

    pub fn tracer(&self) -> &PageFaultTracer {
        &self.tracer
    }

    pub fn working_set(&self) -> &WorkingSet {
        &self.working_set
    }

    /// Offset of `dst` in the backing source, rejecting offsets past `u64::MAX`.
    fn source_offset(&self, region: &Region, dst: u64, len: u64) -> Result<u64, FaultError> {
        region
            .file_offset_of(dst)
            .ok_or(FaultError::SourceOutOfBounds {
                offset: region.file_offset,
                len,
                size: self.source.logical_size(),
            })
    }

    /// Resolve `len` bytes at `file_offset` of the logical backing file.
    fn resolve_source(&self, file_offset: u64, len: u64) -> PagerResult<SourcePage<'_>> {
        match &self.source {
            BackingSource::Local(mem) => mem
                .get(file_offset, len)
                .map(SourcePage::Local)
                .ok_or_else(|| {
                    FaultError::SourceOutOfBounds {
                        offset: file_offset,
                        len,
                        size: mem.size() as u64,
                    }
                    .into()
                }),
            BackingSource::Lazy { recipe, chunks } => {
                let chunk_size = chunks.chunk_size();
                let at = recipe_offset(file_offset, chunk_size);
                let hash = recipe
                    .get(at, HASH_SIZE as u64)
                    .and_then(ChunkHash::from_slice)
                    .ok_or(FaultError::RecipeOutOfBounds {
                        offset: at,
                        size: recipe.size() as u64,
                    })?;

                let chunk = chunks.map_chunk(hash)?;
                let offset = (file_offset % chunk_size) as usize;
                let needed = offset + len as usize;
                if chunk.len() < needed {
                    return Err(ChunkError::TooShort {
                        hash: hash.to_hex(),
                        len: chunk.len(),
                        needed,
                    }
                    .into());
                }
                Ok(SourcePage::Chunk { chunk, offset })
            }
        }
    }

    /// Resolve a content hash to pinned chunk bytes. Lazy mode only.
    pub fn map_chunk(&self, hash: ChunkHash) -> PagerResult<Arc<Chunk>> {
        match &self.source {
            BackingSource::Lazy { chunks, .. } => Ok(chunks.map_chunk(hash)?),
            BackingSource::Local(_) => Err(ChunkError::StoreMissing.into()),
        }
    }

    /// Populate the page at `dst` from the backing source with `UFFDIO_COPY`.
    ///
    /// Returns `Ok(false)` when the kernel asks to retry later (`EAGAIN`).
    /// Unexpected errno values are logged and reported as handled.
    /// Source resolution failures, including remote fetch errors, are returned.
    pub fn populate_from_file(
        &self,
        uffd: &dyn UserFault,
        guard: &InsertionGuard,
        region: &Region,
        page_size: PageSize,
        dst: u64,
        len: u64,
    ) -> PagerResult<bool> {
        if guard.try_claim() {
            self.insert_working_set(uffd, region, page_size);
        }

        let src = self.resolve_source(self.source_offset(region, dst, len)?, len)?;

        match uffd.copy(UffdioCopy::new(dst, src.address(), len, 0)) {
            Ok(_) => Ok(true),
            Err(e) if errno(&e) == libc::EAGAIN => Ok(false),
            Err(e) if errno(&e) == libc::EEXIST => {
                // Someone else populated it; make sure the faulting thread runs.
                if let Err(e) = uffd.wake(UffdioRange { start: dst, len }) {
                    tracing::error!(dst = dst, error = %e, "UFFDIO_WAKE failed");
                }
                Ok(true)
            }
            Err(e) => {
                tracing::error!(dst = dst, len = len, error = %e, "UFFDIO_COPY failed");
                Ok(true)
            }
        }
    }

    /// Map a zero page at `addr`.
    ///
    /// Returns false on `EAGAIN`; other errno values are logged and reported as handled.
    pub fn zero_out(&self, uffd: &dyn UserFault, addr: u64, page_size: PageSize) -> bool {
        match uffd.zeropage(UffdioZeropage::new(addr, page_size.bytes(), 0)) {
            Ok(_) => true,
            Err(e) if errno(&e) == libc::EAGAIN => false,
            Err(e) => {
                tracing::error!(addr = addr, error = %e, "UFFDIO_ZEROPAGE failed");
                true
            }
        }
    }

    /// Resolve a minor fault at `addr` by mapping the existing page-cache page.
    ///
    /// Returns false on `EAGAIN`; other errno values are logged and reported as handled.
    pub fn continue_page(&self, uffd: &dyn UserFault, addr: u64, page_size: PageSize) -> bool {
        match uffd.continue_range(UffdioContinue::new(addr, page_size.bytes())) {
            Ok(_) => true,
            Err(e) if errno(&e) == libc::EAGAIN => false,
            Err(e) => {
                tracing::error!(addr = addr, error = %e, "UFFDIO_CONTINUE failed");
                true
            }
        }
    }

    /// Pre-populate every working-set page inside `region` without waking waiters.
    ///
    /// Pages are spread over a fixed pool of worker threads; the call returns
    /// once the whole batch has settled. Returns the number of pages copied.
    pub fn insert_working_set(
        &self,
        uffd: &dyn UserFault,
        region: &Region,
        page_size: PageSize,
    ) -> usize {
        let pfns = self.working_set.pfns_in(region, page_size);
        if pfns.is_empty() {
            return 0;
        }

        let started = Instant::now();
        let workers = self.threads.min(pfns.len());
        let next = AtomicUsize::new(0);
        let inserted = AtomicUsize::new(0);

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    while let Some(&pfn) = pfns.get(next.fetch_add(1, Ordering::Relaxed)) {
                        if self.prefetch_page(uffd, region, page_size, page_size.addr_of(pfn)) {
                            inserted.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
        });

        let inserted = inserted.into_inner();
        tracing::info!(
            region_base = region.base_host_virt_addr,
            pages = pfns.len(),
            inserted = inserted,
            workers = workers,
            elapsed_us = started.elapsed().as_micros() as u64,
            "Working set inserted"
        );
        inserted
    }

    fn prefetch_page(
        &self,
        uffd: &dyn UserFault,
        region: &Region,
        page_size: PageSize,
        dst: u64,
    ) -> bool {
        let len = page_size.bytes();
        let src = match self
            .source_offset(region, dst, len)
            .map_err(PagerError::from)
            .and_then(|offset| self.resolve_source(offset, len))
        {
            Ok(src) => src,
            Err(e) => {
                tracing::warn!(dst = dst, error = %e, "Cannot resolve working-set page");
                return false;
            }
        };

        match uffd.copy(UffdioCopy::new(dst, src.address(), len, UFFDIO_COPY_MODE_DONTWAKE)) {
            Ok(_) => true,
            Err(e) if errno(&e) == libc::EEXIST || errno(&e) == libc::EAGAIN => false,
            Err(e) => {
                tracing::warn!(dst = dst, error = %e, "Working-set UFFDIO_COPY failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_recipe_offset() {
        assert_eq!(recipe_offset(8192, 4096), 32);
        assert_eq!(recipe_offset(8191, 4096), 16);
        assert_eq!(recipe_offset(0, 2 * 1024 * 1024), 0);
    }

    #[test]
    fn test_insertion_guard_claims_once() {
        let guard = InsertionGuard::new();
        assert!(!guard.is_claimed());
        assert!(guard.try_claim());
        assert!(!guard.try_claim());
        assert!(guard.is_claimed());
    }

    #[test]
    fn test_local_logical_size() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&[0u8; 8192]).unwrap();
        let source = BackingSource::open(&file, false, None).unwrap();
        assert!(!source.is_lazy());
        assert_eq!(source.logical_size(), 8192);
    }

    #[test]
    fn test_lazy_requires_store() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&[0u8; 32]).unwrap();
        assert!(BackingSource::open(&file, true, None).is_err());
    }
}
