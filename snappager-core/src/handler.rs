// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Per-VM fault handler.
//!
//! One handler exists per hypervisor connection generation. It owns the
//! region table and the userfaultfd, tracks pages removed by the balloon
//! device and classifies each `uffd_msg` into a minor, missing or remove
//! event. Population itself is delegated to the shared [`PageOperations`].

use std::collections::HashSet;
use std::io;
use std::os::fd::RawFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use crate::error::{FaultError, PagerResult};
use crate::handshake::{receive_mappings_and_uffd, RegionTable};
use crate::pager::{InsertionGuard, PageOperations};
use crate::tracer::FaultKind;
use crate::types::{PageSize, Region};
use crate::uffd::abi::{event_name, UFFD_MSG_SIZE};
use crate::uffd::{FaultEvent, UffdFile, UserFault};

/// Passes of the deferred loop after which every further pass is logged.
const DEFERRAL_WARN_PASSES: usize = 1000;

pub struct UffdHandler {
    regions: RegionTable,
    uffd: Box<dyn UserFault>,
    removed_pages: HashSet<u64>,
    ops: Arc<PageOperations>,
    guard: InsertionGuard,
}

impl UffdHandler {
    /// Perform the handshake on `stream` and build a handler for the received descriptor.
    ///
    /// `expected_size` is the guest memory size the regions must add up to.
    pub fn from_unix_stream(
        stream: &UnixStream,
        ops: Arc<PageOperations>,
        expected_size: u64,
    ) -> PagerResult<Self> {
        let (body, uffd) = receive_mappings_and_uffd(stream)?;
        let regions = RegionTable::parse(&body, expected_size)?;
        let handler = Self::with_table(regions, Box::new(UffdFile::new(uffd)), ops);

        tracing::info!(
            uffd = handler.raw_fd(),
            regions = handler.regions.regions().len(),
            page_size = handler.page_size().bytes(),
            "UFFD handler registered"
        );
        Ok(handler)
    }

    /// Build a handler from an already decoded region list and descriptor.
    pub fn from_mappings(
        regions: Vec<Region>,
        uffd: Box<dyn UserFault>,
        ops: Arc<PageOperations>,
        expected_size: u64,
    ) -> PagerResult<Self> {
        let regions = RegionTable::new(regions, expected_size)?;
        Ok(Self::with_table(regions, uffd, ops))
    }

    fn with_table(regions: RegionTable, uffd: Box<dyn UserFault>, ops: Arc<PageOperations>) -> Self {
        Self {
            regions,
            uffd,
            removed_pages: HashSet::new(),
            ops,
            guard: InsertionGuard::new(),
        }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.uffd.raw_fd()
    }

    pub fn page_size(&self) -> PageSize {
        self.regions.page_size()
    }

    pub fn regions(&self) -> &[Region] {
        self.regions.regions()
    }

    /// Whether the page at `addr` was removed by the balloon device.
    pub fn is_removed(&self, addr: u64) -> bool {
        self.removed_pages.contains(&self.page_size().pfn(addr))
    }

    /// Read one event. `Ok(None)` when the queue is empty.
    pub fn read_event(&self) -> Result<Option<FaultEvent>, FaultError> {
        let mut buf = [0u8; UFFD_MSG_SIZE];
        loop {
            return match self.uffd.read_msg(&mut buf) {
                Ok(UFFD_MSG_SIZE) => Ok(Some(FaultEvent::decode(&buf))),
                Ok(got) => Err(FaultError::ShortRead {
                    got,
                    expected: UFFD_MSG_SIZE,
                }),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => Err(FaultError::ReadEvent { source: e }),
            };
        }
    }

    /// Mark every whole page frame in `[pfn(start), pfn(end))` as removed.
    ///
    /// A partial trailing page is left alone.
    pub fn mark_range_removed(&mut self, start: u64, end: u64) {
        let page_size = self.page_size();
        self.removed_pages.extend(page_size.pfn(start)..page_size.pfn(end));
        tracing::debug!(start = start, end = end, "Marked range removed");
    }

    /// Serve a missing fault at `addr`.
    ///
    /// Returns `Ok(false)` when the fault must be retried later.
    pub fn serve_pf(&self, addr: u64, len: u64) -> PagerResult<bool> {
        let page_size = self.page_size();
        let page = page_size.align_down(addr);
        let pfn = page_size.pfn(page);
        let tracer = self.ops.tracer();

        if self.removed_pages.contains(&pfn) {
            tracing::debug!(addr = addr, pfn = pfn, "Zero-filling removed page");
            let served = self.ops.zero_out(self.uffd.as_ref(), page, page_size);
            if served {
                tracer.trace(pfn, FaultKind::Missing, true, true);
            }
            return Ok(served);
        }

        let Some(region) = self.regions.find(page) else {
            tracing::warn!(addr = addr, "Fault outside every guest region");
            tracer.trace(pfn, FaultKind::Missing, false, false);
            return Err(FaultError::UnmappedAddress { addr }.into());
        };

        tracing::debug!(addr = addr, pfn = pfn, "Populating page");
        let served = self.ops.populate_from_file(
            self.uffd.as_ref(),
            &self.guard,
            region,
            page_size,
            page,
            len,
        )?;
        if served {
            tracer.trace(pfn, FaultKind::Missing, true, false);
        }
        Ok(served)
    }

    /// Handle one event. Returns false when it has to be deferred.
    pub fn handle_event(&mut self, event: FaultEvent) -> bool {
        match event {
            FaultEvent::Pagefault { address, .. } if event.is_minor() => {
                let page_size = self.page_size();
                let page = page_size.align_down(address);
                let served = self.ops.continue_page(self.uffd.as_ref(), page, page_size);
                if served {
                    self.ops
                        .tracer()
                        .trace(page_size.pfn(page), FaultKind::Minor, true, false);
                }
                served
            }
            FaultEvent::Pagefault { address, .. } => {
                match self.serve_pf(address, self.page_size().bytes()) {
                    Ok(served) => served,
                    Err(e) if e.is_transient() => {
                        tracing::warn!(addr = address, error = %e, "Deferring fault after fetch failure");
                        false
                    }
                    Err(e) => {
                        tracing::error!(addr = address, error = %e, "Dropping unserviceable fault");
                        true
                    }
                }
            }
            FaultEvent::Remove { start, end } => {
                self.mark_range_removed(start, end);
                true
            }
            FaultEvent::Other { event } => {
                tracing::warn!(
                    event = event,
                    name = event_name(event),
                    "Ignoring unexpected uffd event"
                );
                true
            }
        }
    }

    /// Standard dispatch for a readable descriptor.
    ///
    /// Deferred events are retried ahead of newly read ones; returns once a
    /// pass over the queue defers nothing.
    pub fn serve_pending_events(&mut self) -> PagerResult<()> {
        let mut deferred: Vec<FaultEvent> = Vec::new();
        let mut passes = 0usize;

        loop {
            let mut events = std::mem::take(&mut deferred);
            while let Some(event) = self.read_event()? {
                events.push(event);
            }

            for event in events {
                if !self.handle_event(event) {
                    deferred.push(event);
                }
            }

            if deferred.is_empty() {
                return Ok(());
            }

            passes += 1;
            if passes >= DEFERRAL_WARN_PASSES {
                tracing::warn!(
                    uffd = self.raw_fd(),
                    deferred = deferred.len(),
                    passes = passes,
                    "Events still deferred"
                );
            }
        }
    }
}

impl std::fmt::Debug for UffdHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UffdHandler")
            .field("uffd", &self.raw_fd())
            .field("regions", &self.regions)
            .field("removed_pages", &self.removed_pages.len())
            .field("working_set_inserted", &self.guard.is_claimed())
            .finish()
    }
}
