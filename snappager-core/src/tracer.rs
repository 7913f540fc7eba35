// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Page fault tracer.
//!
//! Optional CSV audit sink: a `pfn` header, then one row per traced fault.
//! The output is directly usable as a working-set file for the next restore.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::PagerError;

/// Classification of a traced fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Resolved with `UFFDIO_CONTINUE`.
    Minor,
    /// Resolved with `UFFDIO_COPY` or `UFFDIO_ZEROPAGE`.
    Missing,
}

/// Writes traced PFNs to a CSV file. A disabled tracer ignores every call.
#[derive(Debug)]
pub struct PageFaultTracer {
    sink: Option<TraceSink>,
    handled: AtomicU64,
}

#[derive(Debug)]
struct TraceSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl PageFaultTracer {
    /// Tracer that records nothing.
    pub fn disabled() -> Self {
        Self {
            sink: None,
            handled: AtomicU64::new(0),
        }
    }

    /// Create (truncate) the trace file at `path` and write the header row.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, PagerError> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|e| PagerError::Io {
            context: "creating trace file",
            source: e,
        })?;

        let mut writer = BufWriter::new(file);
        writeln!(writer, "pfn").map_err(|e| PagerError::Io {
            context: "writing trace header",
            source: e,
        })?;

        tracing::debug!(path = %path.display(), "Page fault tracing enabled");

        Ok(Self {
            sink: Some(TraceSink {
                path: path.to_path_buf(),
                writer: Mutex::new(writer),
            }),
            handled: AtomicU64::new(0),
        })
    }

    /// Tracer for an optional path; `None` gives a disabled tracer.
    pub fn from_path(path: Option<&Path>) -> Result<Self, PagerError> {
        match path {
            Some(path) => Self::create(path),
            None => Ok(Self::disabled()),
        }
    }

    /// Check if tracing is enabled.
    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    /// Record one fault.
    ///
    /// `kind`, `hit` (a region or removed-page entry resolved the fault) and
    /// `removed` are accepted for classification but only the PFN is written.
    pub fn trace(&self, pfn: u64, kind: FaultKind, hit: bool, removed: bool) {
        let Some(sink) = &self.sink else {
            return;
        };

        self.handled.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(pfn = pfn, kind = ?kind, hit = hit, removed = removed, "Traced fault");

        let mut writer = match sink.writer.lock() {
            Ok(writer) => writer,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = writeln!(writer, "{}", pfn) {
            tracing::error!(path = %sink.path.display(), error = %e, "Failed to write trace row");
        }
    }

    /// Faults recorded so far.
    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }

    /// Flush buffered rows and log the number of handled faults.
    pub fn close(&self) -> Result<(), PagerError> {
        let Some(sink) = &self.sink else {
            return Ok(());
        };

        let mut writer = match sink.writer.lock() {
            Ok(writer) => writer,
            Err(poisoned) => poisoned.into_inner(),
        };
        writer.flush().map_err(|e| PagerError::Io {
            context: "flushing trace file",
            source: e,
        })?;

        tracing::info!(
            path = %sink.path.display(),
            handled_faults = self.handled(),
            "Page fault trace closed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::working_set::WorkingSet;

    #[test]
    fn test_disabled_tracer_is_noop() {
        let tracer = PageFaultTracer::disabled();
        tracer.trace(1, FaultKind::Missing, true, false);
        assert!(!tracer.is_enabled());
        assert_eq!(tracer.handled(), 0);
        assert!(tracer.close().is_ok());
    }

    #[test]
    fn test_trace_writes_pfn_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.csv");

        let tracer = PageFaultTracer::create(&path).unwrap();
        tracer.trace(5, FaultKind::Missing, true, false);
        tracer.trace(9, FaultKind::Minor, true, false);
        tracer.trace(2, FaultKind::Missing, false, true);
        tracer.close().unwrap();

        assert_eq!(tracer.handled(), 3);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "pfn\n5\n9\n2\n");
    }

    #[test]
    fn test_trace_output_loads_as_working_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.csv");

        let tracer = PageFaultTracer::from_path(Some(&path)).unwrap();
        tracer.trace(3, FaultKind::Missing, true, false);
        tracer.trace(1, FaultKind::Missing, true, false);
        tracer.close().unwrap();

        let set = WorkingSet::load(&path).unwrap();
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![1, 3]);
    }
}
