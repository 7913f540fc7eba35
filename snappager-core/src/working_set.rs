// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Working set of pages touched right after a restore.
//!
//! Loaded once from a CSV file (a header row, then one base-10 PFN per row),
//! usually the trace of a previous run. Immutable after loading.

use std::collections::BTreeSet;
use std::path::Path;

use crate::error::WorkingSetError;
use crate::types::{PageSize, Region};

/// Ordered set of page frame numbers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkingSet {
    pfns: BTreeSet<u64>,
}

impl WorkingSet {
    /// An empty working set; pre-population becomes a no-op.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from PFNs directly.
    pub fn from_pfns(pfns: impl IntoIterator<Item = u64>) -> Self {
        Self {
            pfns: pfns.into_iter().collect(),
        }
    }

    /// Load a working-set CSV file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, WorkingSetError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| WorkingSetError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;

        let set = Self::parse(&content)?;
        tracing::info!(path = %path.display(), pages = set.len(), "Loaded working set");
        Ok(set)
    }

    /// Parse CSV content. The first line is a header and is skipped.
    pub fn parse(content: &str) -> Result<Self, WorkingSetError> {
        let mut pfns = BTreeSet::new();

        for (index, row) in content.lines().enumerate().skip(1) {
            let field = row.split(',').next().unwrap_or_default().trim();
            if field.is_empty() {
                continue;
            }

            let pfn = field
                .parse::<u64>()
                .map_err(|e| WorkingSetError::MalformedRow {
                    line: index + 1,
                    row: row.to_string(),
                    reason: e.to_string(),
                })?;
            pfns.insert(pfn);
        }

        Ok(Self { pfns })
    }

    /// PFNs whose byte address falls inside `region`, in ascending order.
    pub fn pfns_in(&self, region: &Region, page_size: PageSize) -> Vec<u64> {
        let first = page_size.pfn(region.base_host_virt_addr);
        let end = region.base_host_virt_addr.saturating_add(region.size);
        self.pfns
            .range(first..)
            .copied()
            .take_while(|&pfn| page_size.addr_of(pfn) < end)
            .filter(|&pfn| region.contains(page_size.addr_of(pfn)))
            .collect()
    }

    /// Number of PFNs.
    pub fn len(&self) -> usize {
        self.pfns.len()
    }

    /// Check if the working set is empty.
    pub fn is_empty(&self) -> bool {
        self.pfns.is_empty()
    }

    /// Iterate PFNs in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.pfns.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(base: u64, size: u64) -> Region {
        Region {
            base_host_virt_addr: base,
            size,
            file_offset: 0,
            page_size: 4096,
        }
    }

    #[test]
    fn test_parse_skips_header_and_blank_rows() {
        let set = WorkingSet::parse("pfn\n3\n1\n\n2\n3\n").unwrap();
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_parse_takes_first_column() {
        let set = WorkingSet::parse("pfn,hit\n7,1\n 9 ,0\n").unwrap();
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![7, 9]);
    }

    #[test]
    fn test_parse_malformed_row() {
        let err = WorkingSet::parse("pfn\n1\n0x10\n").unwrap_err();
        match err {
            WorkingSetError::MalformedRow { line, row, .. } => {
                assert_eq!(line, 3);
                assert_eq!(row, "0x10");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_header_only_is_empty() {
        assert!(WorkingSet::parse("pfn\n").unwrap().is_empty());
        assert!(WorkingSet::parse("").unwrap().is_empty());
    }

    #[test]
    fn test_pfns_in_region() {
        let ps = PageSize::new(4096).unwrap();
        let set = WorkingSet::from_pfns([0, 1, 2, 3, 4, 10]);

        // [0x1000, 0x3000) holds PFNs 1 and 2.
        assert_eq!(set.pfns_in(&region(0x1000, 0x2000), ps), vec![1, 2]);
        assert_eq!(set.pfns_in(&region(0x3000, 0x1000), ps), vec![3]);
        assert!(set.pfns_in(&region(0x5000, 0x4000), ps).is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ws.csv");
        std::fs::write(&path, "pfn\n42\n").unwrap();

        let set = WorkingSet::load(&path).unwrap();
        assert_eq!(set.len(), 1);

        assert!(WorkingSet::load(dir.path().join("missing.csv")).is_err());
    }
}
