// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Newtype wrappers for validated inputs.
//!
//! All types validate their invariants at creation time.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::HardValidationError;

/// Size in bytes of one content hash in a lazy-mode recipe file.
pub const HASH_SIZE: usize = 16;

/// One contiguous guest-memory range and where its contents live in the backing source.
///
/// This is the JSON object the hypervisor sends for every region during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    /// Host virtual address where the region is mapped in the hypervisor.
    pub base_host_virt_addr: u64,
    /// Region size in bytes.
    pub size: u64,
    /// Offset of the region contents in the (logical) backing file.
    #[serde(rename = "offset")]
    pub file_offset: u64,
    /// Page size configured for this region.
    pub page_size: u64,
}

impl Region {
    /// Membership test over `[base, base + size)`.
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base_host_virt_addr && addr - self.base_host_virt_addr < self.size
    }

    /// Offset of `addr` in the backing source.
    ///
    /// None when `addr` is below the region or the offset overflows.
    pub fn file_offset_of(&self, addr: u64) -> Option<u64> {
        addr.checked_sub(self.base_host_virt_addr)
            .and_then(|delta| self.file_offset.checked_add(delta))
    }
}

/// Validated page size.
/// Must be a positive power of two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageSize(u64);

impl PageSize {
    /// Create a new PageSize with validation.
    pub fn new(bytes: u64) -> Result<Self, HardValidationError> {
        if bytes == 0 || !bytes.is_power_of_two() {
            return Err(HardValidationError::InvalidPageSize { page_size: bytes });
        }
        Ok(Self(bytes))
    }

    /// Get the page size in bytes.
    pub fn bytes(&self) -> u64 {
        self.0
    }

    /// Start of the page containing `addr`.
    pub fn align_down(&self, addr: u64) -> u64 {
        addr & !(self.0 - 1)
    }

    /// Page frame number of `addr`.
    pub fn pfn(&self, addr: u64) -> u64 {
        addr / self.0
    }

    /// Byte address of page frame `pfn`.
    pub fn addr_of(&self, pfn: u64) -> u64 {
        pfn.saturating_mul(self.0)
    }
}

impl fmt::Display for PageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u64> for PageSize {
    type Error = HardValidationError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

/// 16-byte content hash naming one chunk in the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkHash([u8; HASH_SIZE]);

impl ChunkHash {
    /// Wrap raw hash bytes.
    pub const fn new(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    /// Read a hash from a recipe slice. Returns None unless exactly 16 bytes are given.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; HASH_SIZE]>::try_from(bytes).ok().map(Self)
    }

    /// Lowercase hex rendering, the name used by the chunk store.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Raw hash bytes.
    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }
}

impl fmt::Display for ChunkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for ChunkHash {
    type Err = HardValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| HardValidationError::InvalidChunkHash {
            value: s.to_string(),
            reason: e.to_string(),
        })?;
        Self::from_slice(&bytes).ok_or_else(|| HardValidationError::InvalidChunkHash {
            value: s.to_string(),
            reason: format!("expected {} bytes, got {}", HASH_SIZE, bytes.len()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_valid() {
        assert!(PageSize::new(4096).is_ok());
        assert!(PageSize::new(2 * 1024 * 1024).is_ok());
        assert!(PageSize::new(1).is_ok());
    }

    #[test]
    fn test_page_size_invalid() {
        assert!(PageSize::new(0).is_err());
        assert!(PageSize::new(3).is_err());
        assert!(PageSize::new(4097).is_err());
    }

    #[test]
    fn test_page_math() {
        let ps = PageSize::new(4096).unwrap();
        assert_eq!(ps.align_down(0x1050), 0x1000);
        assert_eq!(ps.pfn(0x3fff), 3);
        assert_eq!(ps.addr_of(5), 0x5000);
    }

    #[test]
    fn test_region_contains_is_half_open() {
        let region = Region {
            base_host_virt_addr: 0x1000,
            size: 0x2000,
            file_offset: 0,
            page_size: 4096,
        };
        assert!(!region.contains(0xfff));
        assert!(region.contains(0x1000));
        assert!(region.contains(0x2fff));
        assert!(!region.contains(0x3000));
        assert_eq!(region.file_offset_of(0x2000), Some(0x1000));
        assert_eq!(region.file_offset_of(0xfff), None);
    }

    #[test]
    fn test_file_offset_overflow() {
        let region = Region {
            base_host_virt_addr: 0x1000,
            size: 0x2000,
            file_offset: u64::MAX - 0x10,
            page_size: 4096,
        };
        assert_eq!(region.file_offset_of(0x1000), Some(u64::MAX - 0x10));
        assert_eq!(region.file_offset_of(0x2000), None);
    }

    #[test]
    fn test_region_json_field_names() {
        let json = r#"{"base_host_virt_addr":4096,"size":8192,"offset":0,"page_size":4096}"#;
        let region: Region = serde_json::from_str(json).unwrap();
        assert_eq!(region.base_host_virt_addr, 0x1000);
        assert_eq!(region.file_offset, 0);
        assert_eq!(serde_json::to_string(&region).unwrap(), json);
    }

    #[test]
    fn test_chunk_hash_hex() {
        let hash = ChunkHash::new([0xab; HASH_SIZE]);
        assert_eq!(hash.to_hex(), "ab".repeat(16));
        assert_eq!(hash.to_hex().parse::<ChunkHash>().unwrap(), hash);
        assert!("abcd".parse::<ChunkHash>().is_err());
        assert!("zz".repeat(16).parse::<ChunkHash>().is_err());
        assert!(ChunkHash::from_slice(&[0u8; 15]).is_none());
    }
}
