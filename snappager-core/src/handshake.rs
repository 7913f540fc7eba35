// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Handshake with the hypervisor.
//!
//! One message per connection generation: a JSON array of regions as the
//! body and exactly one userfaultfd in `SCM_RIGHTS` ancillary data.

use std::io::IoSliceMut;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags};

use crate::error::HandshakeError;
use crate::types::{PageSize, Region};

/// Attempts before giving up on receiving a descriptor.
pub const HANDSHAKE_ATTEMPTS: u32 = 5;

/// Pause between attempts.
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Receive buffer for the JSON body.
const BODY_BUF_LEN: usize = 16 * 1024;

/// Descriptors accepted in one message; extras are closed.
const MAX_FDS: usize = 4;

/// Validated region table of one handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionTable {
    regions: Vec<Region>,
    page_size: PageSize,
}

impl RegionTable {
    /// Decode a JSON region list and validate it against the guest memory size.
    pub fn parse(body: &str, expected_size: u64) -> Result<Self, HandshakeError> {
        let regions = serde_json::from_str::<Vec<Region>>(body).map_err(|e| {
            HandshakeError::InvalidMappings {
                reason: e.to_string(),
                body: body.to_string(),
            }
        })?;
        Self::new(regions, expected_size)
    }

    /// Validate a decoded region list.
    ///
    /// The list must be non-empty, cover exactly `expected_size` bytes, carry a
    /// power-of-two page size (taken from the first region) and not overlap.
    pub fn new(mut regions: Vec<Region>, expected_size: u64) -> Result<Self, HandshakeError> {
        let first = regions.first().ok_or(HandshakeError::NoRegions)?;

        let page_size = PageSize::new(first.page_size).map_err(|_| {
            HandshakeError::InvalidPageSize {
                page_size: first.page_size,
            }
        })?;

        let actual = regions
            .iter()
            .fold(0u64, |total, region| total.saturating_add(region.size));
        if actual != expected_size {
            return Err(HandshakeError::SizeMismatch {
                expected: expected_size,
                actual,
            });
        }

        let mut sorted: Vec<&Region> = regions.iter().collect();
        sorted.sort_by_key(|region| region.base_host_virt_addr);
        for pair in sorted.windows(2) {
            let end = pair[0].base_host_virt_addr.saturating_add(pair[0].size);
            if pair[1].base_host_virt_addr < end {
                return Err(HandshakeError::OverlappingRegions {
                    first: pair[0].base_host_virt_addr,
                    second: pair[1].base_host_virt_addr,
                });
            }
        }

        regions.shrink_to_fit();
        Ok(Self { regions, page_size })
    }

    /// The unique region containing `addr`.
    pub fn find(&self, addr: u64) -> Option<&Region> {
        self.regions.iter().find(|region| region.contains(addr))
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn page_size(&self) -> PageSize {
        self.page_size
    }

    /// Total bytes covered.
    pub fn total_size(&self) -> u64 {
        self.regions.iter().map(|region| region.size).sum()
    }
}

/// Outcome of one receive attempt.
#[derive(Debug)]
struct Received {
    body: String,
    uffd: Option<OwnedFd>,
}

fn try_receive(stream: &UnixStream) -> Result<Received, HandshakeError> {
    let mut buf = vec![0u8; BODY_BUF_LEN];
    let mut cmsg_buf = nix::cmsg_space!([RawFd; MAX_FDS]);

    let (bytes, raw_fds) = {
        let mut iov = [IoSliceMut::new(&mut buf)];
        let msg = recvmsg::<()>(
            stream.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buf),
            MsgFlags::MSG_CMSG_CLOEXEC,
        )
        .map_err(|e| HandshakeError::Recv {
            reason: e.to_string(),
        })?;

        let mut raw_fds = Vec::new();
        let cmsgs = msg.cmsgs().map_err(|e| HandshakeError::Recv {
            reason: format!("truncated control data: {}", e),
        })?;
        for cmsg in cmsgs {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                raw_fds.extend(fds);
            }
        }
        (msg.bytes, raw_fds)
    };

    // SAFETY: every descriptor was just installed in this process by SCM_RIGHTS
    // and nothing else refers to it.
    let mut fds: Vec<OwnedFd> = raw_fds
        .into_iter()
        .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) })
        .collect();
    if fds.len() > 1 {
        tracing::warn!(count = fds.len(), "Received more than one descriptor, keeping the first");
    }
    let uffd = if fds.is_empty() {
        None
    } else {
        Some(fds.swap_remove(0))
    };

    buf.truncate(bytes);
    let body = String::from_utf8(buf).map_err(|e| HandshakeError::InvalidMappings {
        reason: format!("body is not valid UTF-8: {}", e),
        body: String::from_utf8_lossy(e.as_bytes()).into_owned(),
    })?;

    Ok(Received { body, uffd })
}

/// Receive the region JSON and the userfaultfd.
///
/// Retries up to [`HANDSHAKE_ATTEMPTS`] times when the read fails or carries
/// no descriptor. A clean EOF is returned immediately as [`HandshakeError::Eof`].
pub fn receive_mappings_and_uffd(stream: &UnixStream) -> Result<(String, OwnedFd), HandshakeError> {
    let mut last_body = String::new();

    for attempt in 1..=HANDSHAKE_ATTEMPTS {
        match try_receive(stream) {
            Ok(Received {
                body,
                uffd: Some(uffd),
            }) => return Ok((body, uffd)),
            Ok(Received { body, uffd: None }) if body.is_empty() => {
                return Err(HandshakeError::Eof);
            }
            Ok(Received { body, uffd: None }) => {
                tracing::warn!(
                    attempt = attempt,
                    body = %body,
                    "Didn't receive UFFD over socket. Retrying..."
                );
                last_body = body;
            }
            Err(e) => {
                tracing::warn!(
                    attempt = attempt,
                    error = %e,
                    "Could not get UFFD and mappings from the hypervisor. Retrying..."
                );
            }
        }

        if attempt < HANDSHAKE_ATTEMPTS {
            std::thread::sleep(RETRY_DELAY);
        }
    }

    Err(HandshakeError::MissingUffd {
        attempts: HANDSHAKE_ATTEMPTS,
        body: last_body,
    })
}

#[cfg(test)]
mod tests {
    use std::io::{IoSlice, Write};
    use std::os::fd::AsRawFd;

    use nix::sys::socket::{sendmsg, ControlMessage};

    use super::*;

    fn region(base: u64, size: u64, offset: u64, page_size: u64) -> Region {
        Region {
            base_host_virt_addr: base,
            size,
            file_offset: offset,
            page_size,
        }
    }

    fn send_with_fd(stream: &UnixStream, body: &[u8], fd: RawFd) {
        let iov = [IoSlice::new(body)];
        let fds = [fd];
        let cmsg = [ControlMessage::ScmRights(&fds)];
        sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None).unwrap();
    }

    #[test]
    fn test_region_json_round_trip() {
        let regions = vec![
            region(0x1000, 0x2000, 0, 4096),
            region(0x3000, 0x1000, 0x2000, 4096),
        ];
        let body = serde_json::to_string(&regions).unwrap();

        let table = RegionTable::parse(&body, 0x3000).unwrap();
        assert_eq!(table.regions(), &regions[..]);
        assert_eq!(table.page_size().bytes(), 4096);
        assert_eq!(table.total_size(), 0x3000);
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let body = serde_json::to_string(&[region(0x1000, 0x2000, 0, 4096)]).unwrap();
        assert!(matches!(
            RegionTable::parse(&body, 0x3000),
            Err(HandshakeError::SizeMismatch {
                expected: 0x3000,
                actual: 0x2000
            })
        ));
    }

    #[test]
    fn test_invalid_page_sizes_rejected() {
        for page_size in [0, 3] {
            let result = RegionTable::new(vec![region(0x1000, 0x1000, 0, page_size)], 0x1000);
            assert!(matches!(result, Err(HandshakeError::InvalidPageSize { .. })));
        }
    }

    #[test]
    fn test_empty_region_list_rejected() {
        assert!(matches!(
            RegionTable::parse("[]", 0),
            Err(HandshakeError::NoRegions)
        ));
    }

    #[test]
    fn test_bad_json_rejected() {
        assert!(matches!(
            RegionTable::parse("{\"not\": \"a list\"}", 0x1000),
            Err(HandshakeError::InvalidMappings { .. })
        ));
    }

    #[test]
    fn test_overlapping_regions_rejected() {
        let regions = vec![
            region(0x1000, 0x2000, 0, 4096),
            region(0x2000, 0x1000, 0x2000, 4096),
        ];
        assert!(matches!(
            RegionTable::new(regions, 0x3000),
            Err(HandshakeError::OverlappingRegions { .. })
        ));
    }

    #[test]
    fn test_find_region() {
        let table = RegionTable::new(
            vec![
                region(0x1000, 0x2000, 0, 4096),
                region(0x3000, 0x1000, 0x2000, 4096),
            ],
            0x3000,
        )
        .unwrap();
        assert_eq!(table.find(0x1050).unwrap().file_offset, 0);
        assert_eq!(table.find(0x3000).unwrap().file_offset, 0x2000);
        assert!(table.find(0x4000).is_none());
    }

    #[test]
    fn test_receive_body_and_descriptor() {
        let (hypervisor, handler) = UnixStream::pair().unwrap();
        let passed = tempfile::tempfile().unwrap();

        send_with_fd(&hypervisor, b"[]", passed.as_raw_fd());

        let (body, fd) = receive_mappings_and_uffd(&handler).unwrap();
        assert_eq!(body, "[]");
        assert_ne!(fd.as_raw_fd(), passed.as_raw_fd());
    }

    #[test]
    fn test_receive_eof() {
        let (hypervisor, handler) = UnixStream::pair().unwrap();
        drop(hypervisor);
        assert!(matches!(
            receive_mappings_and_uffd(&handler),
            Err(HandshakeError::Eof)
        ));
    }

    /// Wait until the receiving side has consumed everything queued on `stream`.
    fn wait_until_drained(stream: &UnixStream) {
        let mut byte = [0u8; 1];
        let flags = MsgFlags::MSG_PEEK | MsgFlags::MSG_DONTWAIT;
        while nix::sys::socket::recv(stream.as_raw_fd(), &mut byte, flags).is_ok() {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_body_without_descriptor_is_retried() {
        let (mut hypervisor, handler) = UnixStream::pair().unwrap();
        let observer = handler.try_clone().unwrap();
        let passed = tempfile::tempfile().unwrap();

        let receiver = std::thread::spawn(move || receive_mappings_and_uffd(&handler));

        hypervisor.write_all(b"[1]").unwrap();
        wait_until_drained(&observer);
        send_with_fd(&hypervisor, b"[2]", passed.as_raw_fd());

        let (body, _fd) = receiver.join().unwrap().unwrap();
        assert_eq!(body, "[2]");
    }

    #[test]
    fn test_missing_descriptor_after_retries() {
        let (mut hypervisor, handler) = UnixStream::pair().unwrap();
        let writer = std::thread::spawn(move || {
            for _ in 0..HANDSHAKE_ATTEMPTS {
                hypervisor.write_all(b"[]").unwrap();
                std::thread::sleep(Duration::from_millis(150));
            }
            hypervisor
        });

        let err = receive_mappings_and_uffd(&handler).unwrap_err();
        assert!(matches!(err, HandshakeError::MissingUffd { attempts: 5, .. }));
        drop(writer.join().unwrap());
    }
}
