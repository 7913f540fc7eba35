// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Fixed-layout images of the `linux/userfaultfd.h` structures.
//!
//! Every structure is encoded and decoded field by field at documented byte
//! offsets in native byte order, so nothing depends on Rust struct layout.

/// `_IOWR(0xAA, 0x03, struct uffdio_copy)`
pub const UFFDIO_COPY: u32 = 0xc028_aa03;
/// `_IOWR(0xAA, 0x04, struct uffdio_zeropage)`
pub const UFFDIO_ZEROPAGE: u32 = 0xc020_aa04;
/// `_IOWR(0xAA, 0x07, struct uffdio_continue)`
pub const UFFDIO_CONTINUE: u32 = 0xc020_aa07;
/// `_IOR(0xAA, 0x02, struct uffdio_range)`
pub const UFFDIO_WAKE: u32 = 0x8010_aa02;

pub const UFFD_EVENT_PAGEFAULT: u8 = 0x12;
pub const UFFD_EVENT_FORK: u8 = 0x13;
pub const UFFD_EVENT_REMAP: u8 = 0x14;
pub const UFFD_EVENT_REMOVE: u8 = 0x15;
pub const UFFD_EVENT_UNMAP: u8 = 0x16;

pub const UFFD_PAGEFAULT_FLAG_WRITE: u64 = 0x1;
pub const UFFD_PAGEFAULT_FLAG_WP: u64 = 0x2;
pub const UFFD_PAGEFAULT_FLAG_MINOR: u64 = 0x4;

pub const UFFDIO_COPY_MODE_DONTWAKE: u64 = 0x1;
pub const UFFDIO_ZEROPAGE_MODE_DONTWAKE: u64 = 0x1;

/// Size of one `struct uffd_msg`: 8-byte header plus 24-byte union.
pub const UFFD_MSG_SIZE: usize = 32;
pub const UFFDIO_RANGE_SIZE: usize = 16;
pub const UFFDIO_COPY_SIZE: usize = 40;
pub const UFFDIO_ZEROPAGE_SIZE: usize = 32;
pub const UFFDIO_CONTINUE_SIZE: usize = 32;

fn put_u64(buf: &mut [u8], at: usize, value: u64) {
    buf[at..at + 8].copy_from_slice(&value.to_ne_bytes());
}

fn get_u64(buf: &[u8], at: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&buf[at..at + 8]);
    u64::from_ne_bytes(word)
}

fn get_i64(buf: &[u8], at: usize) -> i64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&buf[at..at + 8]);
    i64::from_ne_bytes(word)
}

/// `struct uffdio_range { __u64 start; __u64 len; }`
///
/// | offset | field |
/// |---|---|
/// | 0 | start |
/// | 8 | len |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UffdioRange {
    pub start: u64,
    pub len: u64,
}

impl UffdioRange {
    pub fn encode(&self) -> [u8; UFFDIO_RANGE_SIZE] {
        let mut buf = [0u8; UFFDIO_RANGE_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    fn encode_into(&self, buf: &mut [u8]) {
        put_u64(buf, 0, self.start);
        put_u64(buf, 8, self.len);
    }

    fn decode_from(buf: &[u8]) -> Self {
        Self {
            start: get_u64(buf, 0),
            len: get_u64(buf, 8),
        }
    }
}

/// `struct uffdio_copy`
///
/// | offset | field |
/// |---|---|
/// | 0 | dst |
/// | 8 | src |
/// | 16 | len |
/// | 24 | mode |
/// | 32 | copy (out: bytes copied or `-errno`) |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UffdioCopy {
    pub dst: u64,
    pub src: u64,
    pub len: u64,
    pub mode: u64,
    pub copy: i64,
}

impl UffdioCopy {
    pub fn new(dst: u64, src: u64, len: u64, mode: u64) -> Self {
        Self {
            dst,
            src,
            len,
            mode,
            copy: 0,
        }
    }

    pub fn encode(&self) -> [u8; UFFDIO_COPY_SIZE] {
        let mut buf = [0u8; UFFDIO_COPY_SIZE];
        put_u64(&mut buf, 0, self.dst);
        put_u64(&mut buf, 8, self.src);
        put_u64(&mut buf, 16, self.len);
        put_u64(&mut buf, 24, self.mode);
        buf[32..40].copy_from_slice(&self.copy.to_ne_bytes());
        buf
    }

    pub fn decode(buf: &[u8; UFFDIO_COPY_SIZE]) -> Self {
        Self {
            dst: get_u64(buf, 0),
            src: get_u64(buf, 8),
            len: get_u64(buf, 16),
            mode: get_u64(buf, 24),
            copy: get_i64(buf, 32),
        }
    }
}

/// `struct uffdio_zeropage`
///
/// | offset | field |
/// |---|---|
/// | 0 | range.start |
/// | 8 | range.len |
/// | 16 | mode |
/// | 24 | zeropage (out) |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UffdioZeropage {
    pub range: UffdioRange,
    pub mode: u64,
    pub zeropage: i64,
}

impl UffdioZeropage {
    pub fn new(start: u64, len: u64, mode: u64) -> Self {
        Self {
            range: UffdioRange { start, len },
            mode,
            zeropage: 0,
        }
    }

    pub fn encode(&self) -> [u8; UFFDIO_ZEROPAGE_SIZE] {
        let mut buf = [0u8; UFFDIO_ZEROPAGE_SIZE];
        self.range.encode_into(&mut buf[..UFFDIO_RANGE_SIZE]);
        put_u64(&mut buf, 16, self.mode);
        buf[24..32].copy_from_slice(&self.zeropage.to_ne_bytes());
        buf
    }

    pub fn decode(buf: &[u8; UFFDIO_ZEROPAGE_SIZE]) -> Self {
        Self {
            range: UffdioRange::decode_from(buf),
            mode: get_u64(buf, 16),
            zeropage: get_i64(buf, 24),
        }
    }
}

/// `struct uffdio_continue`
///
/// Same shape as [`UffdioZeropage`]; the output field is `mapped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UffdioContinue {
    pub range: UffdioRange,
    pub mode: u64,
    pub mapped: i64,
}

impl UffdioContinue {
    pub fn new(start: u64, len: u64) -> Self {
        Self {
            range: UffdioRange { start, len },
            mode: 0,
            mapped: 0,
        }
    }

    pub fn encode(&self) -> [u8; UFFDIO_CONTINUE_SIZE] {
        let mut buf = [0u8; UFFDIO_CONTINUE_SIZE];
        self.range.encode_into(&mut buf[..UFFDIO_RANGE_SIZE]);
        put_u64(&mut buf, 16, self.mode);
        buf[24..32].copy_from_slice(&self.mapped.to_ne_bytes());
        buf
    }

    pub fn decode(buf: &[u8; UFFDIO_CONTINUE_SIZE]) -> Self {
        Self {
            range: UffdioRange::decode_from(buf),
            mode: get_u64(buf, 16),
            mapped: get_i64(buf, 24),
        }
    }
}

/// A decoded `struct uffd_msg`.
///
/// | offset | field |
/// |---|---|
/// | 0 | event (u8) |
/// | 1..8 | reserved |
/// | 8 | pagefault.flags / remove.start |
/// | 16 | pagefault.address / remove.end |
/// | 24 | pagefault.feat.ptid (u32) |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultEvent {
    Pagefault { flags: u64, address: u64 },
    Remove { start: u64, end: u64 },
    /// Fork, remap, unmap or anything newer; carried so it can be logged.
    Other { event: u8 },
}

impl FaultEvent {
    pub fn decode(buf: &[u8; UFFD_MSG_SIZE]) -> Self {
        match buf[0] {
            UFFD_EVENT_PAGEFAULT => Self::Pagefault {
                flags: get_u64(buf, 8),
                address: get_u64(buf, 16),
            },
            UFFD_EVENT_REMOVE => Self::Remove {
                start: get_u64(buf, 8),
                end: get_u64(buf, 16),
            },
            event => Self::Other { event },
        }
    }

    /// Inverse of [`FaultEvent::decode`]. The hypervisor never sends these;
    /// simulated kernels in tests do.
    pub fn encode(&self) -> [u8; UFFD_MSG_SIZE] {
        let mut buf = [0u8; UFFD_MSG_SIZE];
        match *self {
            Self::Pagefault { flags, address } => {
                buf[0] = UFFD_EVENT_PAGEFAULT;
                put_u64(&mut buf, 8, flags);
                put_u64(&mut buf, 16, address);
            }
            Self::Remove { start, end } => {
                buf[0] = UFFD_EVENT_REMOVE;
                put_u64(&mut buf, 8, start);
                put_u64(&mut buf, 16, end);
            }
            Self::Other { event } => buf[0] = event,
        }
        buf
    }

    /// True for a pagefault carrying `UFFD_PAGEFAULT_FLAG_MINOR`.
    pub fn is_minor(&self) -> bool {
        matches!(self, Self::Pagefault { flags, .. } if flags & UFFD_PAGEFAULT_FLAG_MINOR != 0)
    }
}

/// Human readable name of a `uffd_msg.event` code.
pub fn event_name(event: u8) -> &'static str {
    match event {
        UFFD_EVENT_PAGEFAULT => "pagefault",
        UFFD_EVENT_FORK => "fork",
        UFFD_EVENT_REMAP => "remap",
        UFFD_EVENT_REMOVE => "remove",
        UFFD_EVENT_UNMAP => "unmap",
        _ => "unknown",
    }
}
