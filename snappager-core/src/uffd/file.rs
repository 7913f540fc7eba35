//! Userfaultfd descriptor and the ioctl seam.

use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use super::abi::{
    UffdioContinue, UffdioCopy, UffdioRange, UffdioZeropage, UFFDIO_CONTINUE, UFFDIO_COPY,
    UFFDIO_WAKE, UFFDIO_ZEROPAGE, UFFD_MSG_SIZE,
};

/// Operations the engine performs on a userfaultfd.
///
/// Errors carry the raw errno so callers can single out `EAGAIN` and `EEXIST`.
/// Implementations are shared by the working-set worker pool, hence `Send + Sync`.
pub trait UserFault: Send + Sync {
    /// Descriptor registered in the poll set.
    fn raw_fd(&self) -> RawFd;

    /// Non-blocking read of at most one `uffd_msg`.
    fn read_msg(&self, buf: &mut [u8; UFFD_MSG_SIZE]) -> io::Result<usize>;

    /// `UFFDIO_COPY`. Returns the kernel's `copy` field.
    fn copy(&self, copy: UffdioCopy) -> io::Result<i64>;

    /// `UFFDIO_ZEROPAGE`. Returns the kernel's `zeropage` field.
    fn zeropage(&self, zero: UffdioZeropage) -> io::Result<i64>;

    /// `UFFDIO_CONTINUE`. Returns the kernel's `mapped` field.
    fn continue_range(&self, cont: UffdioContinue) -> io::Result<i64>;

    /// `UFFDIO_WAKE`.
    fn wake(&self, range: UffdioRange) -> io::Result<()>;
}

/// 8-byte aligned ioctl argument buffer.
#[repr(C, align(8))]
struct IoctlArg<const N: usize>([u8; N]);

/// A userfaultfd received from the hypervisor.
///
/// Owns the descriptor; it is closed when the handler is dropped.
#[derive(Debug)]
pub struct UffdFile {
    file: File,
}

impl UffdFile {
    pub fn new(fd: OwnedFd) -> Self {
        Self {
            file: File::from(fd),
        }
    }

    fn ioctl<const N: usize>(&self, request: u32, image: [u8; N]) -> io::Result<[u8; N]> {
        let mut arg = IoctlArg(image);
        // SAFETY: the descriptor is owned by self and `arg` is a live, writable
        // buffer of exactly the size encoded in `request`.
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), request as _, arg.0.as_mut_ptr()) };
        if ret == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(arg.0)
    }
}

impl UserFault for UffdFile {
    fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    fn read_msg(&self, buf: &mut [u8; UFFD_MSG_SIZE]) -> io::Result<usize> {
        (&self.file).read(buf)
    }

    fn copy(&self, copy: UffdioCopy) -> io::Result<i64> {
        let out = self.ioctl(UFFDIO_COPY, copy.encode())?;
        Ok(UffdioCopy::decode(&out).copy)
    }

    fn zeropage(&self, zero: UffdioZeropage) -> io::Result<i64> {
        let out = self.ioctl(UFFDIO_ZEROPAGE, zero.encode())?;
        Ok(UffdioZeropage::decode(&out).zeropage)
    }

    fn continue_range(&self, cont: UffdioContinue) -> io::Result<i64> {
        let out = self.ioctl(UFFDIO_CONTINUE, cont.encode())?;
        Ok(UffdioContinue::decode(&out).mapped)
    }

    fn wake(&self, range: UffdioRange) -> io::Result<()> {
        self.ioctl(UFFDIO_WAKE, range.encode())?;
        Ok(())
    }
}
