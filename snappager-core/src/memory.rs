//! BackingMemory - read-only mapping of the snapshot memory file.
//!
//! In eager mode the mapping holds raw guest memory. In lazy mode it holds the
//! recipe: one 16-byte content hash per chunk of guest memory.
//! All unsafe operations are encapsulated with bounds checking.

use std::fs::File;
use std::os::fd::AsRawFd;
use std::ptr::NonNull;

use crate::error::PagerError;

/// A private, read-only mapping of a whole file.
///
/// This struct owns the mapped memory and will unmap it on drop.
pub struct BackingMemory {
    /// Pointer to the mapped memory.
    ptr: NonNull<u8>,
    /// Size of the mapping in bytes.
    size: usize,
}

// SAFETY: the mapping is read-only and owned; nothing mutates it after creation.
unsafe impl Send for BackingMemory {}

// SAFETY: shared references only ever read the mapping.
unsafe impl Sync for BackingMemory {}

impl BackingMemory {
    /// Map `file` read-only in full.
    ///
    /// # Errors
    /// Returns PagerError if the file is empty or the mapping fails.
    pub fn map(file: &File) -> Result<Self, PagerError> {
        let len = file
            .metadata()
            .map_err(|e| PagerError::Io {
                context: "reading backing file metadata",
                source: e,
            })?
            .len();

        let size = usize::try_from(len).map_err(|_| PagerError::Syscall {
            syscall: "mmap",
            message: format!("backing file of {} bytes does not fit the address space", len),
        })?;

        if size == 0 {
            return Err(PagerError::Syscall {
                syscall: "mmap",
                message: "backing file is empty".to_string(),
            });
        }

        // SAFETY: fd is valid for the duration of the call, size is the file length
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ,
                libc::MAP_PRIVATE | libc::MAP_POPULATE,
                file.as_raw_fd(),
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(PagerError::Syscall {
                syscall: "mmap",
                message: format!("mmap on backing file failed: {}", std::io::Error::last_os_error()),
            });
        }

        let ptr = NonNull::new(ptr as *mut u8).ok_or_else(|| PagerError::Syscall {
            syscall: "mmap",
            message: "mmap returned null".to_string(),
        })?;

        tracing::debug!(size = size, "Mapped backing file");

        Ok(Self { ptr, size })
    }

    /// Size of the mapping in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Base address of the mapping.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// The whole mapping as a byte slice.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr/size describe a live read-only mapping owned by self
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    /// Bounds-checked view of `[offset, offset + len)`.
    pub fn get(&self, offset: u64, len: u64) -> Option<&[u8]> {
        let start = usize::try_from(offset).ok()?;
        let end = start.checked_add(usize::try_from(len).ok()?)?;
        self.as_slice().get(start..end)
    }
}

impl std::fmt::Debug for BackingMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackingMemory")
            .field("ptr", &self.ptr)
            .field("size", &self.size)
            .finish()
    }
}

impl Drop for BackingMemory {
    fn drop(&mut self) {
        // SAFETY: ptr and size were set during creation
        let result = unsafe { libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size) };
        if result < 0 {
            tracing::error!(
                error = %std::io::Error::last_os_error(),
                "Failed to unmap backing file"
            );
        }
    }
}
