//! Sector-aligned buffers and raw direct-I/O reads.
//!
//! `O_DIRECT` reads require the buffer, offset, and length to be aligned to
//! the device's logical block size. [`AlignedBuf`] isolates the unsafe
//! aligned allocation in one place; [`DirectReader`] owns one member's raw
//! handle for the duration of a run and reuses a single aligned buffer for
//! every read.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ffi::c_void;
use std::fs::{File, OpenOptions};
use std::ops::{Deref, DerefMut};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::ptr::NonNull;
use std::slice;

use crate::error::{Error, Result};
use crate::ports::SectorReader;

// =============================================================================
// AlignedBuf
// =============================================================================

/// A heap buffer with a guaranteed alignment.
///
/// - The pointer is non-null (checked at allocation)
/// - Memory is zero-initialized
/// - The buffer is freed when dropped
/// - Implements `Send` but not `Sync` (single-owner semantics)
#[derive(Debug)]
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    size: usize,
    layout: Layout,
}

// SAFETY: AlignedBuf owns its memory exclusively and can be sent between
// threads for ownership transfer.
unsafe impl Send for AlignedBuf {}

impl AlignedBuf {
    /// Allocate a zeroed buffer of `size` bytes aligned to `align`.
    ///
    /// `align` must be a power of two and `size` greater than zero.
    pub fn new(size: usize, align: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::BufferAlloc {
                size,
                reason: "size must be greater than 0".into(),
            });
        }
        if !align.is_power_of_two() {
            return Err(Error::BufferAlloc {
                size,
                reason: format!("alignment {} must be a power of 2", align),
            });
        }

        let layout = Layout::from_size_align(size, align).map_err(|e| Error::BufferAlloc {
            size,
            reason: e.to_string(),
        })?;

        // SAFETY: layout is valid (checked above) and non-zero sized.
        let ptr = unsafe { alloc_zeroed(layout) };

        NonNull::new(ptr).map_or_else(
            || {
                Err(Error::BufferAlloc {
                    size,
                    reason: "allocation returned NULL".into(),
                })
            },
            |ptr| Ok(Self { ptr, size, layout }),
        )
    }

    /// Size of the buffer in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    /// Always false for a successfully constructed buffer.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Check that the pointer really carries the requested alignment.
    #[inline]
    pub fn is_aligned_to(&self, align: usize) -> bool {
        (self.ptr.as_ptr() as usize) % align == 0
    }

    /// Mutable raw pointer for syscalls that fill the buffer.
    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for self.size bytes and we have shared access.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    #[inline]
    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for self.size bytes and we have exclusive access.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with this layout and not yet freed.
        unsafe {
            dealloc(self.ptr.as_ptr(), self.layout);
        }
    }
}

impl Deref for AlignedBuf {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

impl DerefMut for AlignedBuf {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.as_mut_slice()
    }
}

impl AsRef<[u8]> for AlignedBuf {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

// =============================================================================
// DirectReader
// =============================================================================

/// Raw uncached sector reader over one member drive.
///
/// Opens the device with `O_DIRECT` so every read hits the platter/NAND,
/// not the page cache. The handle is opened once per run and used for both
/// the pre- and post-discard verification passes.
pub struct DirectReader {
    file: File,
    member: String,
    buf: AlignedBuf,
    sector_size: u32,
}

impl DirectReader {
    /// Open `device_path` for direct reads.
    ///
    /// `block_size` is the device's physical block size; the internal
    /// buffer is sized and aligned to it, which satisfies the stricter of
    /// the two alignment requirements.
    pub fn open(device_path: &Path, sector_size: u32, block_size: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_DIRECT)
            .open(device_path)?;
        let buf = AlignedBuf::new(block_size as usize, block_size as usize)?;

        Ok(Self {
            file,
            member: device_path.display().to_string(),
            buf,
            sector_size,
        })
    }

    /// Identifier used in diagnostics.
    pub fn member(&self) -> &str {
        &self.member
    }
}

impl SectorReader for DirectReader {
    fn read_sector(&mut self, byte_offset: u64) -> Result<&[u8]> {
        let wanted = self.sector_size as usize;

        // SAFETY: buf is valid for at least `wanted` bytes (block size is a
        // whole multiple of sector size) and aligned for O_DIRECT.
        let n = unsafe {
            libc::pread(
                self.file.as_raw_fd(),
                self.buf.as_mut_ptr() as *mut c_void,
                wanted,
                byte_offset as libc::off_t,
            )
        };

        if n < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        if (n as usize) < wanted {
            return Err(Error::DeviceRead {
                member: self.member.clone(),
                offset: byte_offset,
                got: n as usize,
                wanted,
            });
        }

        Ok(&self.buf[..wanted])
    }
}

// =============================================================================
// Tests
// =============================================================================
