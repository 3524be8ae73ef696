//! Filler file reservation and signature writes.
//!
//! The filler file claims the filesystem's free space so its physical
//! extents can be targeted for discard. It is allocated with `fallocate`
//! (blocks committed, data never written wholesale), mutated only by
//! signature writes, and must outlive post-discard verification: it is the
//! sole owner of the planted signature storage.

use std::ffi::CString;
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileExt;
use std::path::Path;

use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::plan::TrimPlan;

/// Extra blocks allocated past the computed size, headroom for filesystem
/// rounding of the final extent.
const TAIL_MARGIN_BLOCKS: u64 = 16;

// =============================================================================
// Sizing
// =============================================================================

/// Compute the filler file size for `scratch_dir`: free space minus the
/// reserve, rounded down to a block multiple.
///
/// Refuses to run if a megabyte or less would remain to claim.
pub fn compute_size(scratch_dir: &Path, reserve_mb: u64, block_size: u32) -> Result<u64> {
    let stat = statvfs(scratch_dir)?;
    let free = stat.f_bavail as u64 * stat.f_frsize as u64;
    let size = free.saturating_sub(reserve_mb * 1024 * 1024);
    if size <= 1024 * 1024 {
        return Err(Error::Topology(format!(
            "not enough free space on {} (free {} bytes, reserve {} MB)",
            scratch_dir.display(),
            free,
            reserve_mb
        )));
    }
    Ok(size - size % u64::from(block_size))
}

fn statvfs(path: &Path) -> Result<libc::statvfs> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| Error::Topology(format!("bad scratch path: {}", e)))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: c_path is a valid NUL-terminated string and stat is a valid
    // out-pointer for the duration of the call.
    if unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) } != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(stat)
}

// =============================================================================
// Filler File
// =============================================================================

/// The scratch file whose allocation pins the free space for one run.
///
/// Removed from disk automatically on drop; the orchestrator keeps it alive
/// until post-discard verification has completed.
pub struct FillerFile {
    file: NamedTempFile,
    size: u64,
}

impl FillerFile {
    /// Create and fully allocate the filler file in `scratch_dir`.
    ///
    /// Two `fallocate` calls commit the blocks (with and without
    /// `FALLOC_FL_KEEP_SIZE`, as `hdparm --fallocate` does), followed by an
    /// fsync so the extent allocation itself is durable before mapping.
    pub fn allocate(scratch_dir: &Path, size: u64, block_size: u32) -> Result<Self> {
        let file = tempfile::Builder::new()
            .prefix("filler_for_trim_")
            .tempfile_in(scratch_dir)?;

        let total = size + u64::from(block_size) * TAIL_MARGIN_BLOCKS;
        let fd = file.as_file().as_raw_fd();

        // SAFETY: fd is a valid open descriptor; offsets fit in off_t for
        // any realistic filesystem size.
        if unsafe { libc::fallocate(fd, 0, 0, total as libc::off_t) } != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        if unsafe { libc::fallocate(fd, libc::FALLOC_FL_KEEP_SIZE, 0, total as libc::off_t) } != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        file.as_file().sync_all()?;

        info!(
            "Allocated filler file {} ({} bytes)",
            file.path().display(),
            total
        );

        Ok(Self { file, size })
    }

    /// Path of the filler file, for the block mapper.
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Allocated payload size in bytes (excluding the tail margin).
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Write every planted signature into the file at its computed offset.
    ///
    /// Does not sync; the caller performs one bulk [`FillerFile::sync`]
    /// after all extents are planted. Any write error is fatal, since a
    /// partially planted file with an inconsistent flush cannot be trusted.
    pub fn write_plan(&mut self, plan: &TrimPlan) -> Result<()> {
        let sector_size = plan.sector_size();
        for planned in plan.iter() {
            for (lba, signature) in &planned.signatures {
                let offset = planned.extent.file_offset(*lba, sector_size);
                self.file
                    .as_file()
                    .write_all_at(signature.as_bytes(), offset)
                    .map_err(|source| Error::PlantIo { offset, source })?;
            }
            debug!(
                "Planted {} signatures in extent at LBA {}",
                planned.signatures.len(),
                planned.extent.begin_lba
            );
        }
        Ok(())
    }

    /// Flush and fsync all planted signatures to stable storage.
    ///
    /// Must complete before any verification read.
    pub fn sync(&self) -> Result<()> {
        self.file.as_file().sync_all()?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
