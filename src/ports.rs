//! Collaborator interfaces (port/adapter pattern).
//!
//! The core protocol never talks to external tools directly; it depends on
//! these traits. Concrete Linux adapters live in [`crate::adapters`] and
//! [`crate::device`]; tests substitute in-memory implementations.
//!
//! All ports are synchronous: the whole protocol is a strict sequential
//! pipeline, and every blocking operation must complete (or fail) before
//! the orchestrator advances a stage.

use std::fmt;
use std::path::Path;

use crate::error::Result;
use crate::plan::RawExtent;

// =============================================================================
// Block Mapper Port
// =============================================================================

/// Port for mapping a fully allocated file to the physical extents
/// backing it on the array.
pub trait BlockMapper {
    /// Return the raw extent tuples for `path`, in the order the mapping
    /// facility reports them.
    fn map_extents(&self, path: &Path) -> Result<Vec<RawExtent>>;
}

// =============================================================================
// Sector Reader Port
// =============================================================================

/// Port for uncached single-sector reads from one array member.
///
/// Implementations must bypass any caching layer: a cached read could mask
/// exactly the misalignment or corruption the verifier exists to catch.
pub trait SectorReader {
    /// Read exactly one sector at the given physical byte offset.
    ///
    /// A short read is an error, never a truncated slice.
    fn read_sector(&mut self, byte_offset: u64) -> Result<&[u8]>;
}

// =============================================================================
// Discard Channel Port
// =============================================================================

/// One device-relative discard range, in sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscardRange {
    pub start_sector: u64,
    pub length_sectors: u64,
}

impl fmt::Display for DiscardRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.start_sector, self.length_sectors)
    }
}

/// Port for one member's discard command stream.
///
/// Ranges are streamed one by one; [`DiscardSink::finish`] delivers the
/// end-of-input terminator and waits for the channel's completion status.
/// The terminator must always be delivered, even after a send failure, so
/// the channel can terminate cleanly.
pub trait DiscardSink {
    /// Stream one range to the channel.
    fn send(&mut self, range: DiscardRange) -> Result<()>;

    /// Terminate the stream and wait for completion. Returns the channel's
    /// exit status (0 = success).
    fn finish(&mut self) -> Result<i32>;
}

/// Port for opening a discard channel to a member device.
pub trait DiscardChannelProvider {
    fn open(&self, device_path: &Path) -> Result<Box<dyn DiscardSink>>;
}

// =============================================================================
// Tests
// =============================================================================
