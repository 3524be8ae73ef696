//! Extent map construction from raw block-mapper output.

use crate::error::{Error, Result};

// =============================================================================
// Raw Extents
// =============================================================================

/// One line of block-mapper output: where a run of filler-file blocks
/// physically lands on the array.
///
/// `begin_lba` and `end_lba` are device sector addresses relative to the
/// array's data area; `end_lba` is inclusive, as the mapper reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawExtent {
    /// Byte offset of this run inside the filler file
    pub byte_offset: u64,
    /// First sector of the run
    pub begin_lba: u64,
    /// Last sector of the run (inclusive)
    pub end_lba: u64,
    /// Length of the run in sectors
    pub length_blocks: u64,
}

// =============================================================================
// Extents
// =============================================================================

/// A validated contiguous run of sectors believed unused.
///
/// Immutable once computed; the same extent feeds both signature planting
/// and discard range generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    /// First sector of the extent
    pub begin_lba: u64,
    /// Last sector of the extent (inclusive)
    pub end_lba: u64,
    /// Length of the extent in sectors
    pub length_blocks: u64,
    /// Byte offset of the extent inside the filler file
    pub byte_offset: u64,
}

impl Extent {
    /// True if `lba` falls inside this extent.
    pub fn contains(&self, lba: u64) -> bool {
        lba >= self.begin_lba && lba < self.begin_lba + self.length_blocks
    }

    /// Byte offset inside the filler file where `lba`'s sector lives.
    pub fn file_offset(&self, lba: u64, sector_size: u32) -> u64 {
        (lba - self.begin_lba) * u64::from(sector_size) + self.byte_offset
    }
}

// =============================================================================
// Extent Map
// =============================================================================

/// Ordered, non-overlapping set of extents.
///
/// The ordering by `begin_lba` is what makes discard batching deterministic.
#[derive(Debug, Clone)]
pub struct ExtentMap {
    extents: Vec<Extent>,
}

impl ExtentMap {
    /// Build the map from raw block-mapper tuples.
    ///
    /// Fails with [`Error::ExtentInconsistency`] if any tuple spans more
    /// LBAs than it claims blocks, or if two extents overlap. Either means
    /// the block map cannot be trusted for a destructive operation.
    pub fn from_raw(raw: &[RawExtent]) -> Result<Self> {
        let mut extents = Vec::with_capacity(raw.len());

        for r in raw {
            if r.end_lba < r.begin_lba || r.end_lba - r.begin_lba > r.length_blocks {
                return Err(Error::ExtentInconsistency(format!(
                    "extent at file offset {} spans LBAs {}..={} but claims {} blocks",
                    r.byte_offset, r.begin_lba, r.end_lba, r.length_blocks
                )));
            }
            extents.push(Extent {
                begin_lba: r.begin_lba,
                end_lba: r.end_lba,
                length_blocks: r.length_blocks,
                byte_offset: r.byte_offset,
            });
        }

        extents.sort_by_key(|e| e.begin_lba);

        for pair in extents.windows(2) {
            if pair[1].begin_lba < pair[0].begin_lba + pair[0].length_blocks {
                return Err(Error::ExtentInconsistency(format!(
                    "extents at LBAs {} and {} overlap",
                    pair[0].begin_lba, pair[1].begin_lba
                )));
            }
        }

        Ok(Self { extents })
    }

    /// Iterate extents in `begin_lba` order.
    pub fn iter(&self) -> std::slice::Iter<'_, Extent> {
        self.extents.iter()
    }

    /// Number of extents.
    pub fn len(&self) -> usize {
        self.extents.len()
    }

    /// True if the map holds no extents.
    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    /// Total sectors covered by all extents.
    pub fn total_blocks(&self) -> u64 {
        self.extents.iter().map(|e| e.length_blocks).sum()
    }
}

// =============================================================================
// Tests
// =============================================================================
