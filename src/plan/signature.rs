//! Misalignment detector signatures.
//!
//! Each signature is one sector's worth of data: two random hex tokens with
//! space padding between them. The tokens make the pattern infeasible to
//! collide with zeroed or stale sectors, so reading one back from a member
//! drive proves the physical offset arithmetic is right before anything
//! destructive happens.

use std::collections::BTreeMap;

use uuid::Uuid;

use super::extent::Extent;

/// Number of interior sample points per extent (plus the two boundaries).
const INTERIOR_SAMPLES: u64 = 100;

// =============================================================================
// Signature
// =============================================================================

/// One planted verification sector.
///
/// By construction a signature is never all-zero: it starts with a random
/// hex token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    bytes: Vec<u8>,
}

impl Signature {
    /// Generate a fresh signature filling exactly one sector.
    pub fn generate(sector_size: u32) -> Self {
        let sector_size = sector_size as usize;
        let head = Uuid::new_v4().simple().to_string();
        let tail = Uuid::new_v4().simple().to_string();
        debug_assert!(sector_size >= head.len() + tail.len());

        let mut bytes = Vec::with_capacity(sector_size);
        bytes.extend_from_slice(head.as_bytes());
        bytes.resize(sector_size - tail.len(), b' ');
        bytes.extend_from_slice(tail.as_bytes());
        debug_assert_eq!(bytes.len(), sector_size);

        Self { bytes }
    }

    /// The raw sector payload.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Byte-compare a sector read back from a device against this signature.
    pub fn matches(&self, sector: &[u8]) -> bool {
        sector == self.bytes.as_slice()
    }

    /// Length of the payload (always one sector).
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Never true for a generated signature.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

// =============================================================================
// Planting
// =============================================================================

/// Compute the signature placement for one extent, keyed by LBA.
///
/// Pure function of its arguments. Both boundary sectors (`begin_lba`,
/// `end_lba`) are always planted; up to [`INTERIOR_SAMPLES`] interior LBAs
/// are sampled with step `max(1, span / 100)`, so extents of 100 sectors or
/// fewer get one signature per sector. Plants are keyed on LBA: a sample
/// point landing on an already-planted LBA is not re-planted.
pub fn plant(extent: &Extent, sector_size: u32) -> BTreeMap<u64, Signature> {
    let mut signatures = BTreeMap::new();

    // Boundary sectors first; they catch alignment errors at extent edges.
    signatures
        .entry(extent.begin_lba)
        .or_insert_with(|| Signature::generate(sector_size));
    signatures
        .entry(extent.end_lba)
        .or_insert_with(|| Signature::generate(sector_size));

    let span = extent.end_lba - extent.begin_lba;
    let step = (span / INTERIOR_SAMPLES).max(1);
    let mut lba = extent.begin_lba;
    while lba < extent.end_lba {
        signatures
            .entry(lba)
            .or_insert_with(|| Signature::generate(sector_size));
        lba += step;
    }

    signatures
}

// =============================================================================
// Tests
// =============================================================================
