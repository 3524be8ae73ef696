//! The trim plan: extents plus their planted signatures.
//!
//! The plan is built exactly once per run, then passed read-only through
//! every later stage. No stage mutates a previous stage's output.

pub mod extent;
pub mod signature;

use std::collections::BTreeMap;

pub use extent::{Extent, ExtentMap, RawExtent};
pub use signature::{plant, Signature};

// =============================================================================
// Trim Plan
// =============================================================================

/// One extent together with its planted signatures, keyed by LBA.
#[derive(Debug, Clone)]
pub struct PlannedExtent {
    pub extent: Extent,
    pub signatures: BTreeMap<u64, Signature>,
}

/// The full set of planned extents for one run.
///
/// Built once during the Planting stage and read-only afterwards; its
/// lifetime spans exactly one orchestrator run.
#[derive(Debug, Clone)]
pub struct TrimPlan {
    planned: Vec<PlannedExtent>,
    sector_size: u32,
}

impl TrimPlan {
    /// Plant signatures for every extent in the map.
    pub fn build(map: &ExtentMap, sector_size: u32) -> Self {
        let planned = map
            .iter()
            .map(|&extent| PlannedExtent {
                extent,
                signatures: plant(&extent, sector_size),
            })
            .collect();
        Self {
            planned,
            sector_size,
        }
    }

    /// Iterate planned extents in LBA order.
    pub fn iter(&self) -> std::slice::Iter<'_, PlannedExtent> {
        self.planned.iter()
    }

    /// Sector size the signatures were generated for.
    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }

    /// Total number of planted signatures across all extents.
    pub fn signature_count(&self) -> usize {
        self.planned.iter().map(|p| p.signatures.len()).sum()
    }

    /// Number of planned extents.
    pub fn extent_count(&self) -> usize {
        self.planned.len()
    }
}

// =============================================================================
// Tests
// =============================================================================
