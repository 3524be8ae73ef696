//! Mirror verification: the safety gates around the discard.
//!
//! The verifier reads every planted signature back from every member drive
//! through its uncached reader. It runs twice per run with different
//! acceptance tests:
//!
//! - **pre-discard**: every sector must equal its planted signature exactly.
//!   This proves the offset arithmetic and the mirroring before anything
//!   destructive is issued.
//! - **post-discard**: every sector must equal the signature **or** be all
//!   zeros. A discarded region may legitimately return either; any third
//!   pattern means live data was clobbered.

use tracing::info;

use crate::error::{Error, Result};
use crate::plan::TrimPlan;
use crate::ports::SectorReader;
use crate::topology::MemberTopology;

// =============================================================================
// Array Member
// =============================================================================

/// A member drive bound to its open raw reader for the duration of a run.
///
/// All members are treated uniformly and independently: a failure on one
/// never exempts checking the others in a later pass.
pub struct ArrayMember {
    pub topology: MemberTopology,
    pub reader: Box<dyn SectorReader>,
}

impl ArrayMember {
    pub fn new(topology: MemberTopology, reader: Box<dyn SectorReader>) -> Self {
        Self { topology, reader }
    }

    pub fn name(&self) -> &str {
        &self.topology.name
    }
}

// =============================================================================
// Verifier
// =============================================================================

/// Per-sector acceptance test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Acceptance {
    /// Sector must equal the planted signature byte for byte.
    ExactSignature,
    /// Sector must equal the signature or be entirely zero.
    SignatureOrZero,
}

/// Reads planted signatures back from member drives and decides pass/fail.
pub struct MirrorVerifier {
    sector_size: u32,
}

impl MirrorVerifier {
    pub fn new(sector_size: u32) -> Self {
        Self { sector_size }
    }

    /// Pre-discard gate: every member must read back exactly what was
    /// planted. Any mismatch aborts before a single discard command is
    /// issued.
    pub fn verify_expected(&self, members: &mut [ArrayMember], plan: &TrimPlan) -> Result<()> {
        for member in members.iter_mut() {
            self.check_member(member, plan, Acceptance::ExactSignature)?;
            info!("Signature check passed on {}", member.name());
        }
        Ok(())
    }

    /// Post-discard safety check: each signature sector must read back as
    /// the original marker or as zeros. Anything else is
    /// [`Error::DataCorruption`].
    pub fn verify_post_discard(&self, members: &mut [ArrayMember], plan: &TrimPlan) -> Result<()> {
        for member in members.iter_mut() {
            self.check_member(member, plan, Acceptance::SignatureOrZero)?;
            info!("Finished checking data on {}", member.name());
        }
        Ok(())
    }

    fn check_member(
        &self,
        member: &mut ArrayMember,
        plan: &TrimPlan,
        acceptance: Acceptance,
    ) -> Result<()> {
        let name = member.topology.name.clone();
        let base = member.topology.physical_offset_sectors();

        for planned in plan.iter() {
            for (lba, signature) in &planned.signatures {
                // partition offset + array offset + logical offset, composed
                // in sector units until this single byte conversion
                let offset = (base + lba) * u64::from(self.sector_size);
                let sector = member.reader.read_sector(offset)?;

                let accepted = match acceptance {
                    Acceptance::ExactSignature => signature.matches(sector),
                    Acceptance::SignatureOrZero => {
                        signature.matches(sector) || is_zeroed(sector)
                    }
                };

                if !accepted {
                    return Err(match acceptance {
                        Acceptance::ExactSignature => Error::SignatureMismatch {
                            member: name,
                            lba: *lba,
                            offset,
                        },
                        Acceptance::SignatureOrZero => Error::DataCorruption {
                            member: name,
                            lba: *lba,
                        },
                    });
                }
            }
        }

        Ok(())
    }
}

/// True if every byte of the sector is zero.
pub fn is_zeroed(sector: &[u8]) -> bool {
    sector.iter().all(|&b| b == 0)
}

// =============================================================================
// Tests
// =============================================================================
