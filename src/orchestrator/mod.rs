//! The trim run state machine.
//!
//! Sequences the whole protocol:
//!
//! ```text
//! Mapping → Planting → PreVerify → Discarding → PostVerify → {Done, Aborted}
//! ```
//!
//! No destructive command is issued until every member has been proven to
//! read back exactly what was just planted, and no success is reported
//! until every member reads back either the original marker or zeros.
//! The orchestrator is the only component with abort authority.

use std::fmt;

use tracing::{info, warn};

use crate::dispatch::DiscardDispatcher;
use crate::error::Result;
use crate::filler::FillerFile;
use crate::plan::{ExtentMap, TrimPlan};
use crate::ports::{BlockMapper, DiscardChannelProvider};
use crate::topology::DeviceGeometry;
use crate::verify::{ArrayMember, MirrorVerifier};

// =============================================================================
// Stages
// =============================================================================

/// Stage of a trim run, in strict order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Mapping,
    Planting,
    PreVerify,
    Discarding,
    PostVerify,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Mapping => "mapping",
            Stage::Planting => "planting",
            Stage::PreVerify => "pre-verify",
            Stage::Discarding => "discarding",
            Stage::PostVerify => "post-verify",
            Stage::Done => "done",
        };
        write!(f, "{}", name)
    }
}

// =============================================================================
// Run Report
// =============================================================================

/// Outcome of a completed (non-aborted) run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Number of extents in the map
    pub extents: usize,
    /// Total planted signatures
    pub signatures: usize,
    /// Total sectors dispatched for discard
    pub trimmed_sectors: u64,
    /// Members whose discard channel reported failure; post-verify still
    /// passed on them, so no data was lost
    pub dispatch_failures: Vec<String>,
    /// True when the run stopped before the Discarding stage on request
    pub dry_run: bool,
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Owns the pass/fail decision and the abort policy for one run.
pub struct TrimOrchestrator {
    geometry: DeviceGeometry,
    dispatcher: DiscardDispatcher,
    dry_run: bool,
}

impl TrimOrchestrator {
    pub fn new(geometry: DeviceGeometry, dispatcher: DiscardDispatcher, dry_run: bool) -> Self {
        Self {
            geometry,
            dispatcher,
            dry_run,
        }
    }

    /// Run the full protocol.
    ///
    /// Any returned error aborted the run at the stage its class implies;
    /// dispatch failures alone do not abort, they are carried into the
    /// report after post-verify has assessed the member's actual state.
    ///
    /// The filler file is borrowed for the whole run, so it cannot be
    /// deleted before post-verification completes.
    pub fn run(
        &self,
        filler: &mut FillerFile,
        mapper: &dyn BlockMapper,
        members: &mut [ArrayMember],
        channels: &dyn DiscardChannelProvider,
    ) -> Result<RunReport> {
        // -- Mapping ---------------------------------------------------------
        info!("Stage {}: reading the filler file's block map", Stage::Mapping);
        let raw = mapper.map_extents(filler.path())?;
        let map = ExtentMap::from_raw(&raw)?;
        info!(
            "Block map holds {} extents covering {} sectors",
            map.len(),
            map.total_blocks()
        );

        // -- Planting --------------------------------------------------------
        info!("Stage {}: writing misalignment detector signatures", Stage::Planting);
        let plan = TrimPlan::build(&map, self.geometry.sector_size);
        filler.write_plan(&plan)?;
        // One bulk flush for the whole plan; signatures must be on stable
        // storage before the first verification read.
        filler.sync()?;
        info!(
            "Planted {} signatures across {} extents",
            plan.signature_count(),
            plan.extent_count()
        );

        // -- PreVerify -------------------------------------------------------
        info!("Stage {}: checking signatures on every member", Stage::PreVerify);
        let verifier = MirrorVerifier::new(self.geometry.sector_size);
        // Every member must pass before discard begins on any member.
        verifier.verify_expected(members, &plan)?;

        if self.dry_run {
            info!("Dry run requested: skipping the {} stage", Stage::Discarding);
            return Ok(RunReport {
                extents: map.len(),
                signatures: plan.signature_count(),
                trimmed_sectors: 0,
                dispatch_failures: Vec::new(),
                dry_run: true,
            });
        }

        // -- Discarding ------------------------------------------------------
        info!("Stage {}: issuing discard commands", Stage::Discarding);
        let mut dispatch_failures = Vec::new();
        for member in members.iter() {
            let name = member.name().to_string();
            let result = channels
                .open(&member.topology.device_path)
                .and_then(|mut sink| {
                    self.dispatcher.dispatch(
                        &name,
                        member.topology.physical_offset_sectors(),
                        &map,
                        sink.as_mut(),
                    )
                });
            if let Err(e) = result {
                // Never retried: the drive's state is unknown now and only
                // post-verify can tell whether damage occurred.
                warn!("Discard channel failure on {}: {}", name, e);
                dispatch_failures.push(name);
            }
        }

        // -- PostVerify ------------------------------------------------------
        info!(
            "Stage {}: confirming members read back signature or zeros",
            Stage::PostVerify
        );
        verifier.verify_post_discard(members, &plan)?;

        info!("Stage {}: all members verified", Stage::Done);
        Ok(RunReport {
            extents: map.len(),
            signatures: plan.signature_count(),
            trimmed_sectors: map.total_blocks() * members.len() as u64,
            dispatch_failures,
            dry_run: false,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
