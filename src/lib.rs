//! mdtrim - Verified TRIM of unused space on mdadm RAID-1 arrays
//!
//! TRIM is destructive and irreversible on most drives, and a mirrored
//! array's members must stay bit-identical outside deliberately discarded
//! regions. mdtrim only discards extents it can prove are unused, with a
//! plant-verify-discard-reverify protocol:
//!
//! ```text
//! Mapping → Planting → PreVerify → Discarding → PostVerify → {Done, Aborted}
//! ```
//!
//! A filler file claims the free space; random marker signatures are planted
//! inside its physical extents; every member drive is read raw (O_DIRECT) to
//! prove the signatures mirror bit-identically *before* anything destructive
//! is issued; discards are streamed in bounded batches; afterwards every
//! signature sector must read back as the original marker or as zeros.
//!
//! # Modules
//!
//! - [`topology`] - mdadm array discovery from sysfs and device geometry
//! - [`filler`] - filler file reservation and signature writes
//! - [`plan`] - extents, signatures, and the immutable trim plan
//! - [`device`] - aligned buffers and raw O_DIRECT sector reads
//! - [`ports`] - collaborator interfaces (block mapper, reader, discard channel)
//! - [`adapters`] - hdparm-backed implementations of the ports
//! - [`verify`] - the pre- and post-discard verification gates
//! - [`dispatch`] - discard range batching and per-member streaming
//! - [`orchestrator`] - the run state machine and abort policy
//! - [`error`] - error types and exit-code classes

pub mod adapters;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod filler;
pub mod orchestrator;
pub mod plan;
pub mod ports;
pub mod topology;
pub mod verify;

// Re-export commonly used types
pub use dispatch::{DiscardDispatcher, MAX_RANGE_SECTORS};
pub use error::{Error, Result};
pub use filler::FillerFile;
pub use orchestrator::{RunReport, Stage, TrimOrchestrator};
pub use plan::{Extent, ExtentMap, Signature, TrimPlan};
pub use topology::{ArrayTopology, DeviceGeometry, MemberTopology};
pub use verify::{ArrayMember, MirrorVerifier};
