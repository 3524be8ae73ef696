//! Error types for the trim protocol

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during a trim run.
///
/// Each variant belongs to one of three failure classes, distinguished by
/// [`Error::exit_code`]:
///
/// - **setup** (exit 1): nothing destructive happened, the array is untouched
/// - **pre-discard gate** (exit 2): a verification read failed before any
///   discard command was issued; the run aborted safely
/// - **post-discard** (exit 3): a discard already executed and a sector read
///   back neither the planted signature nor zeros
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Unsupported or unhealthy array, bad geometry, or any other condition
    /// detected before the filler file is allocated
    #[error("array topology error: {0}")]
    Topology(String),

    /// The block mapper could not be run or its output could not be parsed
    #[error("block map error: {0}")]
    BlockMap(String),

    /// The reported block map contradicts itself
    #[error("block map inconsistency: {0}")]
    ExtentInconsistency(String),

    /// Writing a signature into the filler file failed
    #[error("failed to write signature into filler file at offset {offset}: {source}")]
    PlantIo {
        offset: u64,
        #[source]
        source: std::io::Error,
    },

    /// A pre-discard verification read did not match the planted signature
    #[error(
        "signature mismatch on {member} at LBA {lba} (physical byte offset {offset}): \
         data written into the filler file and data on the member drive differ"
    )]
    SignatureMismatch { member: String, lba: u64, offset: u64 },

    /// A raw device read returned fewer bytes than one sector
    #[error("short read from {member} at byte offset {offset}: got {got} of {wanted} bytes")]
    DeviceRead {
        member: String,
        offset: u64,
        got: usize,
        wanted: usize,
    },

    /// A member's discard channel reported a non-zero completion status
    #[error("discard channel for {member} exited with status {status}")]
    DispatchFailure { member: String, status: i32 },

    /// A post-discard read matched neither the planted signature nor zeros
    #[error(
        "post-discard corruption on {member} at LBA {lba}: sector is neither \
         the planted signature nor zeroed"
    )]
    DataCorruption { member: String, lba: u64 },

    /// Allocation of a sector-aligned read buffer failed
    #[error("aligned buffer allocation failed for size {size}: {reason}")]
    BufferAlloc { size: usize, reason: String },
}

impl Error {
    /// Process exit code for this failure class.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::SignatureMismatch { .. } | Error::DeviceRead { .. } => 2,
            Error::DataCorruption { .. } => 3,
            _ => 1,
        }
    }

    /// True if this failure was detected only after a discard command had
    /// already been issued, meaning data may genuinely be lost.
    pub fn is_post_discard(&self) -> bool {
        matches!(self, Error::DataCorruption { .. })
    }
}

// =============================================================================
// Tests
// =============================================================================
