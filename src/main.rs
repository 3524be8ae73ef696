//! mdtrim
//!
//! Safely reclaims unused space on a mirrored mdadm array by planting
//! verification signatures in a filler file, proving they mirror
//! bit-identically on every member drive, and only then issuing TRIM.
//!
//! ```text
//! ┌───────────┐   ┌──────────┐   ┌───────────┐   ┌────────────┐
//! │ Extent    │──▶│ Planter  │──▶│ Verifier  │──▶│ Dispatcher │
//! │ Map       │   │          │   │ (gate)    │   │ (TRIM)     │
//! └───────────┘   └──────────┘   └───────────┘   └────────────┘
//!                       orchestrated strictly in order
//! ```

use std::path::PathBuf;
use std::process;

use clap::Parser;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mdtrim::adapters::{FibmapBlockMapper, HdparmDiscardProvider};
use mdtrim::device::DirectReader;
use mdtrim::error::Result;
use mdtrim::filler::{self, FillerFile};
use mdtrim::orchestrator::{RunReport, TrimOrchestrator};
use mdtrim::topology::{ArrayTopology, DeviceGeometry};
use mdtrim::verify::ArrayMember;
use mdtrim::DiscardDispatcher;

// =============================================================================
// CLI Arguments
// =============================================================================

/// Verified TRIM of unused space on mdadm RAID-1 arrays
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// RAID device to clean up (e.g. /dev/md1)
    #[arg(short = 'm', long, env = "MDTRIM_RAID_DEVICE")]
    raid_device: String,

    /// Directory on the RAID device to use for the scratch filler file
    #[arg(short = 's', long, env = "MDTRIM_SCRATCH_DIR")]
    scratch_dir: PathBuf,

    /// Megabytes of free space to leave untouched during the run
    #[arg(short = 'r', long, env = "MDTRIM_RESERVE_MB", default_value = "4096")]
    reserve: u64,

    /// Plant and verify signatures but skip the destructive discard
    #[arg(long, env = "MDTRIM_DRY_RUN")]
    dry_run: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

fn main() {
    let args = Args::parse();
    init_logging(&args);

    match run(&args) {
        Ok(report) => {
            if report.dry_run {
                info!(
                    "Dry run complete: {} extents verified on every member, nothing discarded",
                    report.extents
                );
            } else {
                info!(
                    "Trimming finished: {} extents, {} signatures, {} sectors discarded; \
                     every member reads back clean",
                    report.extents, report.signatures, report.trimmed_sectors
                );
            }
            for member in &report.dispatch_failures {
                warn!(
                    "Discard channel on {} reported failure; post-verify found no damage",
                    member
                );
            }
        }
        Err(e) => {
            if e.is_post_discard() {
                error!("{}", e);
                error!("A discard was already issued before this was detected; data integrity is uncertain");
            } else {
                error!("{}", e);
                error!("Aborted before any destructive command; the array is untouched");
            }
            process::exit(e.exit_code());
        }
    }
}

fn run(args: &Args) -> Result<RunReport> {
    let device = args.raid_device.trim_start_matches("/dev/");

    let topology = ArrayTopology::discover(device)?;
    let geometry = DeviceGeometry::probe(device)?;
    info!(
        "Array {} is a healthy raid1 mirror with {} members (sector {} B, block {} B)",
        topology.device,
        topology.members.len(),
        geometry.sector_size,
        geometry.block_size
    );

    let size = filler::compute_size(&args.scratch_dir, args.reserve, geometry.block_size)?;
    info!(
        "Scratch directory is {}, trimmer file size is {} GB {} MB",
        args.scratch_dir.display(),
        size / (1024 * 1024 * 1024),
        (size % (1024 * 1024 * 1024)) / (1024 * 1024)
    );

    let mut filler = FillerFile::allocate(&args.scratch_dir, size, geometry.block_size)?;

    // One O_DIRECT handle per member, opened once and reused for both
    // verification passes.
    let mut members = Vec::with_capacity(topology.members.len());
    for member in topology.members {
        let reader = DirectReader::open(
            &member.device_path,
            geometry.sector_size,
            geometry.block_size,
        )?;
        members.push(ArrayMember::new(member, Box::new(reader)));
    }

    let orchestrator = TrimOrchestrator::new(geometry, DiscardDispatcher::default(), args.dry_run);
    let mapper = FibmapBlockMapper::new(geometry.sector_size);

    orchestrator.run(&mut filler, &mapper, &mut members, &HdparmDiscardProvider)
    // `filler` drops here, after post-verification, releasing the claimed space.
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false))
            .init();
    }
}
