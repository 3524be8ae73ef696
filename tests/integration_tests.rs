//! End-to-end protocol tests.
//!
//! These drive the full orchestrator state machine against a loopback mock
//! world: member "drives" read straight from the filler file (the block map
//! places every extent at `byte_offset = begin_lba * sector_size` and the
//! member offsets are zero, so a faithful mirror falls out for free), and
//! discard sinks rewrite the filler file the way real TRIM-capable drives
//! may: zeroing ranges, leaving them alone, or - for the corruption cases -
//! clobbering them with garbage.

use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use assert_matches::assert_matches;

use mdtrim::dispatch::DiscardDispatcher;
use mdtrim::error::{Error, Result};
use mdtrim::filler::FillerFile;
use mdtrim::orchestrator::TrimOrchestrator;
use mdtrim::plan::RawExtent;
use mdtrim::ports::{BlockMapper, DiscardChannelProvider, DiscardRange, DiscardSink, SectorReader};
use mdtrim::topology::{DeviceGeometry, MemberTopology};
use mdtrim::verify::ArrayMember;

const SECTOR: u32 = 512;
const BLOCK: u32 = 4096;

// =============================================================================
// Mock collaborators
// =============================================================================

/// Block mapper returning a fixed extent list.
struct StaticMapper {
    raw: Vec<RawExtent>,
}

impl BlockMapper for StaticMapper {
    fn map_extents(&self, _path: &Path) -> Result<Vec<RawExtent>> {
        Ok(self.raw.clone())
    }
}

/// Reads sectors straight from the filler file (loopback member with
/// physical offset zero).
struct FileSectorReader {
    file: File,
    label: String,
    buf: Vec<u8>,
}

impl FileSectorReader {
    fn open(path: &Path, label: &str) -> Self {
        Self {
            file: File::open(path).unwrap(),
            label: label.to_string(),
            buf: vec![0u8; SECTOR as usize],
        }
    }
}

impl SectorReader for FileSectorReader {
    fn read_sector(&mut self, byte_offset: u64) -> Result<&[u8]> {
        self.file
            .read_exact_at(&mut self.buf, byte_offset)
            .map_err(|_| Error::DeviceRead {
                member: self.label.clone(),
                offset: byte_offset,
                got: 0,
                wanted: SECTOR as usize,
            })?;
        Ok(&self.buf)
    }
}

/// Wraps a reader and flips one bit of every sector it returns, simulating
/// a wrong-device or misalignment bug on that member.
struct FlippingReader {
    inner: FileSectorReader,
}

impl SectorReader for FlippingReader {
    fn read_sector(&mut self, byte_offset: u64) -> Result<&[u8]> {
        self.inner.read_sector(byte_offset)?;
        self.inner.buf[7] ^= 0x01;
        Ok(&self.inner.buf)
    }
}

/// What a mock discard channel does to the ranges it receives.
#[derive(Clone, Copy, PartialEq, Eq)]
enum DiscardBehavior {
    /// Zero every discarded range (drive returns zeros after TRIM)
    Zero,
    /// Leave the data untouched (drive returns stale/original data)
    Keep,
    /// Clobber the first sector of each range with garbage
    Corrupt,
    /// Accept the stream but exit with a non-zero status, touching nothing
    FailStatus(i32),
}

struct MockSink {
    file: File,
    behavior: DiscardBehavior,
}

impl DiscardSink for MockSink {
    fn send(&mut self, range: DiscardRange) -> Result<()> {
        let start = range.start_sector * u64::from(SECTOR);
        match self.behavior {
            DiscardBehavior::Zero => {
                let zeros = vec![0u8; (range.length_sectors * u64::from(SECTOR)) as usize];
                self.file.write_all_at(&zeros, start)?;
            }
            DiscardBehavior::Corrupt => {
                let garbage = vec![0xABu8; SECTOR as usize];
                self.file.write_all_at(&garbage, start)?;
            }
            DiscardBehavior::Keep | DiscardBehavior::FailStatus(_) => {}
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<i32> {
        match self.behavior {
            DiscardBehavior::FailStatus(code) => Ok(code),
            _ => Ok(0),
        }
    }
}

/// Opens mock sinks against the filler file and records which member
/// devices were ever dispatched to.
struct MockProvider {
    filler_path: PathBuf,
    behaviors: Vec<(PathBuf, DiscardBehavior)>,
    opened: RefCell<Vec<PathBuf>>,
}

impl MockProvider {
    fn new(filler_path: &Path, behaviors: Vec<(PathBuf, DiscardBehavior)>) -> Self {
        Self {
            filler_path: filler_path.to_path_buf(),
            behaviors,
            opened: RefCell::new(Vec::new()),
        }
    }

    fn opened_count(&self) -> usize {
        self.opened.borrow().len()
    }
}

impl DiscardChannelProvider for MockProvider {
    fn open(&self, device_path: &Path) -> Result<Box<dyn DiscardSink>> {
        self.opened.borrow_mut().push(device_path.to_path_buf());
        let behavior = self
            .behaviors
            .iter()
            .find(|(p, _)| p == device_path)
            .map(|(_, b)| *b)
            .unwrap_or(DiscardBehavior::Zero);
        Ok(Box::new(MockSink {
            file: OpenOptions::new().write(true).open(&self.filler_path)?,
            behavior,
        }))
    }
}

// =============================================================================
// Harness
// =============================================================================

fn loopback_member(name: &str, filler_path: &Path, flip: bool) -> ArrayMember {
    let topology = MemberTopology {
        name: name.to_string(),
        device_path: PathBuf::from(format!("/dev/mock-{}", name)),
        data_offset: 0,
        partition_start: 0,
    };
    let reader: Box<dyn SectorReader> = if flip {
        Box::new(FlippingReader {
            inner: FileSectorReader::open(filler_path, name),
        })
    } else {
        Box::new(FileSectorReader::open(filler_path, name))
    };
    ArrayMember::new(topology, reader)
}

/// Three extents inside a 1 MiB filler file, placed so that
/// `byte_offset = begin_lba * sector_size`.
fn three_extents() -> Vec<RawExtent> {
    let raw = |begin: u64, len: u64| RawExtent {
        byte_offset: begin * u64::from(SECTOR),
        begin_lba: begin,
        end_lba: begin + len - 1,
        length_blocks: len,
    };
    vec![raw(0, 100), raw(200, 100), raw(500, 400)]
}

struct World {
    filler: FillerFile,
    mapper: StaticMapper,
    // dropped last, after the filler file inside it
    _dir: tempfile::TempDir,
}

impl World {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let filler = FillerFile::allocate(dir.path(), 1024 * 1024, BLOCK).unwrap();
        let mapper = StaticMapper {
            raw: three_extents(),
        };
        Self {
            filler,
            mapper,
            _dir: dir,
        }
    }

    fn orchestrator(&self, dry_run: bool) -> TrimOrchestrator {
        let geometry = DeviceGeometry {
            sector_size: SECTOR,
            block_size: BLOCK,
        };
        TrimOrchestrator::new(geometry, DiscardDispatcher::default(), dry_run)
    }
}

// =============================================================================
// End-to-end runs
// =============================================================================

#[test]
fn test_full_run_succeeds_on_two_clean_members() {
    let mut world = World::new();
    let path = world.filler.path().to_path_buf();
    let mut members = vec![
        loopback_member("a", &path, false),
        loopback_member("b", &path, false),
    ];
    let provider = MockProvider::new(
        &path,
        vec![
            (PathBuf::from("/dev/mock-a"), DiscardBehavior::Zero),
            (PathBuf::from("/dev/mock-b"), DiscardBehavior::Keep),
        ],
    );

    let report = world
        .orchestrator(false)
        .run(&mut world.filler, &world.mapper, &mut members, &provider)
        .unwrap();

    assert_eq!(report.extents, 3);
    assert!(report.signatures > 0);
    assert!(report.dispatch_failures.is_empty());
    assert!(!report.dry_run);
    // Both members were dispatched to, in order.
    assert_eq!(provider.opened_count(), 2);
}

#[test]
fn test_pre_verify_failure_skips_discard_for_all_members() {
    let mut world = World::new();
    let path = world.filler.path().to_path_buf();
    // Member a reads back flipped bytes; member b is faithful.
    let mut members = vec![
        loopback_member("a", &path, true),
        loopback_member("b", &path, false),
    ];
    let provider = MockProvider::new(&path, vec![]);

    let result = world
        .orchestrator(false)
        .run(&mut world.filler, &world.mapper, &mut members, &provider);

    let err = result.unwrap_err();
    assert_matches!(err, Error::SignatureMismatch { .. });
    assert_eq!(err.exit_code(), 2);
    // Discarding was never entered for either member, not just the bad one.
    assert_eq!(provider.opened_count(), 0);
}

#[test]
fn test_post_discard_corruption_is_distinct_failure_class() {
    let mut world = World::new();
    let path = world.filler.path().to_path_buf();
    let mut members = vec![
        loopback_member("a", &path, false),
        loopback_member("b", &path, false),
    ];
    let provider = MockProvider::new(
        &path,
        vec![
            (PathBuf::from("/dev/mock-a"), DiscardBehavior::Corrupt),
            (PathBuf::from("/dev/mock-b"), DiscardBehavior::Keep),
        ],
    );

    let result = world
        .orchestrator(false)
        .run(&mut world.filler, &world.mapper, &mut members, &provider);

    let err = result.unwrap_err();
    assert_matches!(err, Error::DataCorruption { .. });
    assert_eq!(err.exit_code(), 3);
    assert!(err.is_post_discard());
    // Distinct from the pre-discard abort class.
    assert_ne!(
        err.exit_code(),
        Error::SignatureMismatch {
            member: "a".into(),
            lba: 0,
            offset: 0,
        }
        .exit_code()
    );
}

#[test]
fn test_channel_failure_is_reported_but_run_still_verifies() {
    let mut world = World::new();
    let path = world.filler.path().to_path_buf();
    let mut members = vec![
        loopback_member("a", &path, false),
        loopback_member("b", &path, false),
    ];
    // Member a's channel fails without touching data; member b trims
    // normally. Post-verify must still pass on both.
    let provider = MockProvider::new(
        &path,
        vec![
            (PathBuf::from("/dev/mock-a"), DiscardBehavior::FailStatus(5)),
            (PathBuf::from("/dev/mock-b"), DiscardBehavior::Zero),
        ],
    );

    let report = world
        .orchestrator(false)
        .run(&mut world.filler, &world.mapper, &mut members, &provider)
        .unwrap();

    assert_eq!(report.dispatch_failures, vec!["a".to_string()]);
    // The failed member was still dispatched to and still verified.
    assert_eq!(provider.opened_count(), 2);
}

#[test]
fn test_dry_run_never_opens_a_discard_channel() {
    let mut world = World::new();
    let path = world.filler.path().to_path_buf();
    let mut members = vec![
        loopback_member("a", &path, false),
        loopback_member("b", &path, false),
    ];
    let provider = MockProvider::new(&path, vec![]);

    let report = world
        .orchestrator(true)
        .run(&mut world.filler, &world.mapper, &mut members, &provider)
        .unwrap();

    assert!(report.dry_run);
    assert_eq!(report.trimmed_sectors, 0);
    assert_eq!(provider.opened_count(), 0);
}

#[test]
fn test_inconsistent_block_map_aborts_before_planting() {
    let mut world = World::new();
    let path = world.filler.path().to_path_buf();
    // end - begin exceeds the claimed block count
    world.mapper = StaticMapper {
        raw: vec![RawExtent {
            byte_offset: 0,
            begin_lba: 0,
            end_lba: 500,
            length_blocks: 100,
        }],
    };
    let mut members = vec![loopback_member("a", &path, false)];
    let provider = MockProvider::new(&path, vec![]);

    let err = world
        .orchestrator(false)
        .run(&mut world.filler, &world.mapper, &mut members, &provider)
        .unwrap_err();

    assert_matches!(err, Error::ExtentInconsistency(_));
    assert_eq!(err.exit_code(), 1);
    assert_eq!(provider.opened_count(), 0);
}
