//! hdparm-backed adapters: `--fibmap` block mapping and
//! `--trim-sector-ranges-stdin` discard channels.
//!
//! The core never depends on hdparm's exact text formatting beyond the
//! documented field contract: fibmap lines carry four whitespace-separated
//! integers, and the discard channel accepts `start:length` lines
//! terminated by a blank line.

use std::io::Write;
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::plan::RawExtent;
use crate::ports::{BlockMapper, DiscardChannelProvider, DiscardRange, DiscardSink};

/// Lines of banner output before the extent table in `hdparm --fibmap`.
const FIBMAP_HEADER_LINES: usize = 4;

// =============================================================================
// Block Mapper
// =============================================================================

/// Maps a file's physical extents via `hdparm --fibmap`.
pub struct FibmapBlockMapper {
    sector_size: u32,
}

impl FibmapBlockMapper {
    pub fn new(sector_size: u32) -> Self {
        Self { sector_size }
    }
}

impl BlockMapper for FibmapBlockMapper {
    fn map_extents(&self, path: &Path) -> Result<Vec<RawExtent>> {
        let output = Command::new("hdparm").arg("--fibmap").arg(path).output()?;
        if !output.status.success() {
            return Err(Error::BlockMap(format!(
                "hdparm --fibmap {} failed with status {}",
                path.display(),
                output.status
            )));
        }

        let text = String::from_utf8_lossy(&output.stdout);
        let lines: Vec<&str> = text.lines().collect();

        // hdparm prints the sector size it assumed; a disagreement means
        // our offset arithmetic would be wrong, so say so loudly.
        if let Some(assumed) = lines.get(2) {
            let expected = format!("assuming {} byte sectors", self.sector_size);
            if !assumed.contains(&expected) {
                warn!(
                    "sector size disagreement: we assume {} bytes, hdparm says {:?}",
                    self.sector_size,
                    assumed.trim()
                );
            }
        }

        let mut extents = Vec::new();
        for line in lines.iter().skip(FIBMAP_HEADER_LINES) {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            extents.push(parse_fibmap_line(line)?);
        }

        debug!("fibmap reported {} extents for {}", extents.len(), path.display());
        Ok(extents)
    }
}

fn parse_fibmap_line(line: &str) -> Result<RawExtent> {
    let fields: Vec<u64> = line
        .split_whitespace()
        .map(|f| f.parse::<u64>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| Error::BlockMap(format!("bad fibmap line {:?}: {}", line, e)))?;

    if fields.len() != 4 {
        return Err(Error::BlockMap(format!(
            "fibmap line {:?} has {} fields, expected 4",
            line,
            fields.len()
        )));
    }

    Ok(RawExtent {
        byte_offset: fields[0],
        begin_lba: fields[1],
        end_lba: fields[2],
        length_blocks: fields[3],
    })
}

// =============================================================================
// Discard Channel
// =============================================================================

/// One member's discard stream: an `hdparm --trim-sector-ranges-stdin`
/// child process fed `start:length` lines on stdin.
pub struct HdparmDiscardSink {
    child: Child,
    stdin: Option<ChildStdin>,
    device: String,
}

impl HdparmDiscardSink {
    /// Spawn the discard channel for one member device.
    pub fn spawn(device_path: &Path) -> Result<Self> {
        let mut child = Command::new("hdparm")
            .arg("--please-destroy-my-drive")
            .arg("--trim-sector-ranges-stdin")
            .arg(device_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()?;

        let stdin = child.stdin.take();
        Ok(Self {
            child,
            stdin,
            device: device_path.display().to_string(),
        })
    }
}

impl DiscardSink for HdparmDiscardSink {
    fn send(&mut self, range: DiscardRange) -> Result<()> {
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            Error::Io(std::io::Error::other(format!(
                "discard channel for {} already terminated",
                self.device
            )))
        })?;
        writeln!(stdin, "{}", range)?;
        Ok(())
    }

    fn finish(&mut self) -> Result<i32> {
        // Blank line is the end-of-input marker; dropping the handle then
        // closes the pipe so the child can exit.
        if let Some(mut stdin) = self.stdin.take() {
            let _ = writeln!(stdin);
        }
        let status = self.child.wait()?;
        Ok(status.code().unwrap_or(-1))
    }
}

impl Drop for HdparmDiscardSink {
    fn drop(&mut self) {
        // A sink dropped without finish() must still let the child
        // terminate instead of leaving it blocked on stdin.
        if self.stdin.is_some() {
            let _ = self.finish();
        }
    }
}

/// Opens an [`HdparmDiscardSink`] per member device.
pub struct HdparmDiscardProvider;

impl DiscardChannelProvider for HdparmDiscardProvider {
    fn open(&self, device_path: &Path) -> Result<Box<dyn DiscardSink>> {
        Ok(Box::new(HdparmDiscardSink::spawn(device_path)?))
    }
}

// =============================================================================
// Tests
// =============================================================================
