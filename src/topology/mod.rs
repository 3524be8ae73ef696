//! mdadm array topology discovery.
//!
//! Reads the array's level, health state, and per-member offsets from Linux
//! sysfs, and probes device geometry via `blockdev`. Only mirrored (raid1)
//! arrays in an operative state are accepted; everything else is refused
//! before any space is reserved.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::info;

use crate::error::{Error, Result};

// =============================================================================
// Device Geometry
// =============================================================================

/// Logical sector size and physical block size of the array device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceGeometry {
    /// Logical sector size in bytes
    pub sector_size: u32,
    /// Physical block size in bytes
    pub block_size: u32,
}

impl DeviceGeometry {
    /// Probe geometry for `/dev/<device>` via `blockdev`.
    pub fn probe(device: &str) -> Result<Self> {
        let sector_size = blockdev_query("--getss", device)?;
        let block_size = blockdev_query("--getbsz", device)?;
        let geometry = Self {
            sector_size,
            block_size,
        };
        geometry.validate()?;
        Ok(geometry)
    }

    /// Block size must be a whole multiple of sector size, or every
    /// sector-to-block conversion in the run would be wrong.
    pub fn validate(&self) -> Result<()> {
        if self.sector_size == 0 || self.block_size % self.sector_size != 0 {
            return Err(Error::Topology(format!(
                "block size {} is not a whole multiple of sector size {}",
                self.block_size, self.sector_size
            )));
        }
        Ok(())
    }

    /// Sectors per physical block.
    pub fn sectors_per_block(&self) -> u32 {
        self.block_size / self.sector_size
    }
}

fn blockdev_query(flag: &str, device: &str) -> Result<u32> {
    let output = Command::new("blockdev")
        .arg(flag)
        .arg(format!("/dev/{}", device))
        .output()?;
    if !output.status.success() {
        return Err(Error::Topology(format!(
            "blockdev {} /dev/{} failed with status {}",
            flag, device, output.status
        )));
    }
    String::from_utf8_lossy(&output.stdout)
        .trim()
        .parse()
        .map_err(|e| Error::Topology(format!("blockdev {} output not a number: {}", flag, e)))
}

// =============================================================================
// Members
// =============================================================================

/// One physical drive backing a mirror copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberTopology {
    /// Slave name inside the array (e.g. `sdb2`)
    pub name: String,
    /// Whole-disk device node the raw reads and discards go to (e.g. `/dev/sdb`)
    pub device_path: PathBuf,
    /// Array-level data offset in sectors (`md/dev-<slave>/offset`)
    pub data_offset: u64,
    /// Partition start offset on the disk, in sectors
    pub partition_start: u64,
}

impl MemberTopology {
    /// Combined sector offset from the start of the disk to the array's
    /// data area on this member.
    ///
    /// The two terms are kept separate until this point: pre-collapsing
    /// them incorrectly is the classic misalignment bug this tool exists
    /// to catch.
    pub fn physical_offset_sectors(&self) -> u64 {
        self.data_offset + self.partition_start
    }
}

/// The mirrored array: its name and all member drives.
#[derive(Debug, Clone)]
pub struct ArrayTopology {
    /// Array device name (e.g. `md1`)
    pub device: String,
    /// Member drives, ordered by slave name
    pub members: Vec<MemberTopology>,
}

impl ArrayTopology {
    /// Discover the topology of `/dev/<device>` from sysfs.
    ///
    /// Fails with [`Error::Topology`] if the array is not raid1, not in an
    /// operative state (`active` or `clean`), or has no members.
    pub fn discover(device: &str) -> Result<Self> {
        let sys = PathBuf::from(format!("/sys/block/{}", device));
        if !sys.join("md/level").is_file() {
            return Err(Error::Topology(format!(
                "{} does not look like an md array (no {}/md/level)",
                device,
                sys.display()
            )));
        }

        let level = read_trimmed(&sys.join("md/level"))?;
        if level != "raid1" {
            return Err(Error::Topology(format!(
                "unsupported RAID level {:?}: only raid1 mirrors are supported",
                level
            )));
        }

        let state = read_trimmed(&sys.join("md/array_state"))?;
        if !matches!(state.as_str(), "active" | "clean") {
            return Err(Error::Topology(format!(
                "array state {:?} is not operative (need active or clean)",
                state
            )));
        }

        let mut members = Vec::new();
        for entry in fs::read_dir(sys.join("slaves"))? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            members.push(Self::discover_member(&sys, &name)?);
        }
        members.sort_by(|a, b| a.name.cmp(&b.name));

        if members.is_empty() {
            return Err(Error::Topology(format!("array {} has no member drives", device)));
        }

        Ok(Self {
            device: device.to_string(),
            members,
        })
    }

    fn discover_member(sys: &Path, name: &str) -> Result<MemberTopology> {
        let data_offset: u64 = read_trimmed(&sys.join(format!("md/dev-{}/offset", name)))?
            .parse()
            .map_err(|e| Error::Topology(format!("bad md offset for {}: {}", name, e)))?;

        // The slave entry is a symlink into /sys/devices; resolve it to
        // find the partition start and the parent whole-disk node.
        let slave = fs::canonicalize(sys.join("slaves").join(name))?;

        let start_file = slave.join("start");
        let (partition_start, disk) = if start_file.is_file() {
            let start = read_trimmed(&start_file)?
                .parse()
                .map_err(|e| Error::Topology(format!("bad partition start for {}: {}", name, e)))?;
            let parent = slave
                .parent()
                .and_then(|p| p.file_name())
                .ok_or_else(|| {
                    Error::Topology(format!("cannot resolve parent disk of slave {}", name))
                })?;
            (start, parent.to_string_lossy().into_owned())
        } else {
            // Whole-disk member, no containing partition.
            (0, name.to_string())
        };

        let member = MemberTopology {
            name: name.to_string(),
            device_path: PathBuf::from(format!("/dev/{}", disk)),
            data_offset,
            partition_start,
        };

        info!(
            "Found slave {} on {} with MD offset {} and partition offset {}",
            member.name,
            member.device_path.display(),
            member.data_offset,
            member.partition_start
        );

        Ok(member)
    }
}

fn read_trimmed(path: &Path) -> Result<String> {
    Ok(fs::read_to_string(path)?.trim().to_string())
}

// =============================================================================
// Tests
// =============================================================================
