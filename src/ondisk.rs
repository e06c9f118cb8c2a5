//! Introspection of real block devices.
//!
//! The partition table comes from `sfdisk --json`, per-partition filesystem
//! information from `lsblk --json`, and the raw device size from
//! `blockdev --getsz`. The parse results are normalized into
//! [`OnDiskVolume`], the observed counterpart of a laid-out volume.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;

use crate::{
	gadget::VolumeSchema,
	labels,
	quantity::{Offset, Size},
	runner::{output_json, Runner},
};

#[derive(Debug, Deserialize)]
struct SfdiskOutput {
	partitiontable: SfdiskPartitionTable,
}

#[derive(Debug, Deserialize)]
pub struct SfdiskPartitionTable {
	pub label: String,
	pub id: String,
	pub device: String,
	pub unit: String,
	#[serde(default)]
	pub firstlba: Option<u64>,
	#[serde(default)]
	pub lastlba: Option<u64>,
	#[serde(default)]
	pub sectorsize: Option<u64>,
	#[serde(default)]
	pub partitions: Vec<SfdiskPartition>,
}

#[derive(Debug, Deserialize)]
pub struct SfdiskPartition {
	pub node: String,
	pub start: u64,
	pub size: u64,
	#[serde(rename = "type")]
	pub part_type: String,
	#[serde(default)]
	pub uuid: Option<String>,
	#[serde(default)]
	pub name: Option<String>,
	#[serde(default)]
	pub attrs: Option<String>,
	#[serde(default)]
	pub bootable: bool,
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
	#[serde(default)]
	blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LsblkDevice {
	pub name: String,
	#[serde(default)]
	pub fstype: Option<String>,
	#[serde(default)]
	pub label: Option<String>,
	#[serde(default)]
	pub uuid: Option<String>,
	#[serde(default)]
	pub mountpoint: Option<String>,
}

/// A partition as observed on a device.
#[derive(Debug, Clone)]
pub struct OnDiskStructure {
	pub node: PathBuf,
	/// 1-based slot in the partition table, derived from the node name.
	pub disk_index: u32,
	/// GPT partition name, raw as reported by sfdisk.
	pub name: Option<String>,
	pub partition_uuid: Option<String>,
	/// MBR types are normalized to two uppercase hex digits.
	pub part_type: String,
	pub start_offset: Offset,
	pub size: Size,
	pub filesystem_type: Option<String>,
	pub filesystem_label: Option<String>,
	pub filesystem_uuid: Option<String>,
}

/// A device's partition table and filesystem state, as observed.
#[derive(Debug, Clone)]
pub struct OnDiskVolume {
	pub device: PathBuf,
	pub disk_id: String,
	pub schema: VolumeSchema,
	pub size: Size,
	pub sector_size: u64,
	/// The first sector past the usable area: `lastlba + 1` on GPT, the
	/// device sector count on MBR.
	pub usable_sectors_end: u64,
	pub structures: Vec<OnDiskStructure>,
}

/// Derive the 1-based partition table slot from a device node name, e.g.
/// 3 for `/dev/sda3` and 1 for `/dev/loop0p1`.
fn partition_index_from_node(node: &str) -> Result<u32> {
	let digits: String = node
		.chars()
		.rev()
		.take_while(|c| c.is_ascii_digit())
		.collect::<Vec<_>>()
		.into_iter()
		.rev()
		.collect();
	if digits.is_empty() {
		bail!("cannot derive a partition index from node '{}'", node);
	}
	digits
		.parse()
		.with_context(|| format!("cannot derive a partition index from node '{}'", node))
}

/// MBR partition types arrive in whatever shape sfdisk prints; we keep
/// them as two uppercase hex digits.
fn normalize_mbr_type(t: &str) -> String {
	let t = t.strip_prefix("0x").unwrap_or(t);
	if t.len() == 1 {
		format!("0{}", t.to_ascii_uppercase())
	} else {
		t.to_ascii_uppercase()
	}
}

/// Filesystem info of a single partition node. Zero block devices in the
/// dump is tolerated and means "no filesystem".
fn filesystem_info(runner: &dyn Runner, node: &str) -> Result<Option<LsblkDevice>> {
	let out: LsblkOutput = output_json(
		runner,
		"lsblk",
		&["--json", "--output", "NAME,FSTYPE,LABEL,UUID,MOUNTPOINT", node],
	)
	.with_context(|| format!("cannot obtain filesystem information of {}", node))?;
	match out.blockdevices.len() {
		0 => Ok(None),
		1 => Ok(Some(out.blockdevices.into_iter().next().unwrap())),
		n => Err(anyhow!(
			"unexpected number of block devices for {}: got {}, expected one",
			node,
			n
		)),
	}
}

/// Number of 512-byte sectors of a block device.
fn device_sectors(runner: &dyn Runner, device: &Path) -> Result<u64> {
	let device = device.to_string_lossy();
	let out = runner
		.output("blockdev", &["--getsz", &device])
		.with_context(|| format!("cannot probe the size of {}", device))?;
	let text = String::from_utf8_lossy(&out);
	text.trim()
		.parse()
		.with_context(|| format!("unexpected size probe output {:?} for {}", text.trim(), device))
}

/// Obtain the partition table and filesystem state of a block device.
pub fn volume_from_device(runner: &dyn Runner, device: &Path) -> Result<OnDiskVolume> {
	let device_str = device.to_string_lossy();
	let out: SfdiskOutput = output_json(runner, "sfdisk", &["--json", &device_str])
		.with_context(|| format!("cannot obtain the partition table of {}", device_str))?;
	let table = out.partitiontable;
	if table.unit != "sectors" {
		bail!(
			"cannot position partitions: unknown unit '{}', expected sectors",
			table.unit
		);
	}
	let schema = match table.label.as_str() {
		"gpt" => VolumeSchema::GPT,
		"dos" => VolumeSchema::MBR,
		other => bail!("unsupported partition table type '{}'", other),
	};
	let sector_size = table.sectorsize.unwrap_or(crate::quantity::SECTOR_SIZE);

	let mut structures = Vec::with_capacity(table.partitions.len());
	for p in &table.partitions {
		let fs = filesystem_info(runner, &p.node)?;
		let part_type = match schema {
			VolumeSchema::MBR => normalize_mbr_type(&p.part_type),
			VolumeSchema::GPT => p.part_type.clone(),
		};
		structures.push(OnDiskStructure {
			node: PathBuf::from(&p.node),
			disk_index: partition_index_from_node(&p.node)?,
			name: p.name.clone(),
			partition_uuid: p.uuid.clone(),
			part_type,
			start_offset: Offset(p.start * sector_size),
			size: Size(p.size * sector_size),
			filesystem_type: fs.as_ref().and_then(|f| f.fstype.clone()),
			filesystem_label: fs
				.as_ref()
				.and_then(|f| f.label.as_deref())
				.map(labels::decode),
			filesystem_uuid: fs.as_ref().and_then(|f| f.uuid.clone()),
		});
	}

	let usable_sectors_end = match schema {
		VolumeSchema::GPT => {
			let lastlba = table
				.lastlba
				.context("GPT partition table dump carries no last LBA")?;
			lastlba + 1
		}
		VolumeSchema::MBR => device_sectors(runner, device)?,
	};
	Ok(OnDiskVolume {
		device: device.to_path_buf(),
		disk_id: table.id,
		schema,
		size: Size(usable_sectors_end * sector_size),
		sector_size,
		usable_sectors_end,
		structures,
	})
}

impl OnDiskVolume {
	pub fn structure_by_start(&self, start: Offset) -> Option<&OnDiskStructure> {
		self.structures.iter().find(|s| s.start_offset == start)
	}
}
