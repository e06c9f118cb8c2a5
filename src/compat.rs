//! Deciding whether a disk is an acceptable realization of a gadget
//! volume, and deriving the persistable device traits from an accepting
//! pair.

use std::{
	collections::HashMap,
	fs,
	path::{Path, PathBuf},
};

use anyhow::{anyhow, bail, Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
	gadget::{StructureRole, VolumeSchema, IMPLICIT_DATA_LABEL},
	layout::{LaidOutStructure, LaidOutVolume},
	ondisk::{OnDiskStructure, OnDiskVolume},
	quantity::{Offset, Size},
	utils,
};

/// GPT type of Linux filesystem data, the type of the implicit writable
/// partition.
pub const LINUX_FILESYSTEM_DATA_GUID: &str = "0FC63DAF-8483-4772-8E79-3D69D8477DE4";
const LINUX_FILESYSTEM_DATA_MBR: &str = "83";

#[derive(Copy, Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum EncryptionMethod {
	#[serde(rename = "LUKS")]
	Luks,
	/// Inline crypto engine; recognized but not supported.
	#[serde(rename = "ICE")]
	Ice,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct StructureEncryptionParameters {
	#[serde(default)]
	pub method: Option<EncryptionMethod>,
}

#[derive(Clone, Debug, Default)]
pub struct VolumeCompatOptions {
	/// Partitions created at install time (system-boot, system-save,
	/// system-data) are expected to exist on the disk.
	pub assume_creatable_partitions_created: bool,
	/// Accept a trailing writable ext4 partition that the gadget does not
	/// declare; legacy images carried one.
	pub allow_implicit_system_data: bool,
	/// Structures expected to be encrypted, keyed by structure name.
	pub expected_structure_encryption: HashMap<String, StructureEncryptionParameters>,
}

fn disk_schema_str(schema: VolumeSchema) -> &'static str {
	match schema {
		VolumeSchema::GPT => "gpt",
		VolumeSchema::MBR => "dos",
	}
}

/// Decide whether a disk structure is an acceptable realization of a
/// gadget structure. Returns the reason on a mismatch.
fn on_disk_structure_matches(
	gs: &LaidOutStructure,
	ds: &OnDiskStructure,
	schema: VolumeSchema,
	opts: &VolumeCompatOptions,
) -> std::result::Result<(), String> {
	if schema == VolumeSchema::GPT {
		// Names are only meaningful on GPT.
		let disk_name = ds.name.as_deref().unwrap_or("");
		if gs.name() != disk_name {
			return Err(format!(
				"names differ: disk partition is named \"{}\"",
				disk_name
			));
		}
	}
	if gs.start_offset != ds.start_offset {
		return Err(format!(
			"start offsets differ: {} on disk, {} in the gadget",
			ds.start_offset.bytes(),
			gs.start_offset.bytes()
		));
	}
	if ds.size < gs.structure.size {
		return Err(format!(
			"on disk size {} is smaller than gadget size {}",
			ds.size.bytes(),
			gs.structure.size.bytes()
		));
	}
	if ds.size > gs.structure.size && gs.structure.role != Some(StructureRole::SystemData) {
		return Err(format!(
			"on disk size {} is larger than gadget size {} (and the role does not permit it)",
			ds.size.bytes(),
			gs.structure.size.bytes()
		));
	}
	if gs.structure.has_filesystem() {
		// An expected-to-be-encrypted structure carries the ciphertext
		// filesystem, not the one the gadget declares.
		if opts.assume_creatable_partitions_created {
			if let Some(params) = opts.expected_structure_encryption.get(gs.name()) {
				return match params.method {
					Some(EncryptionMethod::Luks) => {
						let want_label = format!("{}-enc", gs.name());
						if ds.filesystem_label.as_deref() != Some(want_label.as_str()) {
							return Err(format!(
								"encrypted filesystem label is not \"{}\"",
								want_label
							));
						}
						if ds.filesystem_type.as_deref() != Some("crypto_LUKS") {
							return Err(
								"encrypted filesystem is not crypto_LUKS".to_owned()
							);
						}
						Ok(())
					}
					Some(EncryptionMethod::Ice) => {
						Err("encryption method ICE is not supported".to_owned())
					}
					None => Err("encryption method is unset".to_owned()),
				};
			}
		}
		let want = gs.structure.filesystem.to_string();
		if ds.filesystem_type.as_deref() != Some(want.as_str()) {
			return Err(format!(
				"filesystems differ: declared {}, on disk {}",
				want,
				ds.filesystem_type.as_deref().unwrap_or("none")
			));
		}
	}
	Ok(())
}

/// Whether a disk structure passes as the implicit system-data of a
/// gadget that predates declaring one: the last partition, ext4, of Linux
/// filesystem data type, labeled "writable", and exactly one partition
/// beyond what the gadget declares.
fn is_implicit_system_data(
	lv: &LaidOutVolume,
	disk: &OnDiskVolume,
	ds: &OnDiskStructure,
	opts: &VolumeCompatOptions,
) -> bool {
	if !opts.allow_implicit_system_data {
		return false;
	}
	if lv
		.structures
		.iter()
		.any(|gs| gs.structure.role == Some(StructureRole::SystemData))
	{
		return false;
	}
	let last_start = disk
		.structures
		.iter()
		.map(|s| s.start_offset)
		.max()
		.unwrap_or(Offset(0));
	if ds.start_offset != last_start {
		return false;
	}
	if ds.filesystem_type.as_deref() != Some("ext4") {
		return false;
	}
	let type_matches = match disk.schema {
		VolumeSchema::GPT => ds.part_type.eq_ignore_ascii_case(LINUX_FILESYSTEM_DATA_GUID),
		VolumeSchema::MBR => ds.part_type == LINUX_FILESYSTEM_DATA_MBR,
	};
	if !type_matches {
		return false;
	}
	if ds.filesystem_label.as_deref() != Some(IMPLICIT_DATA_LABEL) {
		return false;
	}
	let gadget_partitions = lv
		.structures
		.iter()
		.filter(|gs| gs.structure.is_partition())
		.count();
	disk.structures.len() == gadget_partitions + 1
}

/// Check that a disk is an acceptable realization of a laid-out gadget
/// volume.
pub fn ensure_volume_compatibility(
	lv: &LaidOutVolume,
	disk: &OnDiskVolume,
	opts: &VolumeCompatOptions,
) -> Result<()> {
	let usable = Size(disk.usable_sectors_end * disk.sector_size);
	if lv.size > usable {
		bail!(
			"device {} (last usable byte at {}) is too small to fit the requested layout ({})",
			disk.device.display(),
			usable,
			lv.size
		);
	}
	for gs in &lv.structures {
		if !gs.structure.is_mbr() && !gs.structure.size.is_multiple_of(disk.sector_size) {
			bail!(
				"gadget volume structure {} size is not a multiple of disk sector size {}",
				gs,
				disk.sector_size
			);
		}
	}
	if lv.volume.schema != disk.schema {
		bail!(
			"disk partitioning schema \"{}\" doesn't match gadget schema \"{}\"",
			disk_schema_str(disk.schema),
			disk_schema_str(lv.volume.schema)
		);
	}
	if let Some(id) = &lv.volume.id {
		if !id.eq_ignore_ascii_case(&disk.disk_id) {
			bail!(
				"disk ID \"{}\" doesn't match gadget volume ID \"{}\"",
				disk.disk_id,
				id
			);
		}
	}

	// Every disk structure must correspond to a gadget structure, with the
	// implicit system-data as the single tolerated exception.
	for ds in &disk.structures {
		let matched = lv
			.structures
			.iter()
			.any(|gs| on_disk_structure_matches(gs, ds, disk.schema, opts).is_ok());
		if !matched && !is_implicit_system_data(lv, disk, ds, opts) {
			bail!(
				"cannot find disk partition {} (starting at {}) in gadget",
				ds.node.display(),
				ds.start_offset.bytes()
			);
		}
	}

	// And the other way around, unless the structure is allowed to be
	// missing: non-partition structures always are, creatable-at-install
	// ones until they were created.
	for gs in &lv.structures {
		if !gs.structure.is_partition() {
			continue;
		}
		let mut reasons: Vec<String> = Vec::new();
		let matched = disk.structures.iter().any(|ds| {
			match on_disk_structure_matches(gs, ds, disk.schema, opts) {
				Ok(()) => true,
				Err(reason) => {
					if gs.start_offset == ds.start_offset {
						reasons.push(reason);
					}
					false
				}
			}
		});
		if matched {
			continue;
		}
		if gs.structure.is_creatable_at_install()
			&& !opts.assume_creatable_partitions_created
		{
			continue;
		}
		bail!(
			"cannot find gadget structure {} on disk{}",
			gs,
			if reasons.is_empty() {
				String::new()
			} else {
				format!(": {}", reasons.join("; "))
			}
		);
	}

	for name in opts.expected_structure_encryption.keys() {
		if !lv
			.structures
			.iter()
			.any(|gs| gs.name() == name && gs.structure.is_partition())
		{
			bail!(
				"expected encrypted structure \"{}\" not present in the gadget",
				name
			);
		}
	}
	Ok(())
}

/// A persistable record tying one gadget volume to the physical disk it
/// occupies, sufficient to re-identify the disk on a later boot even when
/// the device node changed.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct DiskVolumeDeviceTraits {
	/// Stable device path, under /sys.
	pub original_device_path: PathBuf,
	/// Device node at the time the traits were taken.
	pub original_kernel_path: PathBuf,
	pub disk_id: String,
	pub size: Size,
	pub sector_size: u64,
	pub schema: String,
	pub structure: Vec<DiskStructureDeviceTraits>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct DiskStructureDeviceTraits {
	pub original_device_path: PathBuf,
	pub original_kernel_path: PathBuf,
	#[serde(default)]
	pub partition_uuid: String,
	#[serde(default)]
	pub partition_label: String,
	#[serde(default)]
	pub partition_type: String,
	#[serde(default)]
	pub filesystem_uuid: String,
	#[serde(default)]
	pub filesystem_label: String,
	#[serde(default)]
	pub filesystem_type: String,
	pub offset: Offset,
	pub size: Size,
}

fn sysfs_block_path(node: &Path) -> PathBuf {
	let name = node
		.file_name()
		.map(|n| n.to_string_lossy().into_owned())
		.unwrap_or_default();
	Path::new("/sys/class/block").join(name)
}

/// Validate the gadget/disk pairing and derive the device traits from it.
pub fn disk_traits_from_device_and_validate(
	lv: &LaidOutVolume,
	disk: &OnDiskVolume,
	opts: &VolumeCompatOptions,
) -> Result<DiskVolumeDeviceTraits> {
	ensure_volume_compatibility(lv, disk, opts)?;

	let mut by_start: HashMap<u64, &OnDiskStructure> = disk
		.structures
		.iter()
		.map(|ds| (ds.start_offset.bytes(), ds))
		.collect();
	let mut structure = Vec::new();
	for gs in &lv.structures {
		if !gs.structure.is_partition() {
			continue;
		}
		let Some(ds) = by_start.remove(&gs.start_offset.bytes()) else {
			if gs.structure.is_creatable_at_install()
				&& !opts.assume_creatable_partitions_created
			{
				continue;
			}
			return Err(anyhow!(
				"internal error: no disk partition at offset {} for gadget structure {}",
				gs.start_offset.bytes(),
				gs
			));
		};
		structure.push(DiskStructureDeviceTraits {
			original_device_path: sysfs_block_path(&ds.node),
			original_kernel_path: ds.node.clone(),
			partition_uuid: ds.partition_uuid.clone().unwrap_or_default(),
			partition_label: ds.name.clone().unwrap_or_default(),
			partition_type: ds.part_type.clone(),
			filesystem_uuid: ds.filesystem_uuid.clone().unwrap_or_default(),
			filesystem_label: ds.filesystem_label.clone().unwrap_or_default(),
			filesystem_type: ds.filesystem_type.clone().unwrap_or_default(),
			offset: ds.start_offset,
			size: ds.size,
		});
	}
	// Anything still unclaimed must be the implicit system-data, or the
	// compatibility check above was wrong.
	for ds in by_start.values() {
		if !is_implicit_system_data(lv, disk, ds, opts) {
			return Err(anyhow!(
				"internal error: unexpected disk partition {} left after matching",
				ds.node.display()
			));
		}
	}
	Ok(DiskVolumeDeviceTraits {
		original_device_path: sysfs_block_path(&disk.device),
		original_kernel_path: disk.device.clone(),
		disk_id: disk.disk_id.clone(),
		size: disk.size,
		sector_size: disk.sector_size,
		schema: disk_schema_str(disk.schema).to_owned(),
		structure,
	})
}

/// Name of the persisted traits document within the state directory.
pub const DISK_MAPPING_FILE: &str = "disk-mapping.json";

/// Load the persisted volume-to-disk mapping. A missing file simply means
/// no mapping was saved yet.
pub fn load_disk_volumes_device_traits(
	state_dir: &Path,
) -> Result<HashMap<String, DiskVolumeDeviceTraits>> {
	let path = state_dir.join(DISK_MAPPING_FILE);
	let content = match fs::read(&path) {
		Ok(content) => content,
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
			debug!("No persisted disk mapping at '{}'", path.display());
			return Ok(HashMap::new());
		}
		Err(e) => {
			return Err(e)
				.with_context(|| format!("cannot read disk mapping '{}'", path.display()))
		}
	};
	serde_json::from_slice(&content)
		.with_context(|| format!("cannot parse disk mapping '{}'", path.display()))
}

pub fn save_disk_volumes_device_traits(
	state_dir: &Path,
	mapping: &HashMap<String, DiskVolumeDeviceTraits>,
) -> Result<()> {
	utils::mkdir_p(state_dir)?;
	let content = serde_json::to_vec_pretty(mapping)?;
	utils::atomic_write(&state_dir.join(DISK_MAPPING_FILE), &content)
		.context("cannot save the disk mapping")
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		gadget::GadgetSpec,
		layout::{layout_volume_partially, LayoutConstraints},
	};

	fn laid_out(manifest: &str) -> LaidOutVolume {
		let spec = GadgetSpec::from_toml(manifest).unwrap();
		let vol = spec.volumes.values().next().unwrap();
		layout_volume_partially(vol, &LayoutConstraints::default()).unwrap()
	}

	fn disk_structure(
		node: &str,
		index: u32,
		name: Option<&str>,
		start: u64,
		size: u64,
		part_type: &str,
	) -> OnDiskStructure {
		OnDiskStructure {
			node: PathBuf::from(node),
			disk_index: index,
			name: name.map(|s| s.to_owned()),
			partition_uuid: Some(format!("00000000-0000-0000-0000-00000000000{}", index)),
			part_type: part_type.to_owned(),
			start_offset: Offset(start),
			size: Size(size),
			filesystem_type: None,
			filesystem_label: None,
			filesystem_uuid: None,
		}
	}

	const GADGET: &str = r#"
[volumes.pc]
schema = "gpt"
[[volumes.pc.structure]]
name = "BIOS Boot"
type = "21686148-6449-6E6F-744E-656564454649"
offset = 1048576
size = 1048576
[[volumes.pc.structure]]
name = "EFI System"
role = "system-boot"
type = "C12A7328-F81F-11D2-BA4B-00A0C93EC93B"
filesystem = "vfat"
label = "system-boot"
size = 52428800
"#;

	fn matching_disk() -> OnDiskVolume {
		let mut esp = disk_structure(
			"/dev/vda2",
			2,
			Some("EFI System"),
			2 * 1048576,
			52428800,
			"C12A7328-F81F-11D2-BA4B-00A0C93EC93B",
		);
		esp.filesystem_type = Some("vfat".to_owned());
		esp.filesystem_label = Some("system-boot".to_owned());
		OnDiskVolume {
			device: PathBuf::from("/dev/vda"),
			disk_id: "A67AA901-2C72-4818-B098-7F1CAC127279".to_owned(),
			schema: VolumeSchema::GPT,
			size: Size(8388575 * 512),
			sector_size: 512,
			usable_sectors_end: 8388575,
			structures: vec![
				disk_structure(
					"/dev/vda1",
					1,
					Some("BIOS Boot"),
					1048576,
					1048576,
					"21686148-6449-6E6F-744E-656564454649",
				),
				esp,
			],
		}
	}

	#[test]
	fn test_accepting_pair() -> Result<()> {
		let lv = laid_out(GADGET);
		let disk = matching_disk();
		let opts = VolumeCompatOptions {
			assume_creatable_partitions_created: true,
			..Default::default()
		};
		ensure_volume_compatibility(&lv, &disk, &opts)?;
		let traits = disk_traits_from_device_and_validate(&lv, &disk, &opts)?;
		assert_eq!(traits.schema, "gpt");
		assert_eq!(traits.structure.len(), 2);
		assert_eq!(traits.structure[1].filesystem_label, "system-boot");
		assert_eq!(
			traits.structure[0].original_device_path,
			PathBuf::from("/sys/class/block/vda1")
		);
		Ok(())
	}

	#[test]
	fn test_schema_and_id_mismatches() {
		let lv = laid_out(GADGET);
		let mut disk = matching_disk();
		disk.schema = VolumeSchema::MBR;
		let err =
			ensure_volume_compatibility(&lv, &disk, &VolumeCompatOptions::default()).unwrap_err();
		assert!(format!("{:#}", err)
			.contains("disk partitioning schema \"dos\" doesn't match gadget schema \"gpt\""));

		let spec_with_id = GADGET.replace(
			"schema = \"gpt\"",
			"schema = \"gpt\"\nid = \"11111111-2222-3333-4444-555555555555\"",
		);
		let lv = laid_out(&spec_with_id);
		let disk = matching_disk();
		let err =
			ensure_volume_compatibility(&lv, &disk, &VolumeCompatOptions::default()).unwrap_err();
		assert!(format!("{:#}", err).contains("doesn't match gadget volume ID"));
	}

	#[test]
	fn test_size_rules() {
		// A disk partition larger than declared is only fine for
		// system-data.
		let lv = laid_out(GADGET);
		let mut disk = matching_disk();
		disk.structures[1].size = Size(52428800 + 512);
		let opts = VolumeCompatOptions {
			assume_creatable_partitions_created: true,
			..Default::default()
		};
		let err = ensure_volume_compatibility(&lv, &disk, &opts).unwrap_err();
		assert!(format!("{:#}", err).contains("cannot find disk partition"));

		let data_gadget = r#"
[volumes.pc]
schema = "gpt"
[[volumes.pc.structure]]
name = "writable"
role = "system-data"
type = "0FC63DAF-8483-4772-8E79-3D69D8477DE4"
filesystem = "ext4"
label = "writable"
offset = 1048576
size = 1048576
"#;
		let lv = laid_out(data_gadget);
		let mut ds = disk_structure(
			"/dev/vda1",
			1,
			Some("writable"),
			1048576,
			8 * 1048576,
			"0FC63DAF-8483-4772-8E79-3D69D8477DE4",
		);
		ds.filesystem_type = Some("ext4".to_owned());
		ds.filesystem_label = Some("writable".to_owned());
		let disk = OnDiskVolume {
			structures: vec![ds],
			..matching_disk()
		};
		ensure_volume_compatibility(&lv, &disk, &opts).unwrap();
	}

	#[test]
	fn test_gadget_too_large_for_disk() {
		let lv = laid_out(GADGET);
		let mut disk = matching_disk();
		disk.usable_sectors_end = 2048;
		let err =
			ensure_volume_compatibility(&lv, &disk, &VolumeCompatOptions::default()).unwrap_err();
		assert!(format!("{:#}", err).contains("too small to fit the requested layout"));
	}

	#[test]
	fn test_missing_creatable_structures() {
		let lv = laid_out(GADGET);
		let mut disk = matching_disk();
		disk.structures.truncate(1); // drop the ESP
		// Until install created them, creatable structures may be absent.
		ensure_volume_compatibility(&lv, &disk, &VolumeCompatOptions::default()).unwrap();
		// Once assumed created, their absence is an error.
		let opts = VolumeCompatOptions {
			assume_creatable_partitions_created: true,
			..Default::default()
		};
		let err = ensure_volume_compatibility(&lv, &disk, &opts).unwrap_err();
		assert!(format!("{:#}", err).contains("cannot find gadget structure"));
	}

	#[test]
	fn test_implicit_system_data() {
		let lv = laid_out(GADGET);
		let mut disk = matching_disk();
		let mut writable = disk_structure(
			"/dev/vda3",
			3,
			Some("Writable"),
			2 * 1048576 + 52428800,
			1048576,
			LINUX_FILESYSTEM_DATA_GUID,
		);
		writable.filesystem_type = Some("ext4".to_owned());
		writable.filesystem_label = Some("writable".to_owned());
		disk.structures.push(writable);

		let strict = VolumeCompatOptions {
			assume_creatable_partitions_created: true,
			..Default::default()
		};
		let err = ensure_volume_compatibility(&lv, &disk, &strict).unwrap_err();
		assert!(format!("{:#}", err).contains("cannot find disk partition /dev/vda3"));

		let opts = VolumeCompatOptions {
			assume_creatable_partitions_created: true,
			allow_implicit_system_data: true,
			..Default::default()
		};
		ensure_volume_compatibility(&lv, &disk, &opts).unwrap();
		// Traits derivation tolerates the leftover partition.
		let traits = disk_traits_from_device_and_validate(&lv, &disk, &opts).unwrap();
		assert_eq!(traits.structure.len(), 2);

		// The wrong label breaks the rule.
		disk.structures.last_mut().unwrap().filesystem_label = Some("data".to_owned());
		assert!(ensure_volume_compatibility(&lv, &disk, &opts).is_err());
	}

	#[test]
	fn test_encrypted_structure_expectations() {
		let data_gadget = r#"
[volumes.pc]
schema = "gpt"
[[volumes.pc.structure]]
name = "save"
role = "system-save"
type = "0FC63DAF-8483-4772-8E79-3D69D8477DE4"
filesystem = "ext4"
offset = 1048576
size = 1048576
"#;
		let lv = laid_out(data_gadget);
		let mut ds = disk_structure(
			"/dev/vda1",
			1,
			Some("save"),
			1048576,
			1048576,
			"0FC63DAF-8483-4772-8E79-3D69D8477DE4",
		);
		ds.filesystem_type = Some("crypto_LUKS".to_owned());
		ds.filesystem_label = Some("save-enc".to_owned());
		let disk = OnDiskVolume {
			structures: vec![ds],
			..matching_disk()
		};
		let mut opts = VolumeCompatOptions {
			assume_creatable_partitions_created: true,
			..Default::default()
		};
		opts.expected_structure_encryption.insert(
			"save".to_owned(),
			StructureEncryptionParameters {
				method: Some(EncryptionMethod::Luks),
			},
		);
		ensure_volume_compatibility(&lv, &disk, &opts).unwrap();

		// The wrong ciphertext label is a mismatch.
		let mut bad_label = disk.clone();
		bad_label.structures[0].filesystem_label = Some("save".to_owned());
		assert!(ensure_volume_compatibility(&lv, &bad_label, &opts).is_err());

		// ICE is recognized but unsupported, a missing method rejected.
		opts.expected_structure_encryption.insert(
			"save".to_owned(),
			StructureEncryptionParameters {
				method: Some(EncryptionMethod::Ice),
			},
		);
		assert!(ensure_volume_compatibility(&lv, &disk, &opts).is_err());
		opts.expected_structure_encryption
			.insert("save".to_owned(), StructureEncryptionParameters::default());
		assert!(ensure_volume_compatibility(&lv, &disk, &opts).is_err());

		// Every expected-encryption key must name a gadget structure. Use
		// a cleartext disk so the containment checks pass first.
		opts.expected_structure_encryption.clear();
		opts.expected_structure_encryption.insert(
			"mystery".to_owned(),
			StructureEncryptionParameters {
				method: Some(EncryptionMethod::Luks),
			},
		);
		let mut plain = disk.clone();
		plain.structures[0].filesystem_type = Some("ext4".to_owned());
		plain.structures[0].filesystem_label = Some("save".to_owned());
		let err = ensure_volume_compatibility(&lv, &plain, &opts).unwrap_err();
		assert!(format!("{:#}", err).contains("\"mystery\" not present in the gadget"));
	}

	#[test]
	fn test_traits_round_trip() -> Result<()> {
		let lv = laid_out(GADGET);
		let disk = matching_disk();
		let opts = VolumeCompatOptions {
			assume_creatable_partitions_created: true,
			..Default::default()
		};
		let traits = disk_traits_from_device_and_validate(&lv, &disk, &opts)?;
		let tmp = tempfile::tempdir()?;
		let state_dir = tmp.path().join("state");
		let mut mapping = HashMap::new();
		mapping.insert("pc".to_owned(), traits);
		save_disk_volumes_device_traits(&state_dir, &mapping)?;
		let loaded = load_disk_volumes_device_traits(&state_dir)?;
		assert_eq!(loaded, mapping);
		// Absent state is an empty mapping, not an error.
		let empty = load_disk_volumes_device_traits(&tmp.path().join("nowhere"))?;
		assert!(empty.is_empty());
		Ok(())
	}
}
