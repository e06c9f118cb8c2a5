//! Image construction: turning a laid-out volume into a raw disk image.
//!
//! The partition table is written by feeding sfdisk a sector-unit script;
//! filesystem structures are built offline with mkfs and blitted into the
//! image at their computed offsets, bare structures through the raw
//! writer. A second entry point emits script rows for partitions missing
//! from a real disk, which is how the creatable-at-install structures are
//! added on first boot.

use std::{
	fmt::Write as _,
	fs::File,
	io::{self, Seek, SeekFrom},
	path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use log::{debug, info};
use uuid::Uuid;

use crate::{
	gadget::{FilesystemType, StructureRole, VolumeSchema},
	layout::{LaidOutStructure, LaidOutVolume},
	mountedfs::MountedFilesystemWriter,
	ondisk::OnDiskVolume,
	quantity::SECTOR_SIZE,
	raw::{write_offset_pointers, RawStructureWriter},
	runner::Runner,
	utils,
};

fn script_type(ls: &LaidOutStructure, schema: VolumeSchema) -> Result<String> {
	let t = match schema {
		VolumeSchema::GPT => ls.structure.gpt_type(),
		VolumeSchema::MBR => ls.structure.mbr_type(),
	};
	t.map(|t| t.to_owned()).with_context(|| {
		format!(
			"structure {} has no type usable on a {} volume",
			ls, schema
		)
	})
}

fn script_row(ls: &LaidOutStructure, schema: VolumeSchema, size_sectors: u64) -> Result<String> {
	let mut row = format!(
		"start={}, size={}, type={}",
		ls.start_offset.bytes() / SECTOR_SIZE,
		size_sectors,
		script_type(ls, schema)?
	);
	if schema == VolumeSchema::GPT {
		write!(row, ", name=\"{}\"", ls.name()).unwrap();
	}
	if schema == VolumeSchema::MBR && ls.structure.role == Some(StructureRole::SystemBoot) {
		row.push_str(", bootable");
	}
	row.push('\n');
	Ok(row)
}

/// The sector-unit partitioning script for a whole volume. Only 512-byte
/// sectors are supported by the script consumer.
pub fn partition_script(lv: &LaidOutVolume, disk_id: &str) -> Result<String> {
	if lv.sector_size != SECTOR_SIZE {
		bail!(
			"cannot create partitioning script: only {}-byte sectors are supported, volume uses {}",
			SECTOR_SIZE,
			lv.sector_size
		);
	}
	let schema = lv.volume.schema;
	let mut script = String::from("unit: sectors\n");
	script += match schema {
		VolumeSchema::GPT => "label: gpt\n",
		VolumeSchema::MBR => "label: dos\n",
	};
	if !disk_id.is_empty() {
		writeln!(script, "label-id: {}", disk_id).unwrap();
	}
	script.push('\n');
	for ls in &lv.structures {
		if !ls.structure.is_partition() {
			continue;
		}
		script += &script_row(ls, schema, ls.structure.size.bytes() / SECTOR_SIZE)?;
	}
	Ok(script)
}

/// Script rows for the laid-out partitions not present on the disk yet.
/// A trailing system-data structure is expanded to the end of the usable
/// area. Returns the rows and the structures they describe.
pub fn build_partition_list<'a>(
	disk: &OnDiskVolume,
	lv: &'a LaidOutVolume,
) -> Result<(String, Vec<&'a LaidOutStructure>)> {
	if disk.sector_size != SECTOR_SIZE {
		bail!(
			"cannot create partitioning script: only {}-byte sectors are supported, disk uses {}",
			SECTOR_SIZE,
			disk.sector_size
		);
	}
	let last_partition_start = lv
		.structures
		.iter()
		.filter(|ls| ls.structure.is_partition())
		.map(|ls| ls.start_offset)
		.max();
	let mut script = String::new();
	let mut created = Vec::new();
	for ls in &lv.structures {
		if !ls.structure.is_partition() {
			continue;
		}
		if disk.structure_by_start(ls.start_offset).is_some() {
			continue;
		}
		if !ls.structure.is_creatable_at_install() {
			bail!(
				"cannot create partition for structure {}: it is not created at install",
				ls
			);
		}
		let start_sector = ls.start_offset.bytes() / SECTOR_SIZE;
		// Only the trailing system-data may grow to fill the disk.
		let size_sectors = if ls.structure.role == Some(StructureRole::SystemData)
			&& Some(ls.start_offset) == last_partition_start
		{
			disk.usable_sectors_end - start_sector
		} else {
			ls.structure.size.bytes() / SECTOR_SIZE
		};
		script += &script_row(ls, lv.volume.schema, size_sectors)?;
		created.push(ls);
	}
	Ok((script, created))
}

/// Create a filesystem on `img`, populated from `content_root`.
pub fn mkfs_with_content(
	runner: &dyn Runner,
	fs_type: FilesystemType,
	img: &Path,
	label: Option<&str>,
	content_root: Option<&Path>,
) -> Result<()> {
	let img_str = img.to_string_lossy().into_owned();
	match fs_type {
		FilesystemType::Ext4 => {
			let mut args: Vec<&str> = vec!["-q"];
			if let Some(label) = label {
				args.extend(["-L", label]);
			}
			let root;
			if let Some(content_root) = content_root {
				root = content_root.to_string_lossy().into_owned();
				args.extend(["-d", root.as_str()]);
			}
			args.push(img_str.as_str());
			runner.run("mkfs.ext4", &args)
		}
		FilesystemType::Vfat => {
			// Sector size and cluster geometry are left to mkfs; the
			// content goes in with mcopy afterwards.
			let mut args: Vec<&str> = vec!["-S", "512", "-s", "1"];
			if let Some(label) = label {
				args.extend(["-n", label]);
			}
			args.push(&img_str);
			runner.run("mkfs.vfat", &args)?;
			if let Some(content_root) = content_root {
				let mut entries: Vec<PathBuf> = std::fs::read_dir(content_root)
					.with_context(|| {
						format!("cannot enumerate '{}'", content_root.display())
					})?
					.map(|e| e.map(|e| e.path()))
					.collect::<std::io::Result<_>>()?;
				entries.sort();
				for entry in entries {
					let entry_str = entry.to_string_lossy().into_owned();
					runner.run(
						"mcopy",
						&["-i", &img_str, "-s", &entry_str, "::"],
					)?;
				}
			}
			Ok(())
		}
		FilesystemType::None => bail!("structure has no filesystem to create"),
	}
}

/// Copy a structure image into the volume image at the structure's start.
fn blit<P: AsRef<Path>>(part_img: P, out: &mut File, offset: u64) -> Result<()> {
	let mut from = File::open(part_img.as_ref())?;
	out.seek(SeekFrom::Start(offset))?;
	io::copy(&mut from, out)?;
	Ok(())
}

/// Write the complete raw image of a laid-out volume.
///
/// The gadget may pin the disk identifier; otherwise one is generated, a
/// GUID on GPT and a 32-bit id on MBR.
pub fn write_volume_image(
	runner: &dyn Runner,
	lv: &LaidOutVolume,
	gadget_root: &Path,
	img_path: &Path,
	workdir: &Path,
) -> Result<()> {
	let disk_id = match &lv.volume.id {
		Some(id) => id.clone(),
		None => match lv.volume.schema {
			VolumeSchema::GPT => Uuid::new_v4().to_string(),
			VolumeSchema::MBR => format!("0x{:08x}", rand::random::<u32>()),
		},
	};
	info!(
		"Creating image of volume '{}' at '{}' ({})",
		lv.volume.name,
		img_path.display(),
		lv.size
	);
	utils::mkdir_p(workdir)?;
	utils::create_sparse_file(img_path, lv.size.bytes())?;
	let script = partition_script(lv, &disk_id)?;
	debug!("Partitioning script:\n{}", script);
	let img_str = img_path.to_string_lossy().into_owned();
	runner
		.feed("sfdisk", &["--no-reread", "--no-tell-kernel", &img_str], script.as_bytes())
		.context("cannot write the partition table")?;

	let mut img = File::options().read(true).write(true).open(img_path)?;
	for ls in &lv.structures {
		if ls.structure.has_filesystem() {
			let staging = workdir.join(format!("struct-{}-root", ls.yaml_index));
			utils::mkdir_p(&staging)?;
			MountedFilesystemWriter::new(ls, None)?.write(&staging, &[])?;
			let part_img = workdir.join(format!("struct-{}.img", ls.yaml_index));
			utils::create_sparse_file(&part_img, ls.structure.size.bytes())?;
			mkfs_with_content(
				runner,
				ls.structure.filesystem,
				&part_img,
				ls.structure.effective_filesystem_label(),
				Some(&staging),
			)
			.with_context(|| format!("cannot create filesystem of structure {}", ls))?;
			blit(&part_img, &mut img, ls.start_offset.bytes())
				.with_context(|| format!("cannot write structure {}", ls))?;
		} else if !ls.content.is_empty() {
			// Raw content goes directly into the volume image.
			RawStructureWriter::new(gadget_root, ls)?.write(&mut img)?;
		}
	}
	for ls in &lv.structures {
		write_offset_pointers(ls, lv.sector_size, &mut img)?;
	}
	img.sync_all()?;
	Ok(())
}
