//! Raw (non-filesystem) structure content: blitting images at computed
//! offsets, writing LBA pointers, and the backup/update/rollback cycle
//! over a block device.

use std::{
	fs::File,
	io::{self, Read, Seek, SeekFrom, Write},
	path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use log::debug;

use crate::{
	layout::{LaidOutContent, LaidOutStructure},
	quantity::Offset,
	update::{raw_content_backup_base, NoUpdateError, Updater},
	utils,
};

fn write_zeros<W: Write>(out: &mut W, mut count: u64) -> Result<()> {
	let zeros = [0u8; 64 * 1024];
	while count > 0 {
		let n = count.min(zeros.len() as u64) as usize;
		out.write_all(&zeros[..n])?;
		count -= n as u64;
	}
	Ok(())
}

/// Stream an image into `out` at the current position, padded with zeros
/// up to `size`. An image larger than `size` is an error.
fn write_image_content<W: Write>(image_path: &Path, size: u64, out: &mut W) -> Result<()> {
	let mut image = File::open(image_path)
		.with_context(|| format!("cannot open image '{}'", image_path.display()))?;
	let copied = io::copy(&mut Read::by_ref(&mut image).take(size), out)?;
	let mut probe = [0u8; 1];
	if image.read(&mut probe)? != 0 {
		bail!(
			"image '{}' is larger than the declared size {}",
			image_path.display(),
			size
		);
	}
	write_zeros(out, size - copied)
}

/// Writes the raw content of a bare structure into an output stream at
/// absolute volume offsets.
pub struct RawStructureWriter<'a> {
	gadget_root: PathBuf,
	structure: &'a LaidOutStructure,
}

impl<'a> RawStructureWriter<'a> {
	pub fn new(gadget_root: &Path, structure: &'a LaidOutStructure) -> Result<Self> {
		if structure.structure.has_filesystem() {
			bail!("structure {} is not a raw structure", structure);
		}
		Ok(RawStructureWriter {
			gadget_root: gadget_root.to_path_buf(),
			structure,
		})
	}

	pub fn write<W: Write + Seek>(&self, out: &mut W) -> Result<()> {
		for lc in &self.structure.content {
			let image = lc.content.image.as_deref().unwrap_or("");
			if image.is_empty() {
				bail!("structure {} content has no image", self.structure);
			}
			debug!(
				"Writing '{}' at offset {} ({} bytes)",
				image,
				lc.start_offset.bytes(),
				lc.size.bytes()
			);
			out.seek(SeekFrom::Start(lc.start_offset.bytes()))?;
			write_image_content(&self.gadget_root.join(image), lc.size.bytes(), out)
				.with_context(|| format!("cannot write content image '{}'", image))?;
		}
		Ok(())
	}
}

fn write_lba<W: Write + Seek>(
	out: &mut W,
	start: Offset,
	position: Offset,
	sector_size: u64,
) -> Result<()> {
	let lba = start.to_lba(sector_size)?;
	out.seek(SeekFrom::Start(position.bytes())).with_context(|| {
		format!(
			"cannot seek to offset {} to write LBA value {}",
			position.bytes(),
			lba
		)
	})?;
	out.write_all(&lba.to_le_bytes()).with_context(|| {
		format!(
			"cannot write LBA value {} at offset {}",
			lba,
			position.bytes()
		)
	})?;
	Ok(())
}

/// Write the start LBA of the structure, and of each raw content entry,
/// to their positioned offset-write locations. The LBA is a 32-bit
/// little-endian value.
pub fn write_offset_pointers<W: Write + Seek>(
	structure: &LaidOutStructure,
	sector_size: u64,
	out: &mut W,
) -> Result<()> {
	if let Some(position) = structure.positioned_offset_write {
		write_lba(out, structure.start_offset, position, sector_size)?;
	}
	for lc in &structure.content {
		if let Some(position) = lc.positioned_offset_write {
			write_lba(out, lc.start_offset, position, sector_size)?;
		}
	}
	Ok(())
}

/// Backup/update/rollback of a bare structure through the block device it
/// lives on.
pub struct RawStructureUpdater<'a> {
	structure: &'a LaidOutStructure,
	gadget_root: PathBuf,
	rollback_dir: PathBuf,
	device: PathBuf,
	/// Start of the structure on the device: 0 when the device is the
	/// structure's own partition, the structure's volume offset when it
	/// is the whole disk.
	device_offset: Offset,
}

impl<'a> RawStructureUpdater<'a> {
	pub fn new(
		structure: &'a LaidOutStructure,
		gadget_root: &Path,
		rollback_dir: &Path,
		device: PathBuf,
		device_offset: Offset,
	) -> Result<Self> {
		if structure.structure.has_filesystem() {
			bail!("structure {} is not a raw structure", structure);
		}
		Ok(RawStructureUpdater {
			structure,
			gadget_root: gadget_root.to_path_buf(),
			rollback_dir: rollback_dir.to_path_buf(),
			device,
			device_offset,
		})
	}

	fn content_position(&self, lc: &LaidOutContent) -> u64 {
		self.device_offset.bytes() + (lc.start_offset.bytes() - self.structure.start_offset.bytes())
	}

	fn stamp_base(&self, lc: &LaidOutContent) -> PathBuf {
		raw_content_backup_base(&self.rollback_dir, self.structure.yaml_index, lc.index)
	}

	fn image_path(&self, lc: &LaidOutContent) -> PathBuf {
		self.gadget_root
			.join(lc.content.image.as_deref().unwrap_or(""))
	}

	fn backup_content(&self, lc: &LaidOutContent) -> Result<()> {
		let base = self.stamp_base(lc);
		let backup = base.with_extension("backup");
		let same = base.with_extension("same");
		if backup.exists() || same.exists() {
			return Ok(());
		}
		let size = lc.size.bytes();
		let mut device = File::open(&self.device)
			.with_context(|| format!("cannot open device '{}'", self.device.display()))?;
		device.seek(SeekFrom::Start(self.content_position(lc)))?;
		let partial = base.with_extension("partial");
		let result = (|| -> Result<bool> {
			let mut out = File::create(&partial)?;
			let (read, device_digest) =
				utils::copy_and_hash(&mut Read::by_ref(&mut device).take(size), &mut out)?;
			if read != size {
				bail!(
					"cannot backup device '{}': expected {} bytes, read {}",
					self.device.display(),
					size,
					read
				);
			}
			out.sync_all()?;
			let update_digest = utils::padded_file_digest(&self.image_path(lc), size)?;
			Ok(device_digest == update_digest)
		})();
		match result {
			Ok(true) => {
				std::fs::remove_file(&partial)?;
				utils::atomic_write(&same, b"")?;
			}
			Ok(false) => {
				std::fs::rename(&partial, &backup)?;
			}
			Err(e) => {
				let _ = std::fs::remove_file(&partial);
				return Err(e);
			}
		}
		Ok(())
	}
}

impl Updater for RawStructureUpdater<'_> {
	fn backup(&self) -> Result<()> {
		utils::mkdir_p(&self.rollback_dir)?;
		for lc in &self.structure.content {
			self.backup_content(lc).with_context(|| {
				format!(
					"cannot backup content #{} of structure {}",
					lc.index, self.structure
				)
			})?;
		}
		Ok(())
	}

	fn update(&self) -> Result<()> {
		// The backup pass must have stamped every content entry.
		let mut pending: Vec<&LaidOutContent> = Vec::new();
		for lc in &self.structure.content {
			let base = self.stamp_base(lc);
			if base.with_extension("same").exists() {
				continue;
			}
			if !base.with_extension("backup").exists() {
				bail!(
					"missing backup file for content #{} of structure {}",
					lc.index,
					self.structure
				);
			}
			pending.push(lc);
		}
		if pending.is_empty() {
			return Err(anyhow::Error::new(NoUpdateError));
		}
		let mut device = File::options()
			.write(true)
			.open(&self.device)
			.with_context(|| format!("cannot open device '{}'", self.device.display()))?;
		for lc in pending {
			device.seek(SeekFrom::Start(self.content_position(lc)))?;
			write_image_content(&self.image_path(lc), lc.size.bytes(), &mut device)
				.with_context(|| {
					format!(
						"cannot update content #{} of structure {}",
						lc.index, self.structure
					)
				})?;
		}
		device.sync_all()?;
		Ok(())
	}

	fn rollback(&self) -> Result<()> {
		let mut device = File::options()
			.write(true)
			.open(&self.device)
			.with_context(|| format!("cannot open device '{}'", self.device.display()))?;
		for lc in &self.structure.content {
			let base = self.stamp_base(lc);
			if base.with_extension("same").exists() {
				continue;
			}
			let backup = base.with_extension("backup");
			let mut from = File::open(&backup).with_context(|| {
				format!(
					"cannot roll back content #{} of structure {}: missing backup file",
					lc.index, self.structure
				)
			})?;
			device.seek(SeekFrom::Start(self.content_position(lc)))?;
			io::copy(&mut from, &mut device)?;
		}
		device.sync_all()?;
		Ok(())
	}

	fn name(&self) -> String {
		format!("raw structure {}", self.structure)
	}
}
