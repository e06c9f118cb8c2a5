//! The volume layout solver.
//!
//! Takes the declared structures of a [`Volume`] and assigns absolute byte
//! offsets to every structure and to every raw content entry, honoring
//! explicit offsets, the non-MBR start offset and the sector size. The
//! result is the single source of truth for the image writer, the
//! compatibility checker and the updaters.

use std::{
	collections::HashMap,
	fmt, fs,
	path::{Path, PathBuf},
};

use anyhow::{anyhow, bail, Context, Result};

use crate::{
	gadget::{RelativeOffset, Volume, VolumeContent, VolumeStructure},
	kernel::{parse_kernel_ref, KernelInfo},
	quantity::{InvalidOffsetError, Offset, Size, NON_MBR_START_OFFSET, SECTOR_SIZE},
};

#[derive(Clone, Debug)]
pub struct LayoutConstraints {
	/// Structures without an explicit offset never start below this.
	pub non_mbr_start_offset: Offset,
	pub sector_size: u64,
	/// Leave filesystem content unresolved; used when the caller wants to
	/// filter the content set before resolving it.
	pub skip_resolve_content: bool,
}

impl Default for LayoutConstraints {
	fn default() -> Self {
		LayoutConstraints {
			non_mbr_start_offset: NON_MBR_START_OFFSET,
			sector_size: SECTOR_SIZE,
			skip_resolve_content: false,
		}
	}
}

/// A volume with every structure assigned its absolute position.
#[derive(Clone, Debug)]
pub struct LaidOutVolume {
	pub volume: Volume,
	/// Total size, i.e. the farthest structure end.
	pub size: Size,
	pub sector_size: u64,
	/// Structures ordered by start offset.
	pub structures: Vec<LaidOutStructure>,
}

/// The partial variant skips all content resolution; it carries placement
/// information only. Used for the old side of an update.
pub type PartiallyLaidOutVolume = LaidOutVolume;

#[derive(Clone, Debug)]
pub struct LaidOutStructure {
	pub structure: VolumeStructure,
	/// Index in declaration order, 0-based. Stable across layout, used for
	/// pairing structures between gadget revisions and for backup naming.
	pub yaml_index: usize,
	pub start_offset: Offset,
	/// Absolute location to write this structure's start LBA to.
	pub positioned_offset_write: Option<Offset>,
	/// Raw content of bare structures, ordered by start offset.
	pub content: Vec<LaidOutContent>,
	/// Resolved content of filesystem structures.
	pub resolved_content: Vec<ResolvedContent>,
}

impl LaidOutStructure {
	pub fn name(&self) -> &str {
		self.structure.name.as_deref().unwrap_or("")
	}

	pub fn end(&self) -> Offset {
		Offset(self.start_offset.bytes() + self.structure.size.bytes())
	}
}

impl fmt::Display for LaidOutStructure {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match &self.structure.name {
			Some(name) => write!(f, "#{} (\"{}\")", self.yaml_index, name),
			None => write!(f, "#{}", self.yaml_index),
		}
	}
}

#[derive(Clone, Debug)]
pub struct LaidOutContent {
	pub content: VolumeContent,
	/// Index in declaration order within the structure.
	pub index: usize,
	/// Absolute start within the volume.
	pub start_offset: Offset,
	/// Actual byte span on the volume: the declared size, or the image
	/// size when none was declared.
	pub size: Size,
	pub positioned_offset_write: Option<Offset>,
}

impl LaidOutContent {
	pub fn end(&self) -> Offset {
		Offset(self.start_offset.bytes() + self.size.bytes())
	}
}

/// A filesystem content entry with its source resolved to a staged path.
#[derive(Clone, Debug)]
pub struct ResolvedContent {
	pub content: VolumeContent,
	pub resolved_source: PathBuf,
	/// True when the source came out of a kernel asset flagged for
	/// updates.
	pub kernel_update: bool,
}

/// Lay out a volume and resolve its content.
pub fn layout_volume(
	volume: &Volume,
	gadget_root: &Path,
	kernel_root: Option<&Path>,
	kernel_info: Option<&KernelInfo>,
	constraints: &LayoutConstraints,
) -> Result<LaidOutVolume> {
	let mut laid_out = place_structures(volume, constraints)?;
	let starts: HashMap<String, Offset> = laid_out
		.structures
		.iter()
		.filter_map(|ls| {
			ls.structure
				.name
				.clone()
				.map(|name| (name, ls.start_offset))
		})
		.collect();
	for ls in laid_out.structures.iter_mut() {
		ls.positioned_offset_write = position_offset_write(
			ls.structure.offset_write.as_ref(),
			&starts,
			laid_out.size,
		)
		.with_context(|| format!("cannot position offset-write of structure {}", ls))?;
		if !ls.structure.has_filesystem() {
			layout_bare_content(gadget_root, ls, &starts, laid_out.size)?;
		} else if !constraints.skip_resolve_content {
			resolve_structure_content(ls, gadget_root, kernel_root, kernel_info)?;
		}
	}
	Ok(laid_out)
}

/// Lay out a volume without touching any content. The gadget directory is
/// not needed and may not even exist anymore.
pub fn layout_volume_partially(
	volume: &Volume,
	constraints: &LayoutConstraints,
) -> Result<PartiallyLaidOutVolume> {
	place_structures(volume, constraints)
}

fn place_structures(volume: &Volume, constraints: &LayoutConstraints) -> Result<LaidOutVolume> {
	if constraints.sector_size == 0 {
		bail!("sector size must not be zero");
	}
	let mut structures = Vec::with_capacity(volume.structure.len());
	let mut previous_end = Offset(0);
	let mut farthest_end = Offset(0);
	for (yaml_index, vs) in volume.structure.iter().enumerate() {
		if !vs.is_mbr() && !vs.size.is_multiple_of(constraints.sector_size) {
			bail!(
				"cannot lay out volume '{}': size {} of structure #{} is not a multiple of the sector size {}",
				volume.name,
				vs.size.bytes(),
				yaml_index,
				constraints.sector_size
			);
		}
		let start_offset = match vs.offset {
			Some(offset) => offset,
			None if vs.is_mbr() => previous_end,
			None => previous_end.max(constraints.non_mbr_start_offset),
		};
		let end = start_offset.checked_add(vs.size).with_context(|| {
			format!(
				"cannot lay out volume '{}': structure #{} extends beyond addressable space",
				volume.name, yaml_index
			)
		})?;
		previous_end = end;
		farthest_end = farthest_end.max(end);
		structures.push(LaidOutStructure {
			structure: vs.clone(),
			yaml_index,
			start_offset,
			positioned_offset_write: None,
			content: Vec::new(),
			resolved_content: Vec::new(),
		});
	}
	structures.sort_by_key(|ls| ls.start_offset);
	for pair in structures.windows(2) {
		if pair[1].start_offset < pair[0].end() {
			bail!(
				"cannot lay out volume '{}': structure {} overlaps with the preceding structure {}",
				volume.name,
				pair[1],
				pair[0]
			);
		}
	}
	Ok(LaidOutVolume {
		volume: volume.clone(),
		size: Size(farthest_end.bytes()),
		sector_size: constraints.sector_size,
		structures,
	})
}

fn position_offset_write(
	offset_write: Option<&RelativeOffset>,
	starts: &HashMap<String, Offset>,
	volume_size: Size,
) -> Result<Option<Offset>> {
	let Some(ow) = offset_write else {
		return Ok(None);
	};
	let base = match &ow.relative_to {
		Some(name) => *starts
			.get(name)
			.with_context(|| format!("refers to an unknown structure \"{}\"", name))?,
		None => Offset(0),
	};
	let position = base.checked_add(Size(ow.offset.bytes()))?;
	// The write target holds a 32-bit LBA, so the last valid position is
	// four bytes short of the volume end.
	if volume_size.bytes() < 4 || position.bytes() > volume_size.bytes() - 4 {
		return Err(anyhow!(InvalidOffsetError {
			offset: position.bytes(),
			lower: 0,
			upper: volume_size.bytes().saturating_sub(4),
		}));
	}
	Ok(Some(position))
}

fn layout_bare_content(
	gadget_root: &Path,
	ls: &mut LaidOutStructure,
	starts: &HashMap<String, Offset>,
	volume_size: Size,
) -> Result<()> {
	let mut content = Vec::with_capacity(ls.structure.content.len());
	let mut previous_end = Offset(0);
	for (index, c) in ls.structure.content.iter().enumerate() {
		let image = c.image.as_deref().unwrap_or("");
		if image.is_empty() {
			bail!("structure {} content #{} has no image", ls, index);
		}
		let image_path = gadget_root.join(image);
		let meta = fs::metadata(&image_path).with_context(|| {
			format!("cannot stat content image '{}'", image_path.display())
		})?;
		let image_size = Size(meta.len());
		let size = match c.size {
			Some(declared) => {
				if declared < image_size {
					bail!(
						"content image '{}' is larger ({}) than the declared size {}",
						image,
						image_size.bytes(),
						declared.bytes()
					);
				}
				declared
			}
			None => image_size,
		};
		if size.bytes() == 0 {
			bail!("content image '{}' has zero size", image);
		}
		let relative_start = c.offset.unwrap_or(previous_end);
		previous_end = relative_start.checked_add(size)?;
		let start_offset = ls.start_offset.checked_add(Size(relative_start.bytes()))?;
		let positioned_offset_write =
			position_offset_write(c.offset_write.as_ref(), starts, volume_size)
				.with_context(|| {
					format!("cannot position offset-write of content #{} in {}", index, ls)
				})?;
		content.push(LaidOutContent {
			content: c.clone(),
			index,
			start_offset,
			size,
			positioned_offset_write,
		});
	}
	content.sort_by_key(|lc| lc.start_offset);
	for pair in content.windows(2) {
		if pair[1].start_offset < pair[0].end() {
			bail!(
				"cannot lay out structure {}: content image '{}' overlaps with '{}'",
				ls,
				pair[1].content.image.as_deref().unwrap_or(""),
				pair[0].content.image.as_deref().unwrap_or("")
			);
		}
	}
	let structure_end = ls.end();
	for lc in &content {
		if lc.start_offset < ls.start_offset || lc.end() > structure_end {
			bail!(
				"cannot lay out structure {}: content image '{}' does not fit the structure",
				ls,
				lc.content.image.as_deref().unwrap_or("")
			);
		}
	}
	ls.content = content;
	Ok(())
}

/// Resolve the filesystem content of a structure against the gadget
/// directory and, for `$kernel:` references, the staged kernel content.
pub fn resolve_structure_content(
	ls: &mut LaidOutStructure,
	gadget_root: &Path,
	kernel_root: Option<&Path>,
	kernel_info: Option<&KernelInfo>,
) -> Result<()> {
	let mut resolved = Vec::with_capacity(ls.structure.content.len());
	for c in &ls.structure.content {
		let source = c.source.as_deref().unwrap_or("");
		let (resolved_source, kernel_update) = match parse_kernel_ref(source)? {
			Some(kref) => {
				let (root, info) = match (kernel_root, kernel_info) {
					(Some(root), Some(info)) => (root, info),
					_ => bail!(
						"cannot resolve content of structure {}: no kernel content to resolve {:?}",
						ls,
						source
					),
				};
				info.resolve_ref(root, &kref).with_context(|| {
					format!("cannot resolve content of structure {}", ls)
				})?
			}
			None => (gadget_root.join(source), false),
		};
		resolved.push(ResolvedContent {
			content: c.clone(),
			resolved_source,
			kernel_update,
		});
	}
	ls.resolved_content = resolved;
	Ok(())
}
