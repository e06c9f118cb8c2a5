//! The gadget specification: volumes, structures and their content.
//!
//! A gadget describes one or more disk volumes in a `gadget.toml` file:
//!
//! ```toml
//! [volumes.pc]
//! schema = "gpt"
//! bootloader = "grub"
//!
//! [[volumes.pc.structure]]
//! name = "mbr"
//! role = "mbr"
//! type = "mbr"
//! size = 440
//!
//! [[volumes.pc.structure]]
//! name = "EFI System"
//! role = "system-boot"
//! type = "EF,C12A7328-F81F-11D2-BA4B-00A0C93EC93B"
//! filesystem = "vfat"
//! label = "system-boot"
//! size = 52428800
//!
//! [[volumes.pc.structure.content]]
//! source = "grubx64.efi"
//! target = "EFI/boot/grubx64.efi"
//! ```
//!
//! Structure declaration order is significant: it defines the index used
//! for backup directories and for pairing old and new structures during an
//! update. The laid-out order (by start offset) is computed separately.

use std::{
	collections::{BTreeMap, HashSet},
	fmt, fs,
	path::Path,
	str::FromStr,
};

use anyhow::{bail, Context, Result};
use serde::{de, Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::quantity::{Offset, Size, SECTOR_SIZE};

/// The conventional name of the gadget manifest within a gadget directory.
pub const GADGET_MANIFEST: &str = "gadget.toml";

/// An MBR boot record structure may cover at most the bootstrap code area;
/// the partition entries and signature behind it belong to the partition
/// table writer.
pub const MBR_BOOTSTRAP_SIZE: u64 = 446;

/// Filesystem label reserved for the implicit writable data partition.
pub const IMPLICIT_DATA_LABEL: &str = "writable";

#[derive(Copy, Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default, strum::Display)]
#[serde(rename_all = "lowercase")]
#[allow(clippy::upper_case_acronyms)]
pub enum VolumeSchema {
	#[serde(alias = "dos")]
	MBR,
	#[default]
	GPT,
}

#[derive(Copy, Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, strum::Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum StructureRole {
	/// Master boot record bootstrap code, not a partition.
	Mbr,
	SystemBoot,
	SystemSeed,
	SystemData,
	SystemSave,
}

/// Filesystem to be created on (and expected of) a structure.
#[derive(Copy, Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FilesystemType {
	Ext4,
	Vfat,
	#[default]
	None,
}

/// A location expressed either as an absolute byte offset or relative to
/// the start of a named structure, e.g. `1024` or `"u-boot+24"`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelativeOffset {
	pub relative_to: Option<String>,
	pub offset: Offset,
}

impl FromStr for RelativeOffset {
	type Err = anyhow::Error;

	fn from_str(s: &str) -> Result<Self> {
		if let Some((name, off)) = s.split_once('+') {
			if name.is_empty() {
				bail!("relative offset {:?} names no structure", s);
			}
			let offset: u64 = off
				.parse()
				.with_context(|| format!("invalid relative offset {:?}", s))?;
			return Ok(RelativeOffset {
				relative_to: Some(name.to_owned()),
				offset: Offset(offset),
			});
		}
		let offset: u64 = s
			.parse()
			.with_context(|| format!("invalid offset {:?}", s))?;
		Ok(RelativeOffset {
			relative_to: None,
			offset: Offset(offset),
		})
	}
}

impl fmt::Display for RelativeOffset {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match &self.relative_to {
			Some(name) => write!(f, "{}+{}", name, self.offset.bytes()),
			None => write!(f, "{}", self.offset.bytes()),
		}
	}
}

impl<'de> Deserialize<'de> for RelativeOffset {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		struct V;
		impl de::Visitor<'_> for V {
			type Value = RelativeOffset;

			fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				f.write_str("a byte offset or a \"structure+offset\" string")
			}

			fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
				if v < 0 {
					return Err(E::custom("offset must not be negative"));
				}
				Ok(RelativeOffset {
					relative_to: None,
					offset: Offset(v as u64),
				})
			}

			fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
				Ok(RelativeOffset {
					relative_to: None,
					offset: Offset(v),
				})
			}

			fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
				RelativeOffset::from_str(v).map_err(E::custom)
			}
		}
		deserializer.deserialize_any(V)
	}
}

/// One content entry of a structure.
///
/// Filesystem structures use `source`/`target` (paths within the gadget
/// directory and the target filesystem); bare structures use `image` with
/// an optional `offset` and `size`.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct VolumeContent {
	pub source: Option<String>,
	pub target: Option<String>,
	/// Unpack the source archive instead of copying it verbatim.
	#[serde(default)]
	pub unpack: bool,
	pub image: Option<String>,
	pub offset: Option<Offset>,
	pub offset_write: Option<RelativeOffset>,
	pub size: Option<Size>,
}

impl fmt::Display for VolumeContent {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if let Some(image) = &self.image {
			write!(f, "image {:?}", image)
		} else {
			write!(
				f,
				"source {:?}, target {:?}",
				self.source.as_deref().unwrap_or(""),
				self.target.as_deref().unwrap_or("")
			)
		}
	}
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct VolumeUpdate {
	#[serde(default)]
	pub edition: u32,
	#[serde(default)]
	pub preserve: Vec<String>,
}

/// One partition or bare region within a volume.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct VolumeStructure {
	/// Partition name. Required and unique on GPT, ignored on MBR.
	pub name: Option<String>,
	pub role: Option<StructureRole>,
	/// Partition type: two hex digits (MBR), a GUID (GPT), a
	/// `"hexdigits,GUID"` hybrid, or the literals `mbr` and `bare`.
	#[serde(rename = "type")]
	pub part_type: String,
	/// GPT partition UUID, when pinned by the gadget.
	pub id: Option<String>,
	pub size: Size,
	pub offset: Option<Offset>,
	/// Location to write this structure's start LBA to.
	pub offset_write: Option<RelativeOffset>,
	pub label: Option<String>,
	#[serde(default)]
	pub filesystem: FilesystemType,
	#[serde(default)]
	pub content: Vec<VolumeContent>,
	#[serde(default)]
	pub update: VolumeUpdate,
}

impl VolumeStructure {
	pub fn is_mbr(&self) -> bool {
		self.role == Some(StructureRole::Mbr) || self.part_type.eq_ignore_ascii_case("mbr")
	}

	pub fn is_bare(&self) -> bool {
		self.part_type.eq_ignore_ascii_case("bare")
	}

	/// Whether this structure occupies a slot in the partition table.
	pub fn is_partition(&self) -> bool {
		!self.is_bare() && !self.is_mbr()
	}

	pub fn has_filesystem(&self) -> bool {
		self.filesystem != FilesystemType::None && !self.is_bare() && !self.is_mbr()
	}

	/// Structures the installer creates on first boot rather than the image
	/// build; these may legitimately be missing from a disk.
	pub fn is_creatable_at_install(&self) -> bool {
		matches!(
			self.role,
			Some(StructureRole::SystemBoot)
				| Some(StructureRole::SystemSave)
				| Some(StructureRole::SystemData)
		)
	}

	/// The MBR type byte of a plain or hybrid type, as two hex digits.
	pub fn mbr_type(&self) -> Option<&str> {
		let t = match self.part_type.split_once(',') {
			Some((mbr, _)) => mbr,
			None => &self.part_type,
		};
		if t.len() == 2 && t.bytes().all(|b| b.is_ascii_hexdigit()) {
			Some(t)
		} else {
			None
		}
	}

	/// The GPT type GUID of a plain or hybrid type.
	pub fn gpt_type(&self) -> Option<&str> {
		let t = match self.part_type.split_once(',') {
			Some((_, gpt)) => gpt,
			None => &self.part_type,
		};
		if Uuid::parse_str(t).is_ok() {
			Some(t)
		} else {
			None
		}
	}

	/// The filesystem label, defaulting to the structure name the way the
	/// filesystem creation step does.
	pub fn effective_filesystem_label(&self) -> Option<&str> {
		self.label.as_deref().or(self.name.as_deref())
	}

	fn check_type(&self, schema: VolumeSchema) -> Result<()> {
		let t = self.part_type.as_str();
		if t.is_empty() {
			bail!("structure type is required");
		}
		if t.eq_ignore_ascii_case("mbr") || t.eq_ignore_ascii_case("bare") {
			return Ok(());
		}
		if let Some((mbr, gpt)) = t.split_once(',') {
			if !(mbr.len() == 2 && mbr.bytes().all(|b| b.is_ascii_hexdigit())) {
				bail!("invalid MBR part of hybrid type '{}'", t);
			}
			if Uuid::parse_str(gpt).is_err() {
				bail!("invalid GPT part of hybrid type '{}'", t);
			}
			return Ok(());
		}
		match schema {
			VolumeSchema::MBR => {
				if !(t.len() == 2 && t.bytes().all(|b| b.is_ascii_hexdigit())) {
					bail!("invalid type '{}' for an mbr schema volume", t);
				}
			}
			VolumeSchema::GPT => {
				if t.len() != 36 || Uuid::parse_str(t).is_err() {
					bail!("invalid type '{}' for a gpt schema volume", t);
				}
			}
		}
		Ok(())
	}

	fn check(&self, schema: VolumeSchema, sector_size: u64) -> Result<()> {
		self.check_type(schema)?;
		if self.size.bytes() == 0 {
			bail!("structure size must be larger than zero");
		}
		if self.is_mbr() {
			if let Some(offset) = self.offset {
				if offset.bytes() != 0 {
					bail!("mbr structure must start at offset 0");
				}
			}
			if self.size.bytes() > MBR_BOOTSTRAP_SIZE {
				bail!(
					"mbr structure is limited to {} bytes, got {}",
					MBR_BOOTSTRAP_SIZE,
					self.size.bytes()
				);
			}
			if self.filesystem != FilesystemType::None {
				bail!("mbr structure must not have a filesystem");
			}
		} else if !self.size.is_multiple_of(sector_size) {
			bail!(
				"structure size {} is not a multiple of the sector size {}",
				self.size.bytes(),
				sector_size
			);
		}
		if self.is_bare() && self.filesystem != FilesystemType::None {
			bail!("bare structure must not have a filesystem");
		}
		if let Some(id) = &self.id {
			Uuid::parse_str(id).with_context(|| format!("invalid structure id '{}'", id))?;
		}
		match (self.role, self.label.as_deref()) {
			(Some(StructureRole::SystemData), Some(l)) if l != IMPLICIT_DATA_LABEL => {
				bail!(
					"system-data structure must have the label \"{}\", got \"{}\"",
					IMPLICIT_DATA_LABEL,
					l
				);
			}
			(role, Some(IMPLICIT_DATA_LABEL)) if role != Some(StructureRole::SystemData) => {
				bail!(
					"label \"{}\" is reserved for the system-data role",
					IMPLICIT_DATA_LABEL
				);
			}
			_ => {}
		}
		self.check_content()?;
		for entry in &self.update.preserve {
			let p = Path::new(entry);
			if p.is_absolute() {
				bail!("preserve entry {:?} must be a relative path", entry);
			}
			if p.components()
				.any(|c| matches!(c, std::path::Component::ParentDir))
			{
				bail!("preserve entry {:?} must not traverse upwards", entry);
			}
		}
		Ok(())
	}

	fn check_content(&self) -> Result<()> {
		let wants_filesystem_content = self.has_filesystem();
		for content in &self.content {
			if wants_filesystem_content {
				if content.image.is_some()
					|| content.offset.is_some()
					|| content.size.is_some()
				{
					bail!(
						"content {} cannot use image properties on a filesystem structure",
						content
					);
				}
				if content.source.as_deref().unwrap_or("").is_empty()
					|| content.target.as_deref().unwrap_or("").is_empty()
				{
					bail!("content {} requires both source and target", content);
				}
			} else {
				if content.source.is_some() || content.target.is_some() {
					bail!(
						"content {} cannot use source/target on a bare structure",
						content
					);
				}
				if content.image.as_deref().unwrap_or("").is_empty() {
					bail!("content of a bare structure requires an image");
				}
			}
		}
		Ok(())
	}
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Volume {
	/// Volume name, filled in from the manifest key.
	#[serde(skip)]
	pub name: String,
	#[serde(default)]
	pub schema: VolumeSchema,
	pub bootloader: Option<String>,
	/// Disk identifier: a GPT disk GUID or a 4-byte MBR id as `0x` hex.
	pub id: Option<String>,
	#[serde(alias = "structures")]
	pub structure: Vec<VolumeStructure>,
}

impl Volume {
	pub fn check(&self, sector_size: u64) -> Result<()> {
		if self.structure.is_empty() {
			bail!("volume '{}' has no structures", self.name);
		}
		if let Some(id) = &self.id {
			check_disk_id(id, self.schema)
				.with_context(|| format!("invalid id of volume '{}'", self.name))?;
		}
		let mut names = HashSet::new();
		for (idx, vs) in self.structure.iter().enumerate() {
			vs.check(self.schema, sector_size).with_context(|| {
				format!(
					"invalid structure #{}{} of volume '{}'",
					idx,
					vs.name
						.as_deref()
						.map(|n| format!(" (\"{}\")", n))
						.unwrap_or_default(),
					self.name
				)
			})?;
			if self.schema == VolumeSchema::GPT && vs.is_partition() {
				let name = vs.name.as_deref().unwrap_or("");
				if name.is_empty() {
					bail!(
						"structure #{} of volume '{}' requires a name on gpt",
						idx,
						self.name
					);
				}
				if !names.insert(name.to_owned()) {
					bail!(
						"structure name \"{}\" is not unique within volume '{}'",
						name,
						self.name
					);
				}
			}
		}
		Ok(())
	}

	pub fn structure_by_name(&self, name: &str) -> Option<(usize, &VolumeStructure)> {
		self.structure
			.iter()
			.enumerate()
			.find(|(_, vs)| vs.name.as_deref() == Some(name))
	}
}

fn check_disk_id(id: &str, schema: VolumeSchema) -> Result<()> {
	match schema {
		VolumeSchema::GPT => {
			Uuid::parse_str(id).with_context(|| format!("'{}' is not a GUID", id))?;
		}
		VolumeSchema::MBR => {
			let hex = id.strip_prefix("0x").unwrap_or(id);
			if hex.len() != 8 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
				bail!("'{}' is not a 4-byte MBR disk id", id);
			}
		}
	}
	Ok(())
}

/// The parsed gadget manifest.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GadgetSpec {
	pub volumes: BTreeMap<String, Volume>,
}

impl GadgetSpec {
	pub fn from_toml(content: &str) -> Result<Self> {
		let mut spec: GadgetSpec =
			toml::from_str(content).context("unable to parse the gadget manifest")?;
		for (name, volume) in spec.volumes.iter_mut() {
			volume.name = name.clone();
		}
		spec.check()?;
		Ok(spec)
	}

	pub fn from_path(file: &Path) -> Result<Self> {
		let content = fs::read_to_string(file)
			.with_context(|| format!("unable to read '{}'", file.display()))?;
		Self::from_toml(&content)
			.with_context(|| format!("invalid gadget manifest '{}'", file.display()))
	}

	/// Load `gadget.toml` from a gadget directory.
	pub fn from_dir(root: &Path) -> Result<Self> {
		Self::from_path(&root.join(GADGET_MANIFEST))
	}

	pub fn check(&self) -> Result<()> {
		if self.volumes.is_empty() {
			bail!("gadget must define at least one volume");
		}
		// Roles are unique across the whole volume set, not just within
		// one volume.
		let mut roles: HashSet<StructureRole> = HashSet::new();
		for volume in self.volumes.values() {
			volume.check(SECTOR_SIZE)?;
			for vs in &volume.structure {
				if let Some(role) = vs.role {
					if !roles.insert(role) {
						bail!("role {} is used by more than one structure", role);
					}
				}
			}
		}
		Ok(())
	}

	pub fn volume(&self, name: &str) -> Result<&Volume> {
		self.volumes
			.get(name)
			.with_context(|| format!("volume '{}' is not defined in the gadget", name))
	}

	/// The volume carrying the system-boot role, if any.
	pub fn boot_volume(&self) -> Option<&Volume> {
		self.volumes.values().find(|v| {
			v.structure
				.iter()
				.any(|vs| vs.role == Some(StructureRole::SystemBoot))
		})
	}
}
