//! Atomic, resumable updates of gadget assets.
//!
//! Given the old and the new gadget, the orchestrator decides which
//! structures may be updated under the chosen policy, prepares a backup
//! set sufficient to roll everything back, and applies the update through
//! the per-structure updaters. A failure before any write leaves the
//! system untouched; a failure mid-write rolls back every structure whose
//! update was attempted.

use std::{
	collections::{BTreeSet, HashMap},
	fmt,
	path::{Path, PathBuf},
};

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info, warn};

use crate::{
	compat::{
		disk_traits_from_device_and_validate, load_disk_volumes_device_traits,
		save_disk_volumes_device_traits, DiskVolumeDeviceTraits, VolumeCompatOptions,
	},
	gadget::{GadgetSpec, StructureRole, VolumeSchema},
	kernel::{parse_kernel_ref, KernelInfo},
	layout::{
		layout_volume, layout_volume_partially, resolve_structure_content, LaidOutStructure,
		LaidOutVolume, LayoutConstraints, ResolvedContent,
	},
	lookup::{
		find_device_for_structure, find_parent_disk, load_mountinfo, LookupEnv, LookupError,
	},
	mountedfs::MountedFilesystemUpdater,
	ondisk,
	quantity::Offset,
	raw::RawStructureUpdater,
	runner::Runner,
};

/// Sentinel: nothing needed updating. Not a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoUpdateError;

impl fmt::Display for NoUpdateError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("no update needed")
	}
}

impl std::error::Error for NoUpdateError {}

pub fn is_no_update(err: &anyhow::Error) -> bool {
	err.downcast_ref::<NoUpdateError>().is_some()
}

/// Sentinel: the gadget volumes could not be mapped to disks and the
/// update was skipped; the surrounding refresh proceeds. Not a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateSkippedError;

impl fmt::Display for UpdateSkippedError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("gadget asset update skipped")
	}
}

impl std::error::Error for UpdateSkippedError {}

pub fn is_update_skipped(err: &anyhow::Error) -> bool {
	err.downcast_ref::<UpdateSkippedError>().is_some()
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ContentOperation {
	Write,
	Update,
	Rollback,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ContentChangeAction {
	Apply,
	Ignore,
	Abort,
}

/// The before/after state of one observed content change. `before` points
/// at the backup copy of the previous content, when one exists.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ContentChange {
	pub before: Option<PathBuf>,
	pub after: PathBuf,
}

/// Caller-supplied veto point for content changes, with commit-phase and
/// cancellation notifications.
pub trait ContentObserver {
	/// Called before a destination file is modified (or, on rollback,
	/// restored). Rollback changes cannot be ignored or aborted.
	fn observe(
		&self,
		op: ContentOperation,
		structure: &LaidOutStructure,
		target_root: &Path,
		relative_target: &Path,
		change: &ContentChange,
	) -> Result<ContentChangeAction>;

	/// Called once after all backups succeeded, right before the first
	/// write. An error aborts the update.
	fn before_write(&self) -> Result<()> {
		Ok(())
	}

	/// Called when the update is abandoned, whether before or after
	/// writes began.
	fn canceled(&self) -> Result<()> {
		Ok(())
	}
}

/// The per-structure update lifecycle. Backup must be complete before any
/// update runs; rollback undoes whatever update did.
pub trait Updater {
	fn backup(&self) -> Result<()>;
	fn update(&self) -> Result<()>;
	fn rollback(&self) -> Result<()>;
	fn name(&self) -> String;
}

/// Root of the backup set of one structure.
pub fn structure_backup_root(rollback_dir: &Path, yaml_index: usize) -> PathBuf {
	rollback_dir.join(format!("struct-{}", yaml_index))
}

/// Stamp base of one raw content entry of a structure.
pub fn raw_content_backup_base(
	rollback_dir: &Path,
	yaml_index: usize,
	content_index: usize,
) -> PathBuf {
	rollback_dir.join(format!("struct-{}-{}", yaml_index, content_index))
}

/// Picks the structures an update is allowed to touch.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum UpdatePolicy {
	/// Update structures whose edition was bumped.
	#[default]
	Edition,
	/// Update everything except the legacy MBR structure; used when the
	/// device moves to a different model.
	Remodel,
	/// Update only structures consuming kernel assets, and only their
	/// kernel-sourced content; used on kernel refreshes.
	Kernel,
}

fn consumes_kernel_content(ls: &LaidOutStructure) -> bool {
	ls.structure
		.content
		.iter()
		.any(|c| c.source.as_deref().is_some_and(|s| s.starts_with("$kernel:")))
}

impl UpdatePolicy {
	pub fn should_update(&self, old: &LaidOutStructure, new: &LaidOutStructure) -> bool {
		match self {
			UpdatePolicy::Edition => {
				new.structure.update.edition > old.structure.update.edition
			}
			UpdatePolicy::Remodel => !new.structure.is_mbr(),
			UpdatePolicy::Kernel => consumes_kernel_content(new),
		}
	}

	/// The filter applied to the resolved content of selected structures.
	pub fn content_filter(&self) -> Option<fn(&ResolvedContent) -> bool> {
		match self {
			UpdatePolicy::Kernel => Some(|rc| rc.kernel_update),
			_ => None,
		}
	}
}

fn fmt_opt<T: fmt::Display>(v: &Option<T>) -> String {
	match v {
		Some(v) => v.to_string(),
		None => "unspecified".to_owned(),
	}
}

/// Volumes must keep their identity between gadget revisions.
pub fn can_update_volume(old: &LaidOutVolume, new: &LaidOutVolume) -> Result<()> {
	if old.volume.schema != new.volume.schema {
		bail!(
			"cannot change volume schema from {} to {}",
			old.volume.schema,
			new.volume.schema
		);
	}
	if old.volume.id != new.volume.id {
		bail!(
			"cannot change volume ID from {} to {}",
			fmt_opt(&old.volume.id),
			fmt_opt(&new.volume.id)
		);
	}
	if old.structures.len() != new.structures.len() {
		bail!(
			"cannot change the number of structures within volume from {} to {}",
			old.structures.len(),
			new.structures.len()
		);
	}
	Ok(())
}

/// Structures must keep their shape between gadget revisions; only their
/// content may change.
pub fn can_update_structure(
	old: &LaidOutStructure,
	new: &LaidOutStructure,
	schema: VolumeSchema,
) -> Result<()> {
	if schema == VolumeSchema::GPT && old.structure.name != new.structure.name {
		bail!(
			"cannot change structure name from {:?} to {:?}",
			old.name(),
			new.name()
		);
	}
	if old.structure.size != new.structure.size {
		bail!(
			"cannot change structure size from {} to {}",
			old.structure.size.bytes(),
			new.structure.size.bytes()
		);
	}
	if old.structure.offset != new.structure.offset {
		bail!(
			"cannot change structure offset from {} to {}",
			fmt_opt(&old.structure.offset.map(|o| o.bytes())),
			fmt_opt(&new.structure.offset.map(|o| o.bytes()))
		);
	}
	if old.start_offset != new.start_offset {
		bail!(
			"cannot change structure start offset from {} to {}",
			old.start_offset.bytes(),
			new.start_offset.bytes()
		);
	}
	if old.structure.offset_write != new.structure.offset_write {
		bail!(
			"cannot change structure offset-write from {} to {}",
			fmt_opt(&old.structure.offset_write),
			fmt_opt(&new.structure.offset_write)
		);
	}
	if old.structure.role != new.structure.role {
		bail!(
			"cannot change structure role from {} to {}",
			fmt_opt(&old.structure.role),
			fmt_opt(&new.structure.role)
		);
	}
	if old.structure.id != new.structure.id {
		bail!(
			"cannot change structure ID from {} to {}",
			fmt_opt(&old.structure.id),
			fmt_opt(&new.structure.id)
		);
	}
	if old.structure.part_type != new.structure.part_type {
		// The one permitted transition: a legacy `type: mbr` structure
		// becoming a role-carrying one.
		let legacy_mbr = old.structure.part_type.eq_ignore_ascii_case("mbr")
			&& new.structure.role == Some(StructureRole::Mbr);
		if !legacy_mbr {
			bail!(
				"cannot change structure type from {:?} to {:?}",
				old.structure.part_type,
				new.structure.part_type
			);
		}
	}
	if old.structure.has_filesystem() != new.structure.has_filesystem() {
		bail!(
			"cannot change a filesystem structure to a bare one or vice versa"
		);
	}
	if old.structure.filesystem != new.structure.filesystem {
		bail!(
			"cannot change filesystem from {} to {}",
			old.structure.filesystem,
			new.structure.filesystem
		);
	}
	if old.structure.label != new.structure.label {
		bail!(
			"cannot change filesystem label from {:?} to {:?}",
			old.structure.label.as_deref().unwrap_or(""),
			new.structure.label.as_deref().unwrap_or("")
		);
	}
	Ok(())
}

/// Where a structure lives on the running system.
#[derive(Clone, Debug, PartialEq)]
pub enum StructureLocation {
	/// A device node plus the offset of the structure on it.
	Raw { device: PathBuf, offset: Offset },
	/// The writable mount point of the structure's filesystem.
	Filesystem { mount_point: PathBuf },
	/// Known to exist but not reachable right now (e.g. an encrypted
	/// filesystem without a mounted cleartext device). Touching it fails
	/// with the given reason.
	Unresolved { reason: String },
}

/// Resolves structures to their on-system locations. Injectable for
/// tests; production uses [`TraitsLocator`].
pub trait StructureLocator {
	fn locate(&self, volume: &str, ls: &LaidOutStructure) -> Result<StructureLocation>;
}

/// Locates structures through the persisted disk traits.
pub struct TraitsLocator<'a> {
	mapping: HashMap<String, DiskVolumeDeviceTraits>,
	env: &'a LookupEnv,
}

impl StructureLocator for TraitsLocator<'_> {
	fn locate(&self, volume: &str, ls: &LaidOutStructure) -> Result<StructureLocation> {
		let traits = self.mapping.get(volume).with_context(|| {
			format!("cannot find disk mapping of volume '{}'", volume)
		})?;
		if !ls.structure.is_partition() {
			// Bare regions and the MBR live on the disk itself.
			return Ok(StructureLocation::Raw {
				device: traits.original_kernel_path.clone(),
				offset: ls.start_offset,
			});
		}
		let record = traits
			.structure
			.iter()
			.find(|r| r.offset == ls.start_offset)
			.with_context(|| {
				format!("cannot find disk mapping of structure {}", ls)
			})?;
		if !ls.structure.has_filesystem() {
			return Ok(StructureLocation::Raw {
				device: record.original_kernel_path.clone(),
				offset: Offset(0),
			});
		}
		let device = record.original_kernel_path.to_string_lossy().into_owned();
		let fs_type = ls.structure.filesystem.to_string();
		for entry in load_mountinfo(&self.env.mountinfo_path)? {
			if entry.mount_source == device && entry.root == "/" && entry.fs_type == fs_type
			{
				return Ok(StructureLocation::Filesystem {
					mount_point: entry.mount_dir,
				});
			}
		}
		if record.filesystem_type == "crypto_LUKS" {
			return Ok(StructureLocation::Unresolved {
				reason: format!(
					"no mounted cleartext device for encrypted structure {}",
					ls
				),
			});
		}
		Err(anyhow::Error::new(LookupError::MountNotFound).context(format!(
			"cannot find where device '{}' ({}) is mounted",
			device, fs_type
		)))
	}
}

/// One side of an update: the gadget, its staged content, and optionally
/// the staged kernel it references.
#[derive(Clone, Debug)]
pub struct GadgetData {
	pub gadget: GadgetSpec,
	pub root_dir: PathBuf,
	pub kernel_root: Option<PathBuf>,
	pub kernel_info: Option<KernelInfo>,
}

pub struct UpdateOptions<'a> {
	pub policy: UpdatePolicy,
	pub observer: Option<&'a dyn ContentObserver>,
	/// Resolve structure locations through this instead of the persisted
	/// traits; tests use it to point at scratch directories.
	pub locator: Option<&'a dyn StructureLocator>,
	/// Where the persisted disk mapping lives.
	pub state_dir: PathBuf,
	pub lookup_env: LookupEnv,
	pub runner: &'a dyn Runner,
	/// When the volumes cannot be mapped to disks, skip the update (with
	/// [`UpdateSkippedError`]) instead of failing. Set on systems
	/// installed before disk mappings were recorded.
	pub tolerate_unresolved_devices: bool,
}

fn notify_canceled(observer: Option<&dyn ContentObserver>) {
	if let Some(observer) = observer {
		if let Err(e) = observer.canceled() {
			warn!("Observer cancellation notification failed: {}", e);
		}
	}
}

/// Build or load the disk traits for every volume that has structures
/// selected for update. A volume with no persisted traits can only be
/// reconstructed when it carries the system-boot structure, by following
/// its partition symlinks.
fn build_traits_locator<'o>(
	volumes: &[(String, LaidOutVolume)],
	needed: &BTreeSet<usize>,
	opts: &'o UpdateOptions<'_>,
) -> Result<TraitsLocator<'o>> {
	let mut mapping = load_disk_volumes_device_traits(&opts.state_dir)?;
	let mut added = false;
	for idx in needed {
		let (name, lv) = &volumes[*idx];
		if mapping.contains_key(name) {
			continue;
		}
		let has_boot = lv
			.structures
			.iter()
			.any(|ls| ls.structure.role == Some(StructureRole::SystemBoot));
		if !has_boot {
			bail!(
				"cannot find disk mapping of volume '{}' and it cannot be reconstructed",
				name
			);
		}
		debug!("Reconstructing disk mapping of volume '{}'", name);
		let mut partition = None;
		for ls in &lv.structures {
			if !ls.structure.is_partition() {
				continue;
			}
			match find_device_for_structure(&opts.lookup_env, &ls.structure) {
				Ok(node) => {
					partition = Some(node);
					break;
				}
				Err(e) => debug!("No device for structure {}: {:#}", ls, e),
			}
		}
		let partition = partition.ok_or_else(|| {
			anyhow::Error::new(LookupError::DeviceNotFound).context(format!(
				"cannot find any device of volume '{}'",
				name
			))
		})?;
		let disk = find_parent_disk(&opts.lookup_env, &partition)?;
		let on_disk = ondisk::volume_from_device(opts.runner, &disk)?;
		let compat = VolumeCompatOptions {
			assume_creatable_partitions_created: true,
			allow_implicit_system_data: true,
			..Default::default()
		};
		let traits = disk_traits_from_device_and_validate(lv, &on_disk, &compat)
			.with_context(|| {
				format!(
					"volume '{}' is not compatible with disk {}",
					name,
					disk.display()
				)
			})?;
		mapping.insert(name.clone(), traits);
		added = true;
	}
	if added {
		save_disk_volumes_device_traits(&opts.state_dir, &mapping)?;
	}
	Ok(TraitsLocator {
		mapping,
		env: &opts.lookup_env,
	})
}

fn build_updaters<'a>(
	volumes: &'a [(String, LaidOutVolume)],
	selected: &[(usize, usize)],
	new_root: &Path,
	rollback_dir: &Path,
	locator: &dyn StructureLocator,
	observer: Option<&'a dyn ContentObserver>,
) -> Result<Vec<Box<dyn Updater + 'a>>> {
	let mut updaters: Vec<Box<dyn Updater + 'a>> = Vec::with_capacity(selected.len());
	for (vol_idx, pos) in selected {
		let (name, lv) = &volumes[*vol_idx];
		let ls = &lv.structures[*pos];
		let location = locator.locate(name, ls)?;
		if ls.structure.has_filesystem() {
			let mount = match location {
				StructureLocation::Filesystem { mount_point } => Ok(mount_point),
				StructureLocation::Unresolved { reason } => Err(reason),
				StructureLocation::Raw { .. } => {
					return Err(anyhow!(
						"internal error: filesystem structure {} located as a raw device",
						ls
					))
				}
			};
			updaters.push(Box::new(MountedFilesystemUpdater::new(
				ls,
				rollback_dir,
				mount,
				observer,
			)?));
		} else {
			let (device, offset) = match location {
				StructureLocation::Raw { device, offset } => (device, offset),
				StructureLocation::Unresolved { reason } => bail!(
					"cannot update raw structure {}: {}",
					ls,
					reason
				),
				StructureLocation::Filesystem { .. } => {
					return Err(anyhow!(
						"internal error: raw structure {} located as a filesystem",
						ls
					))
				}
			};
			updaters.push(Box::new(RawStructureUpdater::new(
				ls,
				new_root,
				rollback_dir,
				device,
				offset,
			)?));
		}
	}
	Ok(updaters)
}

/// Apply an asset update from `old` to `new`.
///
/// Returns [`NoUpdateError`] when every selected structure was already up
/// to date, and [`UpdateSkippedError`] when device resolution failed and
/// `tolerate_unresolved_devices` is set; callers treat both as successful
/// no-ops. On a mid-update failure every updater whose update was
/// attempted is rolled back, in forward order (updaters are idempotent
/// against their stamp sets, which makes forward order safe), across all
/// volumes.
pub fn update(
	old: &GadgetData,
	new: &GadgetData,
	rollback_dir: &Path,
	opts: &UpdateOptions,
) -> Result<()> {
	// The volume sets must match exactly; a gadget revision cannot add or
	// remove volumes.
	let old_names: BTreeSet<&String> = old.gadget.volumes.keys().collect();
	let new_names: BTreeSet<&String> = new.gadget.volumes.keys().collect();
	if new_names.difference(&old_names).next().is_some() {
		bail!("cannot update gadget assets: volumes were added");
	}
	if old_names.difference(&new_names).next().is_some() {
		bail!("cannot update gadget assets: volumes were removed");
	}

	let constraints = LayoutConstraints::default();
	let deferred = LayoutConstraints {
		skip_resolve_content: true,
		..constraints.clone()
	};

	let mut volumes: Vec<(String, LaidOutVolume)> = Vec::new();
	let mut selected: Vec<(usize, usize)> = Vec::new();
	for (name, new_vol) in &new.gadget.volumes {
		let old_vol = old.gadget.volume(name)?;
		let old_laid = layout_volume_partially(old_vol, &constraints)
			.with_context(|| format!("cannot lay out the old volume '{}'", name))?;
		let mut new_laid = layout_volume(
			new_vol,
			&new.root_dir,
			new.kernel_root.as_deref(),
			new.kernel_info.as_ref(),
			&deferred,
		)
		.with_context(|| format!("cannot lay out the new volume '{}'", name))?;
		can_update_volume(&old_laid, &new_laid)
			.with_context(|| format!("cannot update volume '{}'", name))?;

		let old_by_index: HashMap<usize, &LaidOutStructure> = old_laid
			.structures
			.iter()
			.map(|ls| (ls.yaml_index, ls))
			.collect();
		let mut selected_here: Vec<usize> = Vec::new();
		for (pos, new_ls) in new_laid.structures.iter().enumerate() {
			let old_ls = old_by_index.get(&new_ls.yaml_index).ok_or_else(|| {
				anyhow!(
					"internal error: no old structure pairs with {}",
					new_ls
				)
			})?;
			if !opts.policy.should_update(old_ls, new_ls) {
				continue;
			}
			can_update_structure(old_ls, new_ls, new_laid.volume.schema).with_context(
				|| format!("cannot update structure {} of volume '{}'", new_ls, name),
			)?;
			selected_here.push(pos);
		}
		for pos in selected_here {
			let ls = &mut new_laid.structures[pos];
			if ls.structure.has_filesystem() {
				resolve_structure_content(
					ls,
					&new.root_dir,
					new.kernel_root.as_deref(),
					new.kernel_info.as_ref(),
				)?;
				if let Some(filter) = opts.policy.content_filter() {
					ls.resolved_content.retain(filter);
				}
			}
			selected.push((volumes.len(), pos));
		}
		volumes.push((name.clone(), new_laid));
	}

	if selected.is_empty() {
		return Err(anyhow::Error::new(NoUpdateError));
	}

	// A kernel refresh that ships updatable assets must actually deliver
	// them through some selected structure.
	if let Some(info) = &new.kernel_info {
		let updatable = info.update_asset_names();
		if !updatable.is_empty() {
			let consumed = selected.iter().any(|(vol_idx, pos)| {
				volumes[*vol_idx].1.structures[*pos]
					.structure
					.content
					.iter()
					.filter_map(|c| {
						c.source
							.as_deref()
							.and_then(|s| parse_kernel_ref(s).ok().flatten())
					})
					.any(|kref| updatable.contains(&kref.asset.as_str()))
			});
			if !consumed {
				bail!(
					"cannot update gadget assets: updatable kernel assets are not consumed by any updated structure: {}",
					updatable.join(", ")
				);
			}
		}
	}

	// Map every selected structure to its on-system location. On systems
	// without a persisted disk mapping this can legitimately fail; those
	// skip the gadget asset update instead of blocking the refresh.
	let needed: BTreeSet<usize> = selected.iter().map(|(vol_idx, _)| *vol_idx).collect();
	let built_locator;
	let locator: &dyn StructureLocator = match opts.locator {
		Some(locator) => locator,
		None => match build_traits_locator(&volumes, &needed, opts) {
			Ok(locator) => {
				built_locator = locator;
				&built_locator
			}
			Err(e) if opts.tolerate_unresolved_devices => {
				warn!("Cannot map gadget volumes to disks, skipping the asset update: {:#}", e);
				return Err(anyhow::Error::new(UpdateSkippedError));
			}
			Err(e) => return Err(e),
		},
	};
	let updaters = match build_updaters(
		&volumes,
		&selected,
		&new.root_dir,
		rollback_dir,
		locator,
		opts.observer,
	) {
		Ok(updaters) => updaters,
		Err(e) if opts.tolerate_unresolved_devices => {
			warn!("Cannot resolve structure locations, skipping the asset update: {:#}", e);
			return Err(anyhow::Error::new(UpdateSkippedError));
		}
		Err(e) => return Err(e),
	};

	// Backup phase: nothing is modified yet, any failure simply abandons
	// the update.
	for updater in &updaters {
		if let Err(e) = updater.backup() {
			notify_canceled(opts.observer);
			return Err(e).with_context(|| format!("cannot backup {}", updater.name()));
		}
	}

	if let Some(observer) = opts.observer {
		if let Err(e) = observer.before_write() {
			notify_canceled(opts.observer);
			return Err(e).context("update observer failed before write");
		}
	}

	let mut skipped = 0usize;
	for (idx, updater) in updaters.iter().enumerate() {
		match updater.update() {
			Ok(()) => info!("Updated {}", updater.name()),
			Err(e) if is_no_update(&e) => {
				debug!("No update needed for {}", updater.name());
				skipped += 1;
			}
			Err(e) => {
				// Roll back everything attempted, including the failed
				// one; rollback failures are logged but must not mask
				// the original cause.
				for rolled in &updaters[..=idx] {
					if let Err(re) = rolled.rollback() {
						log::error!(
							"Cannot roll back {}: {:#}",
							rolled.name(),
							re
						);
					}
				}
				notify_canceled(opts.observer);
				return Err(e)
					.with_context(|| format!("cannot update {}", updater.name()));
			}
		}
	}
	if skipped == updaters.len() {
		return Err(anyhow::Error::new(NoUpdateError));
	}
	Ok(())
}
