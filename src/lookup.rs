//! Mapping gadget structures to block devices and mount points on a
//! running system.
//!
//! Partitions are found through the `/dev/disk/by-partlabel` and
//! `/dev/disk/by-label` symlink farms; structures that cannot have such
//! symlinks (bare regions, the MBR) fall back to inferring the disk from
//! the mounted writable filesystem. The /dev, /sys and mountinfo roots are
//! injectable so the whole module is testable on scratch directories.

use std::{
	fmt, fs,
	path::{Path, PathBuf},
};

use anyhow::{anyhow, bail, Context, Result};
use log::debug;

use crate::{
	gadget::VolumeStructure,
	labels,
	layout::LaidOutStructure,
	quantity::Offset,
};

/// Error kinds surfaced to callers of the lookup functions. These travel
/// inside anyhow errors; use [`is_lookup_error`] to detect them.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LookupError {
	DeviceNotFound,
	MountNotFound,
	NoFilesystemDefined,
}

impl fmt::Display for LookupError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			LookupError::DeviceNotFound => f.write_str("device not found"),
			LookupError::MountNotFound => f.write_str("mount point not found"),
			LookupError::NoFilesystemDefined => f.write_str("no filesystem defined"),
		}
	}
}

impl std::error::Error for LookupError {}

pub fn is_lookup_error(err: &anyhow::Error, kind: LookupError) -> bool {
	err.downcast_ref::<LookupError>() == Some(&kind)
}

/// Filesystem roots consulted during lookups.
#[derive(Clone, Debug)]
pub struct LookupEnv {
	pub dev_dir: PathBuf,
	pub sys_dir: PathBuf,
	pub mountinfo_path: PathBuf,
}

impl Default for LookupEnv {
	fn default() -> Self {
		LookupEnv {
			dev_dir: PathBuf::from("/dev"),
			sys_dir: PathBuf::from("/sys"),
			mountinfo_path: PathBuf::from("/proc/self/mountinfo"),
		}
	}
}

/// One entry of `/proc/self/mountinfo`, reduced to the fields we consume.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountInfoEntry {
	pub root: String,
	pub mount_dir: PathBuf,
	pub fs_type: String,
	pub mount_source: String,
}

/// Octal escapes as written by the kernel into mountinfo (`\040` for a
/// space and so on).
fn unescape_mount_field(s: &str) -> String {
	let bytes = s.as_bytes();
	let mut out = Vec::with_capacity(bytes.len());
	let mut i = 0;
	while i < bytes.len() {
		if bytes[i] == b'\\' && i + 3 < bytes.len() {
			let oct = &s[i + 1..i + 4];
			if oct.bytes().all(|b| (b'0'..=b'7').contains(&b)) {
				if let Ok(v) = u8::from_str_radix(oct, 8) {
					out.push(v);
					i += 4;
					continue;
				}
			}
		}
		out.push(bytes[i]);
		i += 1;
	}
	String::from_utf8_lossy(&out).into_owned()
}

pub fn load_mountinfo(path: &Path) -> Result<Vec<MountInfoEntry>> {
	let content = fs::read_to_string(path)
		.with_context(|| format!("cannot read mount information from '{}'", path.display()))?;
	let mut entries = Vec::new();
	for line in content.lines() {
		if line.trim().is_empty() {
			continue;
		}
		let fields: Vec<&str> = line.split_whitespace().collect();
		// id, parent, major:minor, root, mount point, options, then
		// optional tagged fields up to a lone dash, then the filesystem
		// type and the source.
		if fields.len() < 10 {
			bail!("incomplete mountinfo entry {:?}", line);
		}
		let Some(sep) = fields.iter().position(|f| *f == "-") else {
			bail!("incomplete mountinfo entry {:?}", line);
		};
		if sep < 6 || fields.len() < sep + 3 {
			bail!("incomplete mountinfo entry {:?}", line);
		}
		entries.push(MountInfoEntry {
			root: unescape_mount_field(fields[3]),
			mount_dir: PathBuf::from(unescape_mount_field(fields[4])),
			fs_type: fields[sep + 1].to_owned(),
			mount_source: unescape_mount_field(fields[sep + 2]),
		});
	}
	Ok(entries)
}

/// Locate the block device of a structure through the by-partlabel and
/// by-label symlink farms.
///
/// Both candidates are consulted when available; resolving to two
/// different devices is an error, as is a non-symlink squatting on a
/// candidate path. No candidate existing at all yields
/// [`LookupError::DeviceNotFound`].
pub fn find_device_for_structure(env: &LookupEnv, vs: &VolumeStructure) -> Result<PathBuf> {
	let mut candidates: Vec<PathBuf> = Vec::new();
	if let Some(name) = vs.name.as_deref() {
		if !name.is_empty() {
			candidates.push(
				env.dev_dir
					.join("disk/by-partlabel")
					.join(labels::encode(name)),
			);
		}
	}
	if vs.has_filesystem() {
		if let Some(label) = vs.effective_filesystem_label() {
			candidates.push(env.dev_dir.join("disk/by-label").join(labels::encode(label)));
		}
	}

	let mut found: Option<PathBuf> = None;
	for candidate in &candidates {
		let meta = match fs::symlink_metadata(candidate) {
			Ok(meta) => meta,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
			Err(e) => {
				return Err(e).with_context(|| {
					format!("cannot inspect candidate '{}'", candidate.display())
				})
			}
		};
		if !meta.file_type().is_symlink() {
			bail!(
				"candidate '{}' is not a symlink to a device",
				candidate.display()
			);
		}
		let target = fs::canonicalize(candidate).with_context(|| {
			format!("cannot resolve symlink '{}'", candidate.display())
		})?;
		debug!(
			"Candidate '{}' resolves to '{}'",
			candidate.display(),
			target.display()
		);
		match &found {
			Some(previous) if *previous != target => {
				bail!(
					"conflicting device match, '{}' points to '{}', previous match was '{}'",
					candidate.display(),
					target.display(),
					previous.display()
				);
			}
			_ => found = Some(target),
		}
	}
	found.ok_or_else(|| {
		anyhow::Error::new(LookupError::DeviceNotFound).context(format!(
			"cannot find device for structure \"{}\"",
			vs.name.as_deref().unwrap_or("")
		))
	})
}

/// The disk holding a partition, found through `/sys/block`: the one block
/// directory containing an entry named after the partition. Exactly one
/// match is required.
pub fn find_parent_disk(env: &LookupEnv, partition: &Path) -> Result<PathBuf> {
	let basename = partition
		.file_name()
		.map(|n| n.to_string_lossy().into_owned())
		.ok_or_else(|| {
			anyhow!("unexpected partition device '{}'", partition.display())
		})?;
	let block_dir = env.sys_dir.join("block");
	let mut matches: Vec<String> = Vec::new();
	for entry in fs::read_dir(&block_dir)
		.with_context(|| format!("cannot enumerate '{}'", block_dir.display()))?
	{
		let entry = entry?;
		if entry.path().join(&basename).exists() {
			matches.push(entry.file_name().to_string_lossy().into_owned());
		}
	}
	match matches.len() {
		0 => Err(anyhow::Error::new(LookupError::DeviceNotFound).context(format!(
			"cannot find parent disk of partition '{}'",
			partition.display()
		))),
		1 => Ok(env.dev_dir.join(&matches[0])),
		_ => Err(anyhow!(
			"unexpected number of matches ({}) for parent disk of '{}'",
			matches.len(),
			partition.display()
		)),
	}
}

/// Infer the parent disk from the mounted writable filesystem: the
/// mountinfo entry rooted at `/` mounted on `/writable` as ext4 names a
/// partition; the disk is whatever `/sys/block` entry contains it.
fn find_device_with_writable_fallback(env: &LookupEnv) -> Result<PathBuf> {
	let entries = load_mountinfo(&env.mountinfo_path)?;
	let partition = entries
		.iter()
		.find(|e| {
			e.root == "/" && e.mount_dir == Path::new("/writable") && e.fs_type == "ext4"
		})
		.map(|e| e.mount_source.clone())
		.ok_or_else(|| {
			anyhow::Error::new(LookupError::DeviceNotFound)
				.context("cannot find mounted writable partition")
		})?;
	find_parent_disk(env, Path::new(&partition))
}

/// Locate the device holding a laid-out structure, together with the
/// offset of the structure on that device.
///
/// Partition structures resolve to their partition node at offset 0.
/// Structures that cannot have a partition entry (bare regions, the MBR)
/// or carry no name resolve to the whole disk, at the structure's
/// absolute start offset within the volume.
pub fn find_device_for_structure_with_fallback(
	env: &LookupEnv,
	ls: &LaidOutStructure,
) -> Result<(PathBuf, Offset)> {
	let vs = &ls.structure;
	let unnamed = vs.name.as_deref().unwrap_or("").is_empty();
	if !vs.has_filesystem() && (!vs.is_partition() || unnamed) {
		let disk = find_device_with_writable_fallback(env)?;
		return Ok((disk, ls.start_offset));
	}
	let device = find_device_for_structure(env, vs)?;
	Ok((device, Offset(0)))
}

/// Locate the mount point of a filesystem structure.
pub fn find_mount_point_for_structure(env: &LookupEnv, vs: &VolumeStructure) -> Result<PathBuf> {
	if !vs.has_filesystem() {
		return Err(anyhow::Error::new(LookupError::NoFilesystemDefined).context(format!(
			"structure \"{}\" has no filesystem",
			vs.name.as_deref().unwrap_or("")
		)));
	}
	let device = find_device_for_structure(env, vs)?;
	let device_str = device.to_string_lossy();
	let fs_type = vs.filesystem.to_string();
	let entries = load_mountinfo(&env.mountinfo_path)?;
	for entry in &entries {
		if entry.mount_source == device_str && entry.root == "/" && entry.fs_type == fs_type {
			return Ok(entry.mount_dir.clone());
		}
	}
	Err(anyhow::Error::new(LookupError::MountNotFound).context(format!(
		"cannot find mount point of device '{}' ({})",
		device.display(),
		fs_type
	)))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		gadget::GadgetSpec,
		layout::{layout_volume_partially, LayoutConstraints},
	};
	use std::os::unix::fs::symlink;

	fn env(tmp: &Path) -> LookupEnv {
		LookupEnv {
			dev_dir: tmp.join("dev"),
			sys_dir: tmp.join("sys"),
			mountinfo_path: tmp.join("mountinfo"),
		}
	}

	fn structure(manifest: &str) -> VolumeStructure {
		GadgetSpec::from_toml(manifest)
			.unwrap()
			.volumes
			.values()
			.next()
			.unwrap()
			.structure[0]
			.clone()
	}

	const ESP: &str = r#"
[volumes.pc]
[[volumes.pc.structure]]
name = "EFI System"
role = "system-boot"
type = "C12A7328-F81F-11D2-BA4B-00A0C93EC93B"
filesystem = "vfat"
label = "system-boot"
size = 1048576
"#;

	fn mkdev(tmp: &Path, name: &str) -> PathBuf {
		let node = tmp.join("dev").join(name);
		fs::create_dir_all(node.parent().unwrap()).unwrap();
		fs::write(&node, b"").unwrap();
		node
	}

	fn mklink(tmp: &Path, dir: &str, name: &str, target: &Path) {
		let d = tmp.join("dev/disk").join(dir);
		fs::create_dir_all(&d).unwrap();
		symlink(target, d.join(name)).unwrap();
	}

	#[test]
	fn test_device_by_symlinks() -> Result<()> {
		let tmp = tempfile::tempdir()?;
		let vda2 = mkdev(tmp.path(), "vda2");
		mklink(tmp.path(), "by-partlabel", "EFI\\x20System", &vda2);
		mklink(tmp.path(), "by-label", "system-boot", &vda2);
		let vs = structure(ESP);
		let found = find_device_for_structure(&env(tmp.path()), &vs)?;
		assert_eq!(found, vda2.canonicalize()?);
		Ok(())
	}

	#[test]
	fn test_device_conflicts_and_misses() -> Result<()> {
		let tmp = tempfile::tempdir()?;
		let vs = structure(ESP);
		// Nothing exists: DeviceNotFound.
		let err = find_device_for_structure(&env(tmp.path()), &vs).unwrap_err();
		assert!(is_lookup_error(&err, LookupError::DeviceNotFound));

		// Candidates resolving to different devices conflict.
		let vda2 = mkdev(tmp.path(), "vda2");
		let vdb2 = mkdev(tmp.path(), "vdb2");
		mklink(tmp.path(), "by-partlabel", "EFI\\x20System", &vda2);
		mklink(tmp.path(), "by-label", "system-boot", &vdb2);
		let err = find_device_for_structure(&env(tmp.path()), &vs).unwrap_err();
		assert!(format!("{:#}", err).contains("conflicting device match"));
		Ok(())
	}

	#[test]
	fn test_non_symlink_candidate_is_fatal() -> Result<()> {
		let tmp = tempfile::tempdir()?;
		let d = tmp.path().join("dev/disk/by-partlabel");
		fs::create_dir_all(&d)?;
		fs::write(d.join("EFI\\x20System"), b"not a symlink")?;
		let err = find_device_for_structure(&env(tmp.path()), &structure(ESP)).unwrap_err();
		assert!(format!("{:#}", err).contains("is not a symlink"));
		Ok(())
	}

	fn setup_writable(tmp: &Path, disk: &str, part: &str) {
		mkdev(tmp, disk);
		mkdev(tmp, part);
		let block = tmp.join("sys/block").join(disk);
		fs::create_dir_all(block.join(part)).unwrap();
		let mountinfo = format!(
			"26 20 8:3 / /writable rw,relatime shared:7 - ext4 /dev/{} rw\n\
			 27 20 0:23 / /run rw,nosuid shared:8 - tmpfs tmpfs rw\n",
			part
		);
		fs::write(tmp.join("mountinfo"), mountinfo).unwrap();
	}

	#[test]
	fn test_fallback_for_bare_structures() -> Result<()> {
		let tmp = tempfile::tempdir()?;
		setup_writable(tmp.path(), "sda", "sda3");
		let spec = GadgetSpec::from_toml(
			r#"
[volumes.v]
[[volumes.v.structure]]
name = "firmware"
type = "bare"
offset = 4194304
size = 1048576
"#,
		)?;
		let vol = spec.volumes.values().next().unwrap();
		let lv = layout_volume_partially(vol, &LayoutConstraints::default())?;
		let (device, offset) =
			find_device_for_structure_with_fallback(&env(tmp.path()), &lv.structures[0])?;
		assert_eq!(device, tmp.path().join("dev/sda"));
		// The offset is the structure's position within the volume, since
		// the device is the whole disk.
		assert_eq!(offset, Offset(4194304));
		Ok(())
	}

	#[test]
	fn test_fallback_requires_single_match() -> Result<()> {
		let tmp = tempfile::tempdir()?;
		setup_writable(tmp.path(), "sda", "sda3");
		// A second disk claiming the same partition name.
		fs::create_dir_all(tmp.path().join("sys/block/sdb/sda3"))?;
		let spec = GadgetSpec::from_toml(
			r#"
[volumes.v]
[[volumes.v.structure]]
name = "firmware"
type = "bare"
size = 1048576
"#,
		)?;
		let vol = spec.volumes.values().next().unwrap();
		let lv = layout_volume_partially(vol, &LayoutConstraints::default())?;
		let err = find_device_for_structure_with_fallback(&env(tmp.path()), &lv.structures[0])
			.unwrap_err();
		assert!(format!("{:#}", err).contains("unexpected number of matches"));
		Ok(())
	}

	#[test]
	fn test_mount_point_lookup() -> Result<()> {
		let tmp = tempfile::tempdir()?;
		let vda2 = mkdev(tmp.path(), "vda2");
		mklink(tmp.path(), "by-partlabel", "EFI\\x20System", &vda2);
		let canonical = vda2.canonicalize()?;
		let mountinfo = format!(
			"26 20 8:2 / /boot/efi rw,relatime shared:7 - vfat {} rw\n\
			 27 20 8:2 /sub /elsewhere rw - vfat {} rw\n",
			canonical.display(),
			canonical.display()
		);
		fs::write(tmp.path().join("mountinfo"), mountinfo)?;
		let vs = structure(ESP);
		let mount = find_mount_point_for_structure(&env(tmp.path()), &vs)?;
		assert_eq!(mount, PathBuf::from("/boot/efi"));
		Ok(())
	}

	#[test]
	fn test_mount_point_error_kinds() -> Result<()> {
		let tmp = tempfile::tempdir()?;
		let bare = structure(
			r#"
[volumes.v]
[[volumes.v.structure]]
name = "firmware"
type = "bare"
size = 1048576
"#,
		);
		let err = find_mount_point_for_structure(&env(tmp.path()), &bare).unwrap_err();
		assert!(is_lookup_error(&err, LookupError::NoFilesystemDefined));

		// Device exists but nothing is mounted from it.
		let vda2 = mkdev(tmp.path(), "vda2");
		mklink(tmp.path(), "by-partlabel", "EFI\\x20System", &vda2);
		fs::write(tmp.path().join("mountinfo"), "")?;
		let err = find_mount_point_for_structure(&env(tmp.path()), &structure(ESP)).unwrap_err();
		assert!(is_lookup_error(&err, LookupError::MountNotFound));
		Ok(())
	}

	#[test]
	fn test_mountinfo_parsing() -> Result<()> {
		let tmp = tempfile::tempdir()?;
		let path = tmp.path().join("mountinfo");
		fs::write(
			&path,
			"26 20 8:3 / /mnt/with\\040space rw,relatime shared:7 master:1 - ext4 /dev/sda3 rw\n",
		)?;
		let entries = load_mountinfo(&path)?;
		assert_eq!(entries.len(), 1);
		assert_eq!(entries[0].root, "/");
		assert_eq!(entries[0].mount_dir, PathBuf::from("/mnt/with space"));
		assert_eq!(entries[0].fs_type, "ext4");
		assert_eq!(entries[0].mount_source, "/dev/sda3");

		fs::write(&path, "26 20 8:3 / /mnt rw\n")?;
		assert!(load_mountinfo(&path).is_err());
		Ok(())
	}
}
