//! Writing and updating the content of mounted (or stageable)
//! filesystems.
//!
//! The writer deploys gadget content into a target directory with rsync
//! semantics. The updater wraps the same deployment logic in a
//! backup/update/rollback lifecycle: before anything is overwritten a
//! byte-exact backup (or a cheaper equal-content stamp) is taken under the
//! rollback directory, and rollback restores the destination exactly as it
//! was.

use std::{
	fs,
	path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use log::debug;

use crate::{
	layout::{LaidOutStructure, ResolvedContent},
	update::{
		structure_backup_root, ContentChange, ContentChangeAction, ContentObserver,
		ContentOperation, NoUpdateError, Updater,
	},
	utils,
};

/// How one content entry maps onto the destination tree.
enum Deployment {
	/// Copy the contents of `src` under `dst`.
	Directory { src: PathBuf, dst: PathBuf },
	/// Copy the single file `src` to exactly `dst`.
	File { src: PathBuf, dst: PathBuf },
}

/// Apply the rsync-style source/target rules:
/// `src/` → `dst` deploys the contents of src under dst; a directory
/// `src` → `dst` deploys src itself under dst; a file `src` → `dst/`
/// lands at `dst/basename(src)`.
fn resolve_deployment(target_root: &Path, rc: &ResolvedContent) -> Result<Deployment> {
	let source = rc.content.source.as_deref().unwrap_or("");
	let target = rc.content.target.as_deref().unwrap_or("");
	// Joining a path with a leading slash would replace the whole path.
	let dst_base = target_root.join(target.trim_start_matches('/'));
	let src = rc.resolved_source.clone();
	let meta = fs::metadata(&src)
		.with_context(|| format!("cannot stat content source '{}'", src.display()))?;
	if meta.is_dir() {
		if source.ends_with('/') {
			return Ok(Deployment::Directory { src, dst: dst_base });
		}
		let name = src
			.file_name()
			.with_context(|| format!("unexpected content source '{}'", src.display()))?
			.to_owned();
		return Ok(Deployment::Directory {
			src,
			dst: dst_base.join(name),
		});
	}
	if target.ends_with('/') || dst_base.is_dir() {
		let name = src
			.file_name()
			.with_context(|| format!("unexpected content source '{}'", src.display()))?
			.to_owned();
		return Ok(Deployment::File {
			src,
			dst: dst_base.join(name),
		});
	}
	Ok(Deployment::File { src, dst: dst_base })
}

/// Callbacks for one deployment walk. `on_symlink` of `None` makes
/// symlinks an error, which is what the updater wants.
struct WalkHandlers<'a> {
	on_dir: Option<&'a mut dyn FnMut(&Path) -> Result<()>>,
	on_file: &'a mut dyn FnMut(&Path, &Path) -> Result<()>,
	on_symlink: Option<&'a mut dyn FnMut(&Path, &Path) -> Result<()>>,
}

fn walk_tree(src: &Path, rel: &Path, handlers: &mut WalkHandlers) -> Result<()> {
	if let Some(on_dir) = handlers.on_dir.as_mut() {
		on_dir(rel)?;
	}
	let mut entries: Vec<_> = fs::read_dir(src)
		.with_context(|| format!("cannot enumerate '{}'", src.display()))?
		.collect::<std::io::Result<_>>()?;
	entries.sort_by_key(|e| e.file_name());
	for entry in entries {
		let path = entry.path();
		let entry_rel = rel.join(entry.file_name());
		let ftype = entry.file_type()?;
		if ftype.is_symlink() {
			match handlers.on_symlink.as_mut() {
				Some(on_symlink) => on_symlink(&path, &entry_rel)?,
				None => bail!(
					"cannot handle '{}': symbolic links are not supported",
					path.display()
				),
			}
		} else if ftype.is_dir() {
			walk_tree(&path, &entry_rel, handlers)?;
		} else {
			(handlers.on_file)(&path, &entry_rel)?;
		}
	}
	Ok(())
}

/// Walk one content entry, reporting destination-relative paths.
fn walk_deployment(
	target_root: &Path,
	rc: &ResolvedContent,
	handlers: &mut WalkHandlers,
) -> Result<()> {
	match resolve_deployment(target_root, rc)? {
		Deployment::Directory { src, dst } => {
			let rel = dst.strip_prefix(target_root).unwrap_or(&dst).to_path_buf();
			walk_tree(&src, &rel, handlers)
		}
		Deployment::File { src, dst } => {
			let meta = fs::symlink_metadata(&src)?;
			let rel = dst.strip_prefix(target_root).unwrap_or(&dst).to_path_buf();
			if meta.file_type().is_symlink() {
				match handlers.on_symlink.as_mut() {
					Some(on_symlink) => on_symlink(&src, &rel),
					None => bail!(
						"cannot handle '{}': symbolic links are not supported",
						src.display()
					),
				}
			} else {
				(handlers.on_file)(&src, &rel)
			}
		}
	}
}

/// Prefix the preserve list with the destination root and sort it for
/// binary search. An entry resolving to an existing directory is a
/// misconfiguration.
fn normalize_preserve(target_root: &Path, preserve: &[String]) -> Result<Vec<PathBuf>> {
	let mut out = Vec::with_capacity(preserve.len());
	for entry in preserve {
		let path = target_root.join(entry.trim_start_matches('/'));
		if path.is_dir() {
			bail!(
				"preserved entry '{}' cannot be a directory",
				path.display()
			);
		}
		out.push(path);
	}
	out.sort();
	Ok(out)
}

fn is_preserved(preserve: &[PathBuf], dst: &Path) -> bool {
	preserve.binary_search_by(|p| p.as_path().cmp(dst)).is_ok()
}

/// Deploys the resolved content of a filesystem structure into a target
/// directory.
pub struct MountedFilesystemWriter<'a> {
	structure: &'a LaidOutStructure,
	observer: Option<&'a dyn ContentObserver>,
}

impl<'a> MountedFilesystemWriter<'a> {
	pub fn new(
		structure: &'a LaidOutStructure,
		observer: Option<&'a dyn ContentObserver>,
	) -> Result<Self> {
		if !structure.structure.has_filesystem() {
			bail!("structure {} has no filesystem", structure);
		}
		Ok(MountedFilesystemWriter { structure, observer })
	}

	pub fn write(&self, target_root: &Path, preserve: &[String]) -> Result<()> {
		let preserve = normalize_preserve(target_root, preserve)?;
		for rc in &self.structure.resolved_content {
			self.write_content(target_root, rc, &preserve)
				.with_context(|| format!("cannot write content {}", rc.content))?;
		}
		Ok(())
	}

	fn write_content(
		&self,
		target_root: &Path,
		rc: &ResolvedContent,
		preserve: &[PathBuf],
	) -> Result<()> {
		let mut on_dir = |rel: &Path| utils::mkdir_p(&target_root.join(rel));
		let mut on_file = |src: &Path, rel: &Path| self.write_file(target_root, src, rel, preserve);
		let mut on_symlink =
			|src: &Path, rel: &Path| self.write_symlink(target_root, src, rel, preserve);
		walk_deployment(
			target_root,
			rc,
			&mut WalkHandlers {
				on_dir: Some(&mut on_dir),
				on_file: &mut on_file,
				on_symlink: Some(&mut on_symlink),
			},
		)
	}

	fn observe(
		&self,
		target_root: &Path,
		rel: &Path,
		change: &ContentChange,
	) -> Result<ContentChangeAction> {
		match self.observer {
			Some(observer) => observer.observe(
				ContentOperation::Write,
				self.structure,
				target_root,
				rel,
				change,
			),
			None => Ok(ContentChangeAction::Apply),
		}
	}

	fn write_file(
		&self,
		target_root: &Path,
		src: &Path,
		rel: &Path,
		preserve: &[PathBuf],
	) -> Result<()> {
		let dst = target_root.join(rel);
		if is_preserved(preserve, &dst) && dst.exists() {
			debug!("Preserving existing '{}'", dst.display());
			return Ok(());
		}
		if dst.is_dir() {
			bail!(
				"cannot write '{}': refusing to overwrite a directory with a file",
				dst.display()
			);
		}
		let change = ContentChange {
			before: None,
			after: src.to_path_buf(),
		};
		match self.observe(target_root, rel, &change)? {
			ContentChangeAction::Ignore => return Ok(()),
			ContentChangeAction::Abort => bail!("write of '{}' aborted by the observer", dst.display()),
			ContentChangeAction::Apply => {}
		}
		if let Some(parent) = dst.parent() {
			utils::mkdir_p(parent)?;
		}
		utils::copy_file_synced(src, &dst)
			.with_context(|| format!("cannot write '{}'", dst.display()))
	}

	fn write_symlink(
		&self,
		target_root: &Path,
		src: &Path,
		rel: &Path,
		preserve: &[PathBuf],
	) -> Result<()> {
		let dst = target_root.join(rel);
		if is_preserved(preserve, &dst) && fs::symlink_metadata(&dst).is_ok() {
			debug!("Preserving existing '{}'", dst.display());
			return Ok(());
		}
		let target = fs::read_link(src)
			.with_context(|| format!("cannot read symlink '{}'", src.display()))?;
		if let Some(parent) = dst.parent() {
			utils::mkdir_p(parent)?;
		}
		match fs::symlink_metadata(&dst) {
			Ok(meta) if meta.is_dir() => bail!(
				"cannot write '{}': refusing to overwrite a directory with a symlink",
				dst.display()
			),
			Ok(_) => fs::remove_file(&dst)?,
			Err(_) => {}
		}
		std::os::unix::fs::symlink(&target, &dst)
			.with_context(|| format!("cannot create symlink '{}'", dst.display()))
	}
}

/// Which stamp kinds sit next to a mirrored destination path in the
/// backup tree.
const BACKUP_SUFFIX: &str = ".backup";
const SAME_SUFFIX: &str = ".same";
const PRESERVE_SUFFIX: &str = ".preserve";

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
	let mut os = path.as_os_str().to_owned();
	os.push(suffix);
	PathBuf::from(os)
}

/// Backup/update/rollback of one filesystem structure through its mounted
/// destination.
pub struct MountedFilesystemUpdater<'a> {
	structure: &'a LaidOutStructure,
	backup_root: PathBuf,
	/// The writable mount point of the structure, or the reason it could
	/// not be resolved. The reason only turns into an error when one of
	/// the lifecycle operations actually runs.
	mount: std::result::Result<PathBuf, String>,
	observer: Option<&'a dyn ContentObserver>,
}

impl<'a> MountedFilesystemUpdater<'a> {
	pub fn new(
		structure: &'a LaidOutStructure,
		rollback_dir: &Path,
		mount: std::result::Result<PathBuf, String>,
		observer: Option<&'a dyn ContentObserver>,
	) -> Result<Self> {
		if !structure.structure.has_filesystem() {
			bail!("structure {} has no filesystem", structure);
		}
		Ok(MountedFilesystemUpdater {
			structure,
			backup_root: structure_backup_root(rollback_dir, structure.yaml_index),
			mount,
			observer,
		})
	}

	fn mount_point(&self) -> Result<&Path> {
		match &self.mount {
			Ok(path) => Ok(path),
			Err(reason) => bail!(
				"cannot use structure {}: {}",
				self.structure,
				reason
			),
		}
	}

	fn observe(
		&self,
		op: ContentOperation,
		root: &Path,
		rel: &Path,
		change: &ContentChange,
	) -> Result<ContentChangeAction> {
		match self.observer {
			Some(observer) => observer.observe(op, self.structure, root, rel, change),
			None => Ok(ContentChangeAction::Apply),
		}
	}

	/// Record which ancestor directories of `rel` already exist, so that
	/// rollback can tell apart directories this update created.
	fn backup_prefixes(&self, root: &Path, rel: &Path) -> Result<()> {
		let Some(dir) = rel.parent() else {
			return Ok(());
		};
		let mut prefix = PathBuf::new();
		for comp in dir.components() {
			prefix.push(comp);
			if !root.join(&prefix).is_dir() {
				continue;
			}
			let stamp = with_suffix(&self.backup_root.join(&prefix), BACKUP_SUFFIX);
			if stamp.exists() {
				continue;
			}
			if let Some(parent) = stamp.parent() {
				utils::mkdir_p(parent)?;
			}
			utils::atomic_write(&stamp, b"")?;
		}
		Ok(())
	}

	fn backup_file(
		&self,
		root: &Path,
		src: &Path,
		rel: &Path,
		preserve: &[PathBuf],
	) -> Result<()> {
		let dst = root.join(rel);
		if let Ok(meta) = fs::symlink_metadata(&dst) {
			if meta.file_type().is_symlink() {
				bail!(
					"cannot backup file '{}': symbolic links are not supported",
					dst.display()
				);
			}
		}
		let mirrored = self.backup_root.join(rel);
		let backup = with_suffix(&mirrored, BACKUP_SUFFIX);
		let same = with_suffix(&mirrored, SAME_SUFFIX);
		let preserve_stamp = with_suffix(&mirrored, PRESERVE_SUFFIX);

		if is_preserved(preserve, &dst) {
			if dst.exists() && !preserve_stamp.exists() {
				if let Some(parent) = preserve_stamp.parent() {
					utils::mkdir_p(parent)?;
				}
				utils::atomic_write(&preserve_stamp, b"")?;
			}
			return Ok(());
		}
		// A backup from an earlier, interrupted run still holds.
		if backup.exists() || same.exists() {
			return Ok(());
		}
		if !dst.exists() {
			return self.backup_prefixes(root, rel);
		}

		if let Some(parent) = backup.parent() {
			utils::mkdir_p(parent)?;
		}
		let partial = with_suffix(&mirrored, ".partial");
		let result = (|| -> Result<bool> {
			let mut from = fs::File::open(&dst)
				.with_context(|| format!("cannot open '{}'", dst.display()))?;
			let mut to = fs::File::create(&partial)?;
			let (_, dst_digest) = utils::copy_and_hash(&mut from, &mut to)?;
			to.sync_all()?;
			let src_digest = utils::file_digest(src)?;
			Ok(dst_digest == src_digest)
		})();
		match result {
			Ok(true) => {
				// The destination already has the update's content; a
				// zero-byte stamp is enough to remember that.
				fs::remove_file(&partial)?;
				utils::atomic_write(&same, b"")?;
			}
			Ok(false) => {
				fs::rename(&partial, &backup)?;
				self.backup_prefixes(root, rel)?;
			}
			Err(e) => {
				let _ = fs::remove_file(&partial);
				return Err(e);
			}
		}
		Ok(())
	}

	fn update_file(
		&self,
		root: &Path,
		src: &Path,
		rel: &Path,
		preserve: &[PathBuf],
		relevant: &mut usize,
	) -> Result<()> {
		let dst = root.join(rel);
		if is_preserved(preserve, &dst) && dst.exists() {
			debug!("Not updating preserved '{}'", dst.display());
			return Ok(());
		}
		let mirrored = self.backup_root.join(rel);
		let backup = with_suffix(&mirrored, BACKUP_SUFFIX);
		if with_suffix(&mirrored, SAME_SUFFIX).exists() {
			debug!("Not updating identical '{}'", dst.display());
			return Ok(());
		}
		*relevant += 1;
		if dst.exists() && !backup.exists() {
			bail!("missing backup file for '{}'", dst.display());
		}
		let change = ContentChange {
			before: backup.exists().then(|| backup.clone()),
			after: src.to_path_buf(),
		};
		match self.observe(ContentOperation::Update, root, rel, &change)? {
			ContentChangeAction::Ignore => return Ok(()),
			ContentChangeAction::Abort => {
				bail!("update of '{}' aborted by the observer", dst.display())
			}
			ContentChangeAction::Apply => {}
		}
		if let Some(parent) = dst.parent() {
			utils::mkdir_p(parent)?;
		}
		utils::copy_file_synced(src, &dst)
			.with_context(|| format!("cannot update '{}'", dst.display()))
	}

	fn rollback_file(&self, root: &Path, src: &Path, rel: &Path) -> Result<()> {
		let dst = root.join(rel);
		let mirrored = self.backup_root.join(rel);
		let backup = with_suffix(&mirrored, BACKUP_SUFFIX);
		if with_suffix(&mirrored, PRESERVE_SUFFIX).exists()
			|| with_suffix(&mirrored, SAME_SUFFIX).exists()
		{
			return Ok(());
		}
		let change = ContentChange {
			before: backup.exists().then(|| backup.clone()),
			after: src.to_path_buf(),
		};
		// Rollback cannot be vetoed; the observer is informed all the
		// same.
		if let Err(e) = self.observe(ContentOperation::Rollback, root, rel, &change) {
			debug!("Observer error during rollback of '{}': {}", dst.display(), e);
		}
		if backup.exists() {
			utils::copy_file_synced(&backup, &dst)
				.with_context(|| format!("cannot restore '{}'", dst.display()))?;
			return Ok(());
		}
		// The file was created by the update; remove it, along with any
		// directories the update created on the way.
		match fs::remove_file(&dst) {
			Ok(()) => {}
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
			Err(e) => {
				return Err(e)
					.with_context(|| format!("cannot remove '{}'", dst.display()))
			}
		}
		if let Some(dir) = rel.parent() {
			let mut prefixes: Vec<PathBuf> = Vec::new();
			let mut prefix = PathBuf::new();
			for comp in dir.components() {
				prefix.push(comp);
				prefixes.push(prefix.clone());
			}
			for prefix in prefixes.iter().rev() {
				let stamp =
					with_suffix(&self.backup_root.join(prefix), BACKUP_SUFFIX);
				if stamp.exists() {
					// The directory predates the update, and so do all
					// of its parents.
					break;
				}
				if let Err(e) = fs::remove_dir(root.join(prefix)) {
					debug!(
						"Leaving directory '{}' behind: {}",
						prefix.display(),
						e
					);
					break;
				}
			}
		}
		Ok(())
	}
}

impl Updater for MountedFilesystemUpdater<'_> {
	fn backup(&self) -> Result<()> {
		let root = self.mount_point()?.to_path_buf();
		let preserve = normalize_preserve(&root, &self.structure.structure.update.preserve)?;
		utils::mkdir_p(&self.backup_root)?;
		for rc in &self.structure.resolved_content {
			let mut on_file =
				|src: &Path, rel: &Path| self.backup_file(&root, src, rel, &preserve);
			walk_deployment(
				&root,
				rc,
				&mut WalkHandlers {
					on_dir: None,
					on_file: &mut on_file,
					on_symlink: None,
				},
			)
			.with_context(|| format!("cannot backup content {}", rc.content))?;
		}
		Ok(())
	}

	fn update(&self) -> Result<()> {
		let root = self.mount_point()?.to_path_buf();
		let preserve = normalize_preserve(&root, &self.structure.structure.update.preserve)?;
		let mut relevant = 0usize;
		for rc in &self.structure.resolved_content {
			let mut on_file = |src: &Path, rel: &Path| {
				self.update_file(&root, src, rel, &preserve, &mut relevant)
			};
			walk_deployment(
				&root,
				rc,
				&mut WalkHandlers {
					on_dir: None,
					on_file: &mut on_file,
					on_symlink: None,
				},
			)
			.with_context(|| format!("cannot update content {}", rc.content))?;
		}
		// Everything already matched the update (or was preserved).
		if relevant == 0 {
			return Err(anyhow::Error::new(NoUpdateError));
		}
		Ok(())
	}

	fn rollback(&self) -> Result<()> {
		let root = self.mount_point()?.to_path_buf();
		for rc in &self.structure.resolved_content {
			let mut on_file = |src: &Path, rel: &Path| self.rollback_file(&root, src, rel);
			walk_deployment(
				&root,
				rc,
				&mut WalkHandlers {
					on_dir: None,
					on_file: &mut on_file,
					on_symlink: None,
				},
			)
			.with_context(|| format!("cannot roll back content {}", rc.content))?;
		}
		Ok(())
	}

	fn name(&self) -> String {
		format!("mounted filesystem structure {}", self.structure)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		gadget::GadgetSpec,
		layout::{layout_volume, LayoutConstraints},
		update::is_no_update,
	};
	use std::os::unix::fs::symlink;

	fn laid_out_with_content(
		gadget_root: &Path,
		content: &[(&str, &str)],
		preserve: &[&str],
	) -> LaidOutStructure {
		let mut manifest = String::from(
			"[volumes.v]\n[[volumes.v.structure]]\nname = \"data\"\ntype = \"0FC63DAF-8483-4772-8E79-3D69D8477DE4\"\nfilesystem = \"ext4\"\nsize = 1048576\n",
		);
		if !preserve.is_empty() {
			let quoted: Vec<String> =
				preserve.iter().map(|p| format!("\"{}\"", p)).collect();
			manifest += &format!(
				"update = {{ edition = 1, preserve = [{}] }}\n",
				quoted.join(", ")
			);
		}
		for (source, target) in content {
			manifest += &format!(
				"[[volumes.v.structure.content]]\nsource = \"{}\"\ntarget = \"{}\"\n",
				source, target
			);
		}
		let spec = GadgetSpec::from_toml(&manifest).unwrap();
		let vol = spec.volumes.values().next().unwrap();
		let lv =
			layout_volume(vol, gadget_root, None, None, &LayoutConstraints::default()).unwrap();
		lv.structures.into_iter().next().unwrap()
	}

	fn tree(root: &Path, files: &[(&str, &str)]) {
		for (path, content) in files {
			let p = root.join(path);
			fs::create_dir_all(p.parent().unwrap()).unwrap();
			fs::write(&p, content).unwrap();
		}
	}

	#[test]
	fn test_writer_semantics() -> Result<()> {
		let staging = tempfile::tempdir()?;
		let target = tempfile::tempdir()?;
		tree(
			staging.path(),
			&[
				("boot-assets/splash.bmp", "splash"),
				("boot-assets/nested/cfg.txt", "cfg"),
				("grubx64.efi", "efi"),
			],
		);
		let ls = laid_out_with_content(
			staging.path(),
			&[
				// Contents of the directory under the root.
				("boot-assets/", "/"),
				// The directory itself under a prefix.
				("boot-assets", "/deploy"),
				// A single file into a directory target.
				("grubx64.efi", "/EFI/boot/"),
			],
			&[],
		);
		let writer = MountedFilesystemWriter::new(&ls, None)?;
		writer.write(target.path(), &[])?;
		assert_eq!(fs::read(target.path().join("splash.bmp"))?, b"splash");
		assert_eq!(fs::read(target.path().join("nested/cfg.txt"))?, b"cfg");
		assert_eq!(
			fs::read(target.path().join("deploy/boot-assets/splash.bmp"))?,
			b"splash"
		);
		assert_eq!(fs::read(target.path().join("EFI/boot/grubx64.efi"))?, b"efi");
		Ok(())
	}

	#[test]
	fn test_writer_preserves_and_refuses_dirs() -> Result<()> {
		let staging = tempfile::tempdir()?;
		let target = tempfile::tempdir()?;
		tree(staging.path(), &[("cfg.txt", "new"), ("other.txt", "new")]);
		tree(target.path(), &[("cfg.txt", "old")]);
		let ls = laid_out_with_content(
			staging.path(),
			&[("cfg.txt", "cfg.txt"), ("other.txt", "other.txt")],
			&[],
		);
		let writer = MountedFilesystemWriter::new(&ls, None)?;
		writer.write(target.path(), &["cfg.txt".to_owned()])?;
		assert_eq!(fs::read(target.path().join("cfg.txt"))?, b"old");
		assert_eq!(fs::read(target.path().join("other.txt"))?, b"new");

		// Overwriting a directory with a file is fatal. The collision
		// happens inside a directory deployment, where the relative path
		// is fixed.
		tree(staging.path(), &[("deploy/file.txt", "new")]);
		fs::create_dir_all(target.path().join("deploy/file.txt"))?;
		let ls = laid_out_with_content(staging.path(), &[("deploy/", "deploy")], &[]);
		let writer = MountedFilesystemWriter::new(&ls, None)?;
		let err = writer.write(target.path(), &[]).unwrap_err();
		assert!(format!("{:#}", err).contains("refusing to overwrite a directory"));

		// A preserve entry naming a directory is a misconfiguration.
		let err = writer
			.write(target.path(), &["deploy".to_owned()])
			.unwrap_err();
		assert!(format!("{:#}", err).contains("cannot be a directory"));
		Ok(())
	}

	#[test]
	fn test_writer_keeps_symlinks() -> Result<()> {
		let staging = tempfile::tempdir()?;
		let target = tempfile::tempdir()?;
		tree(staging.path(), &[("assets/real.cfg", "cfg")]);
		symlink("real.cfg", staging.path().join("assets/link.cfg"))?;
		let ls = laid_out_with_content(staging.path(), &[("assets/", "/")], &[]);
		MountedFilesystemWriter::new(&ls, None)?.write(target.path(), &[])?;
		let link = target.path().join("link.cfg");
		assert!(fs::symlink_metadata(&link)?.file_type().is_symlink());
		assert_eq!(fs::read_link(&link)?, PathBuf::from("real.cfg"));
		assert_eq!(fs::read(&link)?, b"cfg");
		Ok(())
	}

	fn updater<'a>(
		ls: &'a LaidOutStructure,
		rollback: &Path,
		target: &Path,
	) -> MountedFilesystemUpdater<'a> {
		MountedFilesystemUpdater::new(ls, rollback, Ok(target.to_path_buf()), None).unwrap()
	}

	#[test]
	fn test_backup_then_update_then_rollback() -> Result<()> {
		let staging = tempfile::tempdir()?;
		let target = tempfile::tempdir()?;
		let rollback = tempfile::tempdir()?;
		tree(staging.path(), &[("foo", "new"), ("fresh/sub/file", "created")]);
		tree(target.path(), &[("foo", "original")]);
		let ls = laid_out_with_content(
			staging.path(),
			&[("foo", "foo"), ("fresh/", "fresh")],
			&[],
		);
		let up = updater(&ls, rollback.path(), target.path());

		up.backup()?;
		let backup_root = rollback.path().join("struct-0");
		assert_eq!(fs::read(backup_root.join("foo.backup"))?, b"original");
		// No stamps for files that did not exist.
		assert!(!backup_root.join("fresh/sub/file.backup").exists());

		up.update()?;
		assert_eq!(fs::read(target.path().join("foo"))?, b"new");
		assert_eq!(fs::read(target.path().join("fresh/sub/file"))?, b"created");

		up.rollback()?;
		assert_eq!(fs::read(target.path().join("foo"))?, b"original");
		// Created files and directories are gone again.
		assert!(!target.path().join("fresh").exists());
		Ok(())
	}

	#[test]
	fn test_backup_is_idempotent() -> Result<()> {
		let staging = tempfile::tempdir()?;
		let target = tempfile::tempdir()?;
		let rollback = tempfile::tempdir()?;
		tree(staging.path(), &[("foo", "new")]);
		tree(target.path(), &[("foo", "original")]);
		let ls = laid_out_with_content(staging.path(), &[("foo", "foo")], &[]);
		let up = updater(&ls, rollback.path(), target.path());
		up.backup()?;
		let list = |root: &Path| -> Vec<String> {
			let mut v: Vec<String> = walkdir::WalkDir::new(root)
				.into_iter()
				.filter_map(|e| e.ok())
				.filter(|e| e.file_type().is_file())
				.map(|e| e.path().strip_prefix(root).unwrap().display().to_string())
				.collect();
			v.sort();
			v
		};
		let first = list(rollback.path());
		let content_first = fs::read(rollback.path().join("struct-0/foo.backup"))?;
		up.backup()?;
		assert_eq!(list(rollback.path()), first);
		assert_eq!(
			fs::read(rollback.path().join("struct-0/foo.backup"))?,
			content_first
		);
		Ok(())
	}

	#[test]
	fn test_update_requires_backup() -> Result<()> {
		let staging = tempfile::tempdir()?;
		let target = tempfile::tempdir()?;
		let rollback = tempfile::tempdir()?;
		tree(staging.path(), &[("foo", "new")]);
		tree(target.path(), &[("foo", "original")]);
		let ls = laid_out_with_content(staging.path(), &[("foo", "foo")], &[]);
		let up = updater(&ls, rollback.path(), target.path());
		let err = up.update().unwrap_err();
		let msg = format!("{:#}", err);
		assert!(
			msg.contains(&format!(
				"missing backup file for '{}'",
				target.path().join("foo").display()
			)),
			"unexpected error: {}",
			msg
		);
		Ok(())
	}

	#[test]
	fn test_same_content_short_circuits() -> Result<()> {
		let staging = tempfile::tempdir()?;
		let target = tempfile::tempdir()?;
		let rollback = tempfile::tempdir()?;
		tree(staging.path(), &[("foo", "same bytes")]);
		tree(target.path(), &[("foo", "same bytes")]);
		let ls = laid_out_with_content(staging.path(), &[("foo", "foo")], &[]);
		let up = updater(&ls, rollback.path(), target.path());
		up.backup()?;
		let backup_root = rollback.path().join("struct-0");
		assert!(backup_root.join("foo.same").exists());
		assert!(!backup_root.join("foo.backup").exists());

		let err = up.update().unwrap_err();
		assert!(is_no_update(&err));
		// Rollback leaves the file alone.
		up.rollback()?;
		assert_eq!(fs::read(target.path().join("foo"))?, b"same bytes");
		Ok(())
	}

	#[test]
	fn test_preserved_files_stay_untouched() -> Result<()> {
		let staging = tempfile::tempdir()?;
		let target = tempfile::tempdir()?;
		let rollback = tempfile::tempdir()?;
		tree(
			staging.path(),
			&[("foo", "new"), ("nested-copy/nested", "new"), ("other", "new")],
		);
		tree(
			target.path(),
			&[("foo", "user"), ("nested-copy/nested", "user"), ("other", "old")],
		);
		let ls = laid_out_with_content(
			staging.path(),
			&[("foo", "foo"), ("nested-copy/", "nested-copy"), ("other", "other")],
			&["foo", "nested-copy/nested"],
		);
		let up = updater(&ls, rollback.path(), target.path());
		up.backup()?;
		let backup_root = rollback.path().join("struct-0");
		assert!(backup_root.join("foo.preserve").exists());
		assert!(backup_root.join("nested-copy/nested.preserve").exists());
		// Preserved files never get byte copies.
		assert!(!backup_root.join("foo.backup").exists());
		assert!(!backup_root.join("nested-copy/nested.backup").exists());

		up.update()?;
		assert_eq!(fs::read(target.path().join("foo"))?, b"user");
		assert_eq!(fs::read(target.path().join("nested-copy/nested"))?, b"user");
		assert_eq!(fs::read(target.path().join("other"))?, b"new");

		up.rollback()?;
		assert_eq!(fs::read(target.path().join("foo"))?, b"user");
		assert_eq!(fs::read(target.path().join("other"))?, b"old");
		Ok(())
	}

	#[test]
	fn test_symlinks_are_rejected_by_updater() -> Result<()> {
		let staging = tempfile::tempdir()?;
		let target = tempfile::tempdir()?;
		let rollback = tempfile::tempdir()?;
		tree(staging.path(), &[("assets/real", "x")]);
		symlink("real", staging.path().join("assets/link"))?;
		let ls = laid_out_with_content(staging.path(), &[("assets/", "assets")], &[]);
		let up = updater(&ls, rollback.path(), target.path());
		let err = up.backup().unwrap_err();
		assert!(format!("{:#}", err).contains("symbolic links are not supported"));
		Ok(())
	}

	#[test]
	fn test_unresolved_mount_fails_only_when_used() -> Result<()> {
		let staging = tempfile::tempdir()?;
		let rollback = tempfile::tempdir()?;
		tree(staging.path(), &[("foo", "new")]);
		let ls = laid_out_with_content(staging.path(), &[("foo", "foo")], &[]);
		let up = MountedFilesystemUpdater::new(
			&ls,
			rollback.path(),
			Err("no cleartext device for encrypted structure".to_owned()),
			None,
		)?;
		let err = up.backup().unwrap_err();
		assert!(format!("{:#}", err).contains("no cleartext device"));
		Ok(())
	}

	struct RecordingObserver {
		seen: std::cell::RefCell<Vec<(ContentOperation, PathBuf)>>,
		action: ContentChangeAction,
	}

	impl ContentObserver for RecordingObserver {
		fn observe(
			&self,
			op: ContentOperation,
			_structure: &LaidOutStructure,
			_root: &Path,
			rel: &Path,
			_change: &ContentChange,
		) -> Result<ContentChangeAction> {
			self.seen.borrow_mut().push((op, rel.to_path_buf()));
			Ok(self.action)
		}
	}

	#[test]
	fn test_observer_can_ignore_changes() -> Result<()> {
		let staging = tempfile::tempdir()?;
		let target = tempfile::tempdir()?;
		let rollback = tempfile::tempdir()?;
		tree(staging.path(), &[("foo", "new")]);
		tree(target.path(), &[("foo", "original")]);
		let ls = laid_out_with_content(staging.path(), &[("foo", "foo")], &[]);
		let observer = RecordingObserver {
			seen: Default::default(),
			action: ContentChangeAction::Ignore,
		};
		let up = MountedFilesystemUpdater::new(
			&ls,
			rollback.path(),
			Ok(target.path().to_path_buf()),
			Some(&observer),
		)?;
		up.backup()?;
		up.update()?;
		// The change was observed but not applied.
		assert_eq!(fs::read(target.path().join("foo"))?, b"original");
		assert_eq!(observer.seen.borrow().len(), 1);
		assert_eq!(observer.seen.borrow()[0].0, ContentOperation::Update);
		Ok(())
	}

	#[test]
	fn test_observer_can_abort() -> Result<()> {
		let staging = tempfile::tempdir()?;
		let target = tempfile::tempdir()?;
		let rollback = tempfile::tempdir()?;
		tree(staging.path(), &[("foo", "new")]);
		tree(target.path(), &[("foo", "original")]);
		let ls = laid_out_with_content(staging.path(), &[("foo", "foo")], &[]);
		let observer = RecordingObserver {
			seen: Default::default(),
			action: ContentChangeAction::Abort,
		};
		let up = MountedFilesystemUpdater::new(
			&ls,
			rollback.path(),
			Ok(target.path().to_path_buf()),
			Some(&observer),
		)?;
		up.backup()?;
		let err = up.update().unwrap_err();
		assert!(format!("{:#}", err).contains("aborted by the observer"));
		assert_eq!(fs::read(target.path().join("foo"))?, b"original");
		Ok(())
	}
}
