//! Small filesystem helpers shared by the writers and updaters.

use std::{
	fs::{self, DirBuilder, File},
	io::{self, Read, Seek, Write},
	os::unix::fs::{DirBuilderExt, PermissionsExt},
	path::Path,
};

use anyhow::{anyhow, Context, Result};
use log::debug;
use sha1::{Digest, Sha1};

/// Create a sparse file with the specified size in bytes.
pub fn get_sparse_file<P: AsRef<Path>>(path: P, size: u64) -> Result<File> {
	let img_path = path.as_ref();
	debug!(
		"Creating sparse file at '{}' with size {} bytes ...",
		img_path.display(),
		size
	);
	let mut img_file = File::options()
		.write(true)
		.create(true)
		.truncate(true)
		.open(img_path)
		.with_context(|| format!("Error creating raw image file '{}'", img_path.display()))?;
	if size > 0 {
		// Seek past the end and write a single zero to punch the hole.
		img_file.seek(io::SeekFrom::Start(size - 1))?;
		img_file.write_all(&[0]).context(
			"Failed to punch hole for sparse file. Does your filesystem support sparse files?",
		)?;
	}
	img_file.sync_all()?;
	Ok(img_file)
}

pub fn create_sparse_file<P: AsRef<Path>>(path: P, size: u64) -> Result<()> {
	get_sparse_file(path, size)?;
	Ok(())
}

/// Create a directory and any missing parents with mode 0755.
pub fn mkdir_p(path: &Path) -> Result<()> {
	DirBuilder::new()
		.recursive(true)
		.mode(0o755)
		.create(path)
		.with_context(|| format!("cannot create directory '{}'", path.display()))
}

/// Write a file atomically: the content lands under a temporary name and
/// is renamed into place, so a crash leaves either no file or a complete
/// one. Mode is 0644.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
	let dir = path
		.parent()
		.ok_or_else(|| anyhow!("'{}' has no parent directory", path.display()))?;
	let file_name = path
		.file_name()
		.ok_or_else(|| anyhow!("'{}' has no file name", path.display()))?;
	let tmp_path = dir.join(format!(".{}.tmp", file_name.to_string_lossy()));
	let mut tmp = File::create(&tmp_path)
		.with_context(|| format!("cannot create '{}'", tmp_path.display()))?;
	tmp.set_permissions(fs::Permissions::from_mode(0o644))?;
	tmp.write_all(data)?;
	tmp.sync_all()?;
	drop(tmp);
	fs::rename(&tmp_path, path)
		.with_context(|| format!("cannot commit '{}'", path.display()))?;
	Ok(())
}

/// Copy a file, preserving its permissions, and sync the result.
pub fn copy_file_synced(src: &Path, dst: &Path) -> Result<()> {
	let mut from = File::open(src).with_context(|| format!("cannot open '{}'", src.display()))?;
	let mut to = File::options()
		.write(true)
		.create(true)
		.truncate(true)
		.open(dst)
		.with_context(|| format!("cannot create '{}'", dst.display()))?;
	io::copy(&mut from, &mut to)?;
	let mode = from.metadata()?.permissions();
	to.set_permissions(mode)?;
	to.sync_all()?;
	Ok(())
}

/// Stream `reader` to `writer`, returning the number of bytes copied and
/// the hex SHA-1 of the copied data.
pub fn copy_and_hash<R: Read, W: Write>(reader: &mut R, writer: &mut W) -> Result<(u64, String)> {
	let mut hasher = Sha1::new();
	let mut buf = [0u8; 64 * 1024];
	let mut total: u64 = 0;
	loop {
		let n = reader.read(&mut buf)?;
		if n == 0 {
			break;
		}
		hasher.update(&buf[..n]);
		writer.write_all(&buf[..n])?;
		total += n as u64;
	}
	Ok((total, hex::encode(hasher.finalize())))
}

/// Hex SHA-1 of a file's content.
pub fn file_digest(path: &Path) -> Result<String> {
	let mut f = File::open(path).with_context(|| format!("cannot open '{}'", path.display()))?;
	let (_, digest) = copy_and_hash(&mut f, &mut io::sink())?;
	Ok(digest)
}

/// Hex SHA-1 of a file's content as it would appear written into a region
/// of `region_size` bytes, i.e. padded with zeros. Errors if the file is
/// larger than the region.
pub fn padded_file_digest(path: &Path, region_size: u64) -> Result<String> {
	let mut f = File::open(path).with_context(|| format!("cannot open '{}'", path.display()))?;
	let mut hasher = Sha1::new();
	let mut buf = [0u8; 64 * 1024];
	let mut total: u64 = 0;
	loop {
		let n = f.read(&mut buf)?;
		if n == 0 {
			break;
		}
		total += n as u64;
		if total > region_size {
			return Err(anyhow!(
				"content of '{}' does not fit in {} bytes",
				path.display(),
				region_size
			));
		}
		hasher.update(&buf[..n]);
	}
	let zeros = [0u8; 64 * 1024];
	let mut remaining = region_size - total;
	while remaining > 0 {
		let n = remaining.min(zeros.len() as u64) as usize;
		hasher.update(&zeros[..n]);
		remaining -= n as u64;
	}
	Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_sparse_file() -> Result<()> {
		let tmp = tempfile::tempdir()?;
		let path = tmp.path().join("sparse.img");
		create_sparse_file(&path, 1 << 20)?;
		assert_eq!(fs::metadata(&path)?.len(), 1 << 20);
		Ok(())
	}

	#[test]
	fn test_atomic_write() -> Result<()> {
		let tmp = tempfile::tempdir()?;
		let path = tmp.path().join("stamp");
		atomic_write(&path, b"")?;
		assert_eq!(fs::read(&path)?, b"");
		assert_eq!(fs::metadata(&path)?.permissions().mode() & 0o777, 0o644);
		atomic_write(&path, b"second")?;
		assert_eq!(fs::read(&path)?, b"second");
		// No leftover temporary files.
		let names: Vec<_> = fs::read_dir(tmp.path())?
			.map(|e| e.unwrap().file_name())
			.collect();
		assert_eq!(names.len(), 1);
		Ok(())
	}

	#[test]
	fn test_digests() -> Result<()> {
		let tmp = tempfile::tempdir()?;
		let path = tmp.path().join("data");
		fs::write(&path, b"abc")?;
		// Well-known SHA-1 of "abc".
		assert_eq!(file_digest(&path)?, "a9993e364706816aba3e25717850c26c9cd0d89d");
		let mut src: &[u8] = b"abc";
		let mut out = Vec::new();
		let (n, digest) = copy_and_hash(&mut src, &mut out)?;
		assert_eq!(n, 3);
		assert_eq!(out, b"abc");
		assert_eq!(digest, "a9993e364706816aba3e25717850c26c9cd0d89d");

		// Padding changes the digest, matching a padded write.
		let padded = padded_file_digest(&path, 8)?;
		let mut hasher = Sha1::new();
		hasher.update(b"abc\0\0\0\0\0");
		assert_eq!(padded, hex::encode(hasher.finalize()));
		assert!(padded_file_digest(&path, 2).is_err());
		Ok(())
	}
}
