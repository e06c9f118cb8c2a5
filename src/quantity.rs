//! Byte quantities used throughout the volume layout code.
//!
//! Offsets and sizes are always byte counts. Sector arithmetic happens at
//! well-defined places only (LBA conversion, the partition script emitter),
//! everything else stays in bytes.

use std::fmt;

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};

/// Default logical sector size of the devices we operate on.
pub const SECTOR_SIZE: u64 = 512;

/// One MiB worth of size.
pub const SIZE_MIB: Size = Size(1 << 20);

/// One MiB worth of offset.
pub const OFFSET_MIB: Offset = Offset(1 << 20);

/// Structures without an explicit offset start at 1 MiB, like nearly every
/// partitioning tool out there, to leave room for bootloaders.
pub const NON_MBR_START_OFFSET: Offset = OFFSET_MIB;

/// A size in bytes.
#[derive(
	Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Size(pub u64);

/// An absolute position in bytes within a volume or a device.
#[derive(
	Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Offset(pub u64);

impl Size {
	pub fn bytes(self) -> u64 {
		self.0
	}

	pub fn is_multiple_of(self, n: u64) -> bool {
		n != 0 && self.0 % n == 0
	}

	pub fn checked_add(self, other: Size) -> Result<Size> {
		self.0
			.checked_add(other.0)
			.map(Size)
			.ok_or_else(|| anyhow!("size {} + {} overflows", self.0, other.0))
	}
}

impl Offset {
	pub fn bytes(self) -> u64 {
		self.0
	}

	pub fn checked_add(self, size: Size) -> Result<Offset> {
		self.0
			.checked_add(size.0)
			.map(Offset)
			.ok_or_else(|| anyhow!("offset {} + {} overflows", self.0, size.0))
	}

	/// Convert to a logical block address. The partition table formats we
	/// write carry LBA pointers as 32-bit little-endian values, so an
	/// address that does not fit 32 bits is an error, not a truncation.
	pub fn to_lba(self, sector_size: u64) -> Result<u32> {
		if sector_size == 0 {
			bail!("sector size must not be zero");
		}
		let lba = self.0 / sector_size;
		u32::try_from(lba).map_err(|_| {
			anyhow!(
				"offset {} ({} sectors) does not fit a 32-bit LBA",
				self.0,
				lba
			)
		})
	}
}

/// A location outside of its allowed range, as reported when positioning
/// offset-write pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidOffsetError {
	pub offset: u64,
	pub lower: u64,
	pub upper: u64,
}

impl fmt::Display for InvalidOffsetError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"offset {} is not within the valid range [{}, {})",
			self.offset, self.lower, self.upper
		)
	}
}

impl std::error::Error for InvalidOffsetError {}

fn iec(bytes: u64, f: &mut fmt::Formatter<'_>) -> fmt::Result {
	const SUFFIXES: &[&str] = &["KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];
	if bytes < 1024 {
		return write!(f, "{} B", bytes);
	}
	let mut value = bytes as f64;
	let mut suffix = 0;
	while value >= 1024.0 && suffix < SUFFIXES.len() - 1 {
		value /= 1024.0;
		suffix += 1;
	}
	write!(f, "{:.2} {}", value, SUFFIXES[suffix])
}

impl fmt::Display for Size {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		iec(self.0, f)
	}
}

impl fmt::Display for Offset {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		iec(self.0, f)
	}
}
