//! Kernel asset manifest and `$kernel:` content references.
//!
//! A kernel tree ships a `kernel.toml` describing named assets:
//!
//! ```toml
//! [assets.dtbs]
//! update = true
//! content = ["dtbs/"]
//! ```
//!
//! Gadget content entries may pull files out of those assets with sources
//! of the form `$kernel:<asset>/<path>`; the layout step resolves them to
//! staged paths under the kernel root.

use std::{
	collections::BTreeMap,
	fs,
	path::{Path, PathBuf},
	sync::OnceLock,
};

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::Deserialize;

use crate::gadget::GadgetSpec;

/// The conventional name of the kernel manifest within a kernel directory.
pub const KERNEL_MANIFEST: &str = "kernel.toml";

const KERNEL_REF_PREFIX: &str = "$kernel:";

fn asset_name_re() -> &'static Regex {
	static RE: OnceLock<Regex> = OnceLock::new();
	RE.get_or_init(|| Regex::new("^[a-zA-Z0-9][a-zA-Z0-9-]*$").unwrap())
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct KernelAsset {
	#[serde(default)]
	pub edition: u32,
	/// Whether a kernel refresh must push this asset into the gadget
	/// structures that consume it.
	#[serde(default)]
	pub update: bool,
	pub content: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct KernelInfo {
	#[serde(default)]
	pub assets: BTreeMap<String, KernelAsset>,
}

impl KernelInfo {
	pub fn from_toml(content: &str) -> Result<Self> {
		let info: KernelInfo =
			toml::from_str(content).context("unable to parse the kernel manifest")?;
		info.check()?;
		Ok(info)
	}

	pub fn from_path(file: &Path) -> Result<Self> {
		let content = fs::read_to_string(file)
			.with_context(|| format!("unable to read '{}'", file.display()))?;
		Self::from_toml(&content)
			.with_context(|| format!("invalid kernel manifest '{}'", file.display()))
	}

	pub fn from_dir(root: &Path) -> Result<Self> {
		Self::from_path(&root.join(KERNEL_MANIFEST))
	}

	pub fn check(&self) -> Result<()> {
		for (name, asset) in &self.assets {
			if !asset_name_re().is_match(name) {
				bail!("invalid kernel asset name \"{}\"", name);
			}
			if asset.content.is_empty() {
				bail!("kernel asset \"{}\" has no content", name);
			}
			for entry in &asset.content {
				if entry.is_empty() || Path::new(entry).is_absolute() {
					bail!(
						"kernel asset \"{}\" content entry {:?} must be a relative path",
						name,
						entry
					);
				}
			}
		}
		Ok(())
	}

	/// Resolve a parsed `$kernel:` reference to the staged file below the
	/// kernel root. The referenced path must be covered by one of the
	/// asset's declared content entries.
	pub fn resolve_ref(&self, kernel_root: &Path, kref: &KernelRef) -> Result<(PathBuf, bool)> {
		let asset = self.assets.get(&kref.asset).with_context(|| {
			format!("kernel does not define asset \"{}\"", kref.asset)
		})?;
		let covered = asset.content.iter().any(|entry| {
			if let Some(dir) = entry.strip_suffix('/') {
				kref.path == *entry
					|| kref.path.trim_end_matches('/') == dir
					|| kref.path.starts_with(entry)
			} else {
				kref.path.trim_end_matches('/') == *entry
					|| kref.path.starts_with(&format!("{}/", entry))
			}
		});
		if !covered {
			bail!(
				"kernel asset \"{}\" does not contain \"{}\"",
				kref.asset,
				kref.path
			);
		}
		Ok((kernel_root.join(&kref.path), asset.update))
	}

	/// Names of assets flagged `update = true`.
	pub fn update_asset_names(&self) -> Vec<&str> {
		self.assets
			.iter()
			.filter(|(_, a)| a.update)
			.map(|(n, _)| n.as_str())
			.collect()
	}
}

/// A parsed `$kernel:<asset>/<path>` content source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KernelRef {
	pub asset: String,
	pub path: String,
}

/// Split a content source into a kernel reference, or return `None` for a
/// plain gadget-relative source.
pub fn parse_kernel_ref(source: &str) -> Result<Option<KernelRef>> {
	let Some(rest) = source.strip_prefix(KERNEL_REF_PREFIX) else {
		return Ok(None);
	};
	let Some((asset, path)) = rest.split_once('/') else {
		bail!(
			"invalid kernel reference {:?}: expected $kernel:<asset>/<path>",
			source
		);
	};
	if asset.is_empty() || !asset_name_re().is_match(asset) {
		bail!("invalid asset name in kernel reference {:?}", source);
	}
	if path.is_empty() {
		bail!("missing path in kernel reference {:?}", source);
	}
	// The path must already be in normal form; anything that normalizes
	// differently (.., ., //, absolute) is refused rather than cleaned up.
	let trimmed = path.trim_end_matches('/');
	let normal = !trimmed.is_empty()
		&& !path.starts_with('/')
		&& !path.contains("//")
		&& trimmed.split('/').all(|seg| !seg.is_empty() && seg != "." && seg != "..");
	if !normal {
		bail!("invalid path in kernel reference {:?}", source);
	}
	Ok(Some(KernelRef {
		asset: asset.to_owned(),
		path: path.to_owned(),
	}))
}

/// Every kernel asset marked `update = true` must be consumed by at least
/// one structure somewhere in the gadget's volume set.
pub fn ensure_update_assets_referenced(gadget: &GadgetSpec, kernel: &KernelInfo) -> Result<()> {
	let mut missing: Vec<&str> = Vec::new();
	'asset: for name in kernel.update_asset_names() {
		for volume in gadget.volumes.values() {
			for vs in &volume.structure {
				for content in &vs.content {
					if let Some(source) = &content.source {
						if let Ok(Some(kref)) = parse_kernel_ref(source) {
							if kref.asset == name {
								continue 'asset;
							}
						}
					}
				}
			}
		}
		missing.push(name);
	}
	if !missing.is_empty() {
		bail!(
			"gadget does not consume any content of the updatable kernel assets: {}",
			missing.join(", ")
		);
	}
	Ok(())
}
