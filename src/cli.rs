//! Module defining the command line usage.
//!
//! Available subcommands
//! ---------------------
//!
//! - `check`: validate a gadget directory (and optionally a kernel tree).
//! - `layout`: print the resolved layout of the gadget's volumes.
//! - `build`: write raw images for the gadget's volumes.
//! - `identify`: map gadget structures to block devices and mount points
//!   on the running system.
//! - `update`: apply an asset update from an old gadget tree to a new
//!   one, with backup and rollback.
use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand, ValueEnum};

use crate::update::UpdatePolicy;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum PolicyArg {
	/// Update structures whose edition was bumped.
	#[default]
	Edition,
	/// Update everything except the legacy MBR structure.
	Remodel,
	/// Update only kernel-asset content.
	Kernel,
}

impl From<PolicyArg> for UpdatePolicy {
	fn from(arg: PolicyArg) -> Self {
		match arg {
			PolicyArg::Edition => UpdatePolicy::Edition,
			PolicyArg::Remodel => UpdatePolicy::Remodel,
			PolicyArg::Kernel => UpdatePolicy::Kernel,
		}
	}
}

#[derive(Parser)]
#[command(version, about, long_about = None)]
pub struct Cmdline {
	/// Turns on debug output.
	#[arg(long, action = ArgAction::SetTrue)]
	pub debug: bool,
	/// The action to take.
	#[command(subcommand)]
	pub action: Action,
}

#[derive(Subcommand)]
pub enum Action {
	/// Check the validity of a gadget directory.
	Check {
		/// Path to the gadget directory (containing gadget.toml).
		gadget: PathBuf,

		/// Path to a staged kernel tree (containing kernel.toml).
		#[arg(short, long)]
		kernel: Option<PathBuf>,
	},
	/// Print the resolved layout of the gadget's volumes.
	Layout {
		/// Path to the gadget directory.
		gadget: PathBuf,

		/// Path to a staged kernel tree.
		#[arg(short, long)]
		kernel: Option<PathBuf>,

		/// Lay out only this volume.
		#[arg(short = 'V', long)]
		volume: Option<String>,
	},
	/// Build raw images for the gadget's volumes.
	Build {
		/// Path to the gadget directory.
		gadget: PathBuf,

		/// Path to a staged kernel tree.
		#[arg(short, long)]
		kernel: Option<PathBuf>,

		/// Build only this volume.
		#[arg(short = 'V', long)]
		volume: Option<String>,

		/// Output directory.
		#[arg(short = 'O', long, default_value = "./out")]
		outdir: PathBuf,

		/// Working directory for staging and per-structure images.
		#[arg(short = 'D', long, default_value = "./work")]
		workdir: PathBuf,
	},
	/// Map gadget structures to devices and mount points.
	Identify {
		/// Path to the gadget directory.
		gadget: PathBuf,

		/// Identify only this volume.
		#[arg(short = 'V', long)]
		volume: Option<String>,
	},
	/// Update gadget assets from an old to a new gadget tree.
	Update {
		/// Path to the old (currently installed) gadget directory.
		old: PathBuf,

		/// Path to the new gadget directory.
		new: PathBuf,

		/// Path to the staged kernel tree referenced by the gadgets.
		#[arg(short, long)]
		kernel: Option<PathBuf>,

		/// Directory to keep backups in until the update commits.
		#[arg(short, long, default_value = "./rollback")]
		rollback_dir: PathBuf,

		/// Update policy.
		#[arg(short, long, value_enum, default_value_t)]
		policy: PolicyArg,

		/// Directory holding the persisted volume-to-disk mapping.
		#[arg(long, default_value = "/var/lib/gadgetimg")]
		state_dir: PathBuf,

		/// Skip the update instead of failing when the volumes cannot be
		/// mapped to disks.
		#[arg(long, action = ArgAction::SetTrue)]
		tolerate_unresolved: bool,
	},
}
