use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{error, info, warn};
use owo_colors::OwoColorize;

use gadgetimg::{
	cli::{Action, Cmdline},
	gadget::GadgetSpec,
	image,
	kernel::{ensure_update_assets_referenced, KernelInfo},
	layout::{layout_volume, layout_volume_partially, LaidOutVolume, LayoutConstraints},
	lookup::{
		find_device_for_structure_with_fallback, find_mount_point_for_structure, LookupEnv,
	},
	runner::HostRunner,
	update::{is_no_update, is_update_skipped, GadgetData, UpdateOptions},
};

fn main() -> Result<()> {
	let cmdline = Cmdline::try_parse()?;
	match &cmdline.action {
		Action::Build { .. } | Action::Update { .. } => {
			if unsafe { libc::geteuid() } != 0 {
				bail!("Please run me as root!");
			}
		}
		_ => (),
	}
	let mut logger = colog::basic_builder();
	if cmdline.debug {
		logger.filter(None, log::LevelFilter::Debug);
	} else {
		logger.filter(None, log::LevelFilter::Info);
	}
	logger.init();
	if let Err(e) = try_main(cmdline) {
		// Use the logger to pretty-print the error chain.
		let mut str_buf = String::new();
		error!("Error encountered!\n{}", e);
		let mut ident = 0;
		e.chain().skip(1).for_each(|cause| {
			let ident_str = "\t".repeat(ident);
			ident += 1;
			str_buf += &format!("{0}- Caused by:\n{0}  {1}\n", ident_str, cause);
		});
		if !str_buf.is_empty() {
			error!("{}", str_buf);
		}
		error!("Exiting now.");
		std::process::exit(1);
	}
	Ok(())
}

fn load_gadget(dir: &Path) -> Result<GadgetSpec> {
	if !dir.is_dir() {
		bail!("gadget directory '{}' does not exist", dir.display());
	}
	GadgetSpec::from_dir(dir)
}

fn load_kernel(dir: Option<&PathBuf>) -> Result<Option<KernelInfo>> {
	match dir {
		Some(dir) => Ok(Some(KernelInfo::from_dir(dir)?)),
		None => Ok(None),
	}
}

fn layout_all(
	gadget: &GadgetSpec,
	gadget_dir: &Path,
	kernel_dir: Option<&PathBuf>,
	kernel: Option<&KernelInfo>,
	only: Option<&String>,
) -> Result<Vec<LaidOutVolume>> {
	let mut laid_out = Vec::new();
	for (name, volume) in &gadget.volumes {
		if let Some(only) = only {
			if name != only {
				continue;
			}
		}
		let lv = layout_volume(
			volume,
			gadget_dir,
			kernel_dir.map(|p| p.as_path()),
			kernel,
			&LayoutConstraints::default(),
		)
		.with_context(|| format!("cannot lay out volume '{}'", name))?;
		laid_out.push(lv);
	}
	if laid_out.is_empty() {
		if let Some(only) = only {
			bail!("volume '{}' is not defined in the gadget", only);
		}
	}
	Ok(laid_out)
}

fn try_main(cmdline: Cmdline) -> Result<()> {
	match cmdline.action {
		Action::Check { gadget, kernel } => {
			let spec = load_gadget(&gadget)?;
			let kernel_info = load_kernel(kernel.as_ref())?;
			if let Some(kernel_info) = &kernel_info {
				ensure_update_assets_referenced(&spec, kernel_info)?;
			}
			// A full layout exercises content resolution too.
			layout_all(&spec, &gadget, kernel.as_ref(), kernel_info.as_ref(), None)?;
			for name in spec.volumes.keys() {
				info!("PASS: volume '{}'", name.bright_cyan());
			}
		}
		Action::Layout {
			gadget,
			kernel,
			volume,
		} => {
			let spec = load_gadget(&gadget)?;
			let kernel_info = load_kernel(kernel.as_ref())?;
			let laid_out = layout_all(
				&spec,
				&gadget,
				kernel.as_ref(),
				kernel_info.as_ref(),
				volume.as_ref(),
			)?;
			for lv in &laid_out {
				println!(
					"volume {} ({}, {}):",
					lv.volume.name.bright_cyan(),
					lv.volume.schema.to_string().to_lowercase(),
					lv.size
				);
				for ls in &lv.structures {
					println!(
						"  #{} {:<16} start {:>10}  size {:>10}  {}",
						ls.yaml_index,
						ls.name(),
						ls.start_offset.to_string(),
						ls.structure.size.to_string(),
						ls.structure.part_type
					);
					for lc in &ls.content {
						println!(
							"       content #{} {:?} at {}, {}",
							lc.index,
							lc.content.image.as_deref().unwrap_or(""),
							lc.start_offset,
							lc.size
						);
					}
				}
			}
		}
		Action::Build {
			gadget,
			kernel,
			volume,
			outdir,
			workdir,
		} => {
			let spec = load_gadget(&gadget)?;
			let kernel_info = load_kernel(kernel.as_ref())?;
			if let Some(kernel_info) = &kernel_info {
				ensure_update_assets_referenced(&spec, kernel_info)?;
			}
			let laid_out = layout_all(
				&spec,
				&gadget,
				kernel.as_ref(),
				kernel_info.as_ref(),
				volume.as_ref(),
			)?;
			std::fs::create_dir_all(&outdir)?;
			std::fs::create_dir_all(&workdir)?;
			let runner = HostRunner;
			for lv in &laid_out {
				let img_path = outdir.join(format!("{}.img", lv.volume.name));
				let work = workdir.join(&lv.volume.name);
				image::write_volume_image(&runner, lv, &gadget, &img_path, &work)?;
				info!("Wrote '{}'", img_path.display());
			}
		}
		Action::Identify { gadget, volume } => {
			let spec = load_gadget(&gadget)?;
			// Only placement matters here; the staged content (and any
			// kernel it references) is not needed to find devices.
			let mut laid_out = Vec::new();
			for (name, vol) in &spec.volumes {
				if let Some(only) = &volume {
					if name != only {
						continue;
					}
				}
				let lv = layout_volume_partially(vol, &LayoutConstraints::default())
					.with_context(|| format!("cannot lay out volume '{}'", name))?;
				laid_out.push(lv);
			}
			let env = LookupEnv::default();
			for lv in &laid_out {
				for ls in &lv.structures {
					match find_device_for_structure_with_fallback(&env, ls) {
						Ok((device, offset)) => println!(
							"{}/{}: device {} (offset {})",
							lv.volume.name,
							ls.name(),
							device.display(),
							offset.bytes()
						),
						Err(e) => println!("{}/{}: {:#}", lv.volume.name, ls.name(), e),
					}
					if ls.structure.has_filesystem() {
						match find_mount_point_for_structure(&env, &ls.structure) {
							Ok(mount) => println!(
								"{}/{}: mounted at {}",
								lv.volume.name,
								ls.name(),
								mount.display()
							),
							Err(e) => println!(
								"{}/{}: {:#}",
								lv.volume.name,
								ls.name(),
								e
							),
						}
					}
				}
			}
		}
		Action::Update {
			old,
			new,
			kernel,
			rollback_dir,
			policy,
			state_dir,
			tolerate_unresolved,
		} => {
			let kernel_info = load_kernel(kernel.as_ref())?;
			let old_data = GadgetData {
				gadget: load_gadget(&old)?,
				root_dir: old.clone(),
				kernel_root: kernel.clone(),
				kernel_info: kernel_info.clone(),
			};
			let new_data = GadgetData {
				gadget: load_gadget(&new)?,
				root_dir: new.clone(),
				kernel_root: kernel.clone(),
				kernel_info,
			};
			std::fs::create_dir_all(&rollback_dir)?;
			let runner = HostRunner;
			let opts = UpdateOptions {
				policy: policy.into(),
				observer: None,
				locator: None,
				state_dir,
				lookup_env: LookupEnv::default(),
				runner: &runner,
				tolerate_unresolved_devices: tolerate_unresolved,
			};
			match gadgetimg::update::update(&old_data, &new_data, &rollback_dir, &opts) {
				Ok(()) => info!("Gadget assets updated."),
				Err(e) if is_no_update(&e) => info!("Nothing to update."),
				Err(e) if is_update_skipped(&e) => {
					warn!("Update skipped: volumes are not mapped to disks.")
				}
				Err(e) => return Err(e),
			}
		}
	}
	Ok(())
}
