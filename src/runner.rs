//! Dispatch of external partitioning and filesystem tooling.
//!
//! Everything that shells out goes through the [`Runner`] trait so that
//! tests can substitute canned outputs for sfdisk, lsblk and friends.

use std::{
	io::Write,
	process::{Command, Stdio},
};

use anyhow::{anyhow, Context, Result};
use log::debug;
use serde::de::DeserializeOwned;

pub trait Runner {
	/// Run a command, requiring a successful exit status.
	fn run(&self, program: &str, args: &[&str]) -> Result<()>;

	/// Run a command and capture its stdout, requiring success.
	fn output(&self, program: &str, args: &[&str]) -> Result<Vec<u8>>;

	/// Run a command feeding `input` to its stdin, requiring success.
	fn feed(&self, program: &str, args: &[&str], input: &[u8]) -> Result<()>;
}

/// Runs commands on the host.
pub struct HostRunner;

fn check_status(cmd: &Command, status: std::process::ExitStatus) -> Result<()> {
	if status.success() {
		Ok(())
	} else if let Some(c) = status.code() {
		Err(anyhow!(
			"The following command failed with exit code {}:\n{:?}",
			c,
			cmd
		))
	} else {
		Err(anyhow!("The following command exited abnormally:\n{:?}", cmd))
	}
}

impl Runner for HostRunner {
	fn run(&self, program: &str, args: &[&str]) -> Result<()> {
		let mut cmd = Command::new(program);
		cmd.args(args);
		debug!("Running command {:?} ...", cmd);
		let status = cmd
			.status()
			.with_context(|| format!("Failed to run {}", program))?;
		check_status(&cmd, status)
	}

	fn output(&self, program: &str, args: &[&str]) -> Result<Vec<u8>> {
		let mut cmd = Command::new(program);
		cmd.args(args).stdout(Stdio::piped());
		debug!("Running command {:?} ...", cmd);
		let out = cmd
			.output()
			.with_context(|| format!("Failed to run {}", program))?;
		check_status(&cmd, out.status)?;
		Ok(out.stdout)
	}

	fn feed(&self, program: &str, args: &[&str], input: &[u8]) -> Result<()> {
		let mut cmd = Command::new(program);
		cmd.args(args).stdin(Stdio::piped());
		debug!("Running command {:?} ...", cmd);
		let mut child = cmd
			.spawn()
			.with_context(|| format!("Failed to run {}", program))?;
		child
			.stdin
			.as_mut()
			.with_context(|| format!("Failed to open stdin of {}", program))?
			.write_all(input)?;
		let status = child.wait()?;
		check_status(&cmd, status)
	}
}

/// Run a command and parse its stdout as JSON.
pub fn output_json<T: DeserializeOwned>(
	runner: &dyn Runner,
	program: &str,
	args: &[&str],
) -> Result<T> {
	let out = runner.output(program, args)?;
	serde_json::from_slice(&out)
		.with_context(|| format!("unable to parse the output of {} as JSON", program))
}

#[cfg(test)]
pub mod testing {
	//! A scripted runner for tests: canned stdout per program name.

	use std::{cell::RefCell, collections::HashMap};

	use anyhow::{anyhow, Result};

	use super::Runner;

	/// Outputs are queued per program; once a queue runs dry its last
	/// entry keeps being served, so a single canned output works for
	/// repeated calls.
	#[derive(Default)]
	pub struct FakeRunner {
		outputs: HashMap<String, Vec<Vec<u8>>>,
		served: RefCell<HashMap<String, usize>>,
		pub calls: RefCell<Vec<String>>,
	}

	impl FakeRunner {
		pub fn with_output(mut self, program: &str, output: &[u8]) -> Self {
			self.outputs
				.entry(program.to_owned())
				.or_default()
				.push(output.to_vec());
			self
		}

		fn record(&self, program: &str, args: &[&str]) {
			self.calls
				.borrow_mut()
				.push(format!("{} {}", program, args.join(" ")));
		}
	}

	impl Runner for FakeRunner {
		fn run(&self, program: &str, args: &[&str]) -> Result<()> {
			self.record(program, args);
			Ok(())
		}

		fn output(&self, program: &str, args: &[&str]) -> Result<Vec<u8>> {
			self.record(program, args);
			let queue = self
				.outputs
				.get(program)
				.ok_or_else(|| anyhow!("no canned output for {}", program))?;
			let mut served = self.served.borrow_mut();
			let idx = served.entry(program.to_owned()).or_insert(0);
			let out = queue[(*idx).min(queue.len() - 1)].clone();
			*idx += 1;
			Ok(out)
		}

		fn feed(&self, program: &str, args: &[&str], input: &[u8]) -> Result<()> {
			self.record(program, args);
			self.calls
				.borrow_mut()
				.push(format!("<stdin> {}", String::from_utf8_lossy(input)));
			Ok(())
		}
	}
}
