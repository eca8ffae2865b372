//! Scenario provisioning: stage, init, apply, then find what apply produced.

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::tool::{ProvisioningTool, ToolStep};
use crate::writer::ChannelWriter;

pub const DEFAULT_CREDENTIAL_EXTENSION: &str = "pem";
pub const DEFAULT_HOST_FILE: &str = "ip_address.txt";

/// What a successful apply leaves behind for the shell bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifacts {
	/// Address of the provisioned host, trimmed.
	pub host: String,
	/// Private key file for the remote shell.
	pub credential: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Pipeline {
	tool: ProvisioningTool,
	scenarios_dir: PathBuf,
	credential_extension: String,
	host_file: String,
}

impl Pipeline {
	pub fn new(tool: ProvisioningTool, scenarios_dir: impl Into<PathBuf>) -> Self {
		Self {
			tool,
			scenarios_dir: scenarios_dir.into(),
			credential_extension: DEFAULT_CREDENTIAL_EXTENSION.to_string(),
			host_file: DEFAULT_HOST_FILE.to_string(),
		}
	}

	pub fn with_credential_extension(mut self, extension: impl Into<String>) -> Self {
		self.credential_extension = extension.into();
		self
	}

	pub fn with_host_file(mut self, name: impl Into<String>) -> Self {
		self.host_file = name.into();
		self
	}

	pub fn tool(&self) -> &ProvisioningTool {
		&self.tool
	}

	/// Names of the scenario directories, sorted. An absent scenarios directory
	/// means no scenarios.
	pub fn scenarios(&self) -> Result<Vec<String>> {
		let entries = match std::fs::read_dir(&self.scenarios_dir) {
			Ok(entries) => entries,
			Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
			Err(err) => return Err(err.into()),
		};
		let mut names = Vec::new();
		for entry in entries {
			let entry = entry?;
			if entry.file_type()?.is_dir() {
				if let Some(name) = entry.file_name().to_str() {
					names.push(name.to_string());
				}
			}
		}
		names.sort();
		Ok(names)
	}

	/// Map a client-supplied scenario name onto its source directory.
	pub fn resolve_scenario(&self, name: &str) -> Result<PathBuf> {
		let plain = !name.is_empty()
			&& name != "."
			&& name != ".."
			&& !name.contains(['/', '\\'])
			&& !name.contains('\0');
		if !plain {
			return Err(Error::UnknownScenario(name.to_string()));
		}
		let dir = self.scenarios_dir.join(name);
		if !dir.is_dir() {
			return Err(Error::UnknownScenario(name.to_string()));
		}
		Ok(dir)
	}

	/// Provision `scenario` into `workdir`, streaming tool output to `output`.
	pub async fn run(&self, scenario: &str, workdir: &Path, output: &ChannelWriter) -> Result<Artifacts> {
		let source = self.scenarios_dir.join(scenario);
		if !source.is_dir() {
			return Err(Error::ScenarioMissing { path: source });
		}

		let target = workdir.to_path_buf();
		let copied = tokio::task::spawn_blocking(move || stage(&source, &target))
			.await
			.map_err(|e| Error::Join(e.to_string()))?
			.map_err(|source| Error::Staging {
				workdir: workdir.to_path_buf(),
				source,
			})?;
		debug!(target = "chaoslab.pipeline", scenario, workdir = %workdir.display(), files = copied, "staged scenario");

		self.tool.run(ToolStep::Init, workdir, Some(output)).await?;
		self.tool.run(ToolStep::Apply, workdir, Some(output)).await?;

		let artifacts = self.discover(workdir).await?;
		info!(
			target = "chaoslab.pipeline",
			scenario,
			host = %artifacts.host,
			credential = %artifacts.credential.display(),
			"scenario provisioned"
		);
		Ok(artifacts)
	}

	async fn discover(&self, workdir: &Path) -> Result<Artifacts> {
		let mut keys = Vec::new();
		let mut entries = tokio::fs::read_dir(workdir).await?;
		while let Some(entry) = entries.next_entry().await? {
			let path = entry.path();
			let matches = path.extension().is_some_and(|ext| ext == self.credential_extension.as_str());
			if matches && entry.file_type().await?.is_file() {
				keys.push(path);
			}
		}
		let credential = match keys.len() {
			0 => {
				return Err(Error::MissingArtifact {
					artifact: "private key",
					workdir: workdir.to_path_buf(),
				});
			}
			1 => keys.remove(0),
			count => {
				return Err(Error::AmbiguousArtifact {
					artifact: "private key",
					workdir: workdir.to_path_buf(),
					count,
				});
			}
		};

		let missing_host = || Error::MissingArtifact {
			artifact: "host address",
			workdir: workdir.to_path_buf(),
		};
		let host = match tokio::fs::read_to_string(workdir.join(&self.host_file)).await {
			Ok(text) => text.trim().to_string(),
			Err(err) if err.kind() == io::ErrorKind::NotFound => return Err(missing_host()),
			Err(err) => return Err(err.into()),
		};
		if host.is_empty() {
			return Err(missing_host());
		}

		Ok(Artifacts { host, credential })
	}
}

/// Copy the tree under `source` into `workdir`, returning the number of files.
fn stage(source: &Path, workdir: &Path) -> io::Result<usize> {
	let mut copied = 0;
	for entry in WalkDir::new(source).min_depth(1).follow_links(true) {
		let entry = entry.map_err(io::Error::from)?;
		let relative = entry.path().strip_prefix(source).map_err(io::Error::other)?;
		let target = workdir.join(relative);
		if entry.file_type().is_dir() {
			std::fs::create_dir_all(&target)?;
		} else {
			if let Some(parent) = target.parent() {
				std::fs::create_dir_all(parent)?;
			}
			std::fs::copy(entry.path(), &target)?;
			copied += 1;
		}
	}
	Ok(copied)
}
