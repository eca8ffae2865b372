//! Lab configuration.
//!
//! Every field has a default, so an empty JSON object (or no file at all) is a
//! valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bridge::{DEFAULT_DIAL_ATTEMPTS, DEFAULT_TERM, DialPolicy, ShellSettings};
use crate::error::{Error, Result};
use crate::pipeline::{DEFAULT_CREDENTIAL_EXTENSION, DEFAULT_HOST_FILE};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LabConfig {
	/// Listen address.
	pub host: String,
	pub port: u16,
	/// One subdirectory per scenario.
	pub scenarios_dir: PathBuf,
	/// Parent of every `session-<uuid>` working directory.
	pub workdir_root: PathBuf,
	/// SQLite database file.
	pub database: PathBuf,
	/// Provisioning tool executable, looked up on `PATH` when not a path.
	pub tool_program: PathBuf,
	pub credential_extension: String,
	pub host_file: String,
	pub session_ttl_secs: u64,
	pub extend_increment_secs: u64,
	pub idle_timeout_secs: u64,
	pub watch_interval_secs: u64,
	pub dial_attempts: u32,
	pub dial_delay_secs: u64,
	pub ssh_user: String,
	pub ssh_port: u16,
	pub term: String,
	pub cols: u32,
	pub rows: u32,
}

impl Default for LabConfig {
	fn default() -> Self {
		let shell = ShellSettings::default();
		Self {
			host: "127.0.0.1".to_string(),
			port: 5000,
			scenarios_dir: PathBuf::from("scenarios"),
			workdir_root: std::env::temp_dir().join("chaoslab"),
			database: PathBuf::from("chaoslab.db"),
			tool_program: PathBuf::from("terraform"),
			credential_extension: DEFAULT_CREDENTIAL_EXTENSION.to_string(),
			host_file: DEFAULT_HOST_FILE.to_string(),
			session_ttl_secs: 30 * 60,
			extend_increment_secs: 30 * 60,
			idle_timeout_secs: 30 * 60,
			watch_interval_secs: 30,
			dial_attempts: DEFAULT_DIAL_ATTEMPTS,
			dial_delay_secs: 10,
			ssh_user: shell.user,
			ssh_port: shell.port,
			term: DEFAULT_TERM.to_string(),
			cols: shell.cols,
			rows: shell.rows,
		}
	}
}

impl LabConfig {
	/// Read and validate a JSON configuration file.
	pub fn from_file(path: &Path) -> Result<Self> {
		let text = std::fs::read_to_string(path)?;
		let config: LabConfig = serde_json::from_str(&text)?;
		config.validate()?;
		Ok(config)
	}

	pub fn validate(&self) -> Result<()> {
		let positive = [
			("session_ttl_secs", self.session_ttl_secs),
			("extend_increment_secs", self.extend_increment_secs),
			("idle_timeout_secs", self.idle_timeout_secs),
			("watch_interval_secs", self.watch_interval_secs),
			("dial_attempts", u64::from(self.dial_attempts)),
		];
		for (field, value) in positive {
			if value == 0 {
				return Err(Error::InvalidConfig(format!("{field} must be greater than zero")));
			}
		}
		if self.credential_extension.is_empty() || self.credential_extension.starts_with('.') {
			return Err(Error::InvalidConfig(format!(
				"credential_extension must be a bare extension like \"pem\", got {:?}",
				self.credential_extension
			)));
		}
		if self.host_file.is_empty() || self.host_file.contains('/') {
			return Err(Error::InvalidConfig(format!(
				"host_file must be a plain file name, got {:?}",
				self.host_file
			)));
		}
		Ok(())
	}

	pub fn session_ttl(&self) -> chrono::Duration {
		seconds(self.session_ttl_secs)
	}

	pub fn extend_increment(&self) -> chrono::Duration {
		seconds(self.extend_increment_secs)
	}

	pub fn idle_timeout(&self) -> Duration {
		Duration::from_secs(self.idle_timeout_secs)
	}

	pub fn watch_interval(&self) -> Duration {
		Duration::from_secs(self.watch_interval_secs)
	}

	pub fn dial_policy(&self) -> DialPolicy {
		DialPolicy {
			attempts: self.dial_attempts,
			delay: Duration::from_secs(self.dial_delay_secs),
		}
	}

	pub fn shell_settings(&self) -> ShellSettings {
		ShellSettings {
			user: self.ssh_user.clone(),
			port: self.ssh_port,
			term: self.term.clone(),
			cols: self.cols,
			rows: self.rows,
		}
	}
}

fn seconds(secs: u64) -> chrono::Duration {
	i64::try_from(secs)
		.ok()
		.and_then(chrono::Duration::try_seconds)
		.unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
	use tempfile::TempDir;

	use super::*;

	#[test]
	fn test_empty_object_is_all_defaults() {
		let config: LabConfig = serde_json::from_str("{}").unwrap();
		assert_eq!(config, LabConfig::default());
		assert_eq!(config.dial_policy(), DialPolicy::default());
		assert_eq!(config.session_ttl(), chrono::Duration::minutes(30));
		assert_eq!(config.shell_settings().term, "xterm-256color");
	}

	#[test]
	fn test_from_file_overrides_and_validates() {
		let temp = TempDir::new().unwrap();
		let path = temp.path().join("config.json");
		std::fs::write(&path, r#"{"port": 8080, "ssh_user": "ec2-user", "dial_attempts": 5}"#).unwrap();

		let config = LabConfig::from_file(&path).unwrap();
		assert_eq!(config.port, 8080);
		assert_eq!(config.ssh_user, "ec2-user");
		assert_eq!(config.dial_policy().attempts, 5);

		std::fs::write(&path, r#"{"idle_timeout_secs": 0}"#).unwrap();
		assert!(matches!(LabConfig::from_file(&path), Err(Error::InvalidConfig(_))));
	}

	#[test]
	fn test_unknown_fields_are_rejected() {
		let result = serde_json::from_str::<LabConfig>(r#"{"prot": 80}"#);
		assert!(result.is_err());
	}
}
