//! Locating and loading the lab configuration file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chaoslab_runtime::LabConfig;
use tracing::debug;

pub const CONFIG_FILE: &str = "config.json";

/// `<config dir>/chaoslab/config.json`, if the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
	dirs::config_dir().map(|dir| dir.join("chaoslab").join(CONFIG_FILE))
}

/// Load `explicit` when given (it must exist), otherwise the default path when
/// present, otherwise built-in defaults.
pub fn load(explicit: Option<&Path>) -> Result<LabConfig> {
	if let Some(path) = explicit {
		return read(path);
	}
	match default_config_path() {
		Some(path) if path.is_file() => read(&path),
		_ => {
			debug!(target = "chaoslab.config", "no config file, using defaults");
			Ok(LabConfig::default())
		}
	}
}

fn read(path: &Path) -> Result<LabConfig> {
	let config =
		LabConfig::from_file(path).with_context(|| format!("Failed to load config from {}", path.display()))?;
	debug!(target = "chaoslab.config", path = %path.display(), "loaded config");
	Ok(config)
}
