//! Shared dependencies handed to every connection and to the watcher.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::bridge::{DialPolicy, ShellConnector, ShellSettings, SshConnector};
use crate::config::LabConfig;
use crate::pipeline::Pipeline;
use crate::store::SessionStore;
use crate::teardown::Teardown;
use crate::tool::ProvisioningTool;
use crate::watcher::ExpiryWatcher;

/// Explicit context for the session lifecycle. Cheap to clone.
#[derive(Clone)]
pub struct LabContext {
	pub store: Arc<dyn SessionStore>,
	pub pipeline: Pipeline,
	pub teardown: Teardown,
	pub connector: Arc<dyn ShellConnector>,
	pub shell: ShellSettings,
	pub dial: DialPolicy,
	pub workdir_root: PathBuf,
	pub session_ttl: chrono::Duration,
	pub extend_increment: chrono::Duration,
	pub idle_timeout: Duration,
}

impl LabContext {
	/// Context with default timing and shell settings.
	pub fn new(
		store: Arc<dyn SessionStore>,
		pipeline: Pipeline,
		connector: Arc<dyn ShellConnector>,
		workdir_root: impl Into<PathBuf>,
	) -> Self {
		let defaults = LabConfig::default();
		let teardown = Teardown::new(Arc::clone(&store), pipeline.tool().clone());
		Self {
			store,
			pipeline,
			teardown,
			connector,
			shell: defaults.shell_settings(),
			dial: defaults.dial_policy(),
			workdir_root: workdir_root.into(),
			session_ttl: defaults.session_ttl(),
			extend_increment: defaults.extend_increment(),
			idle_timeout: defaults.idle_timeout(),
		}
	}

	/// Production context: SSH connector and every setting from `config`.
	pub fn from_config(config: &LabConfig, store: Arc<dyn SessionStore>) -> Self {
		let pipeline = Pipeline::new(ProvisioningTool::new(&config.tool_program), &config.scenarios_dir)
			.with_credential_extension(&config.credential_extension)
			.with_host_file(&config.host_file);
		let mut ctx = Self::new(store, pipeline, Arc::new(SshConnector::new()), &config.workdir_root);
		ctx.shell = config.shell_settings();
		ctx.dial = config.dial_policy();
		ctx.session_ttl = config.session_ttl();
		ctx.extend_increment = config.extend_increment();
		ctx.idle_timeout = config.idle_timeout();
		ctx
	}

	pub fn watcher(&self, interval: Duration) -> ExpiryWatcher {
		ExpiryWatcher::new(Arc::clone(&self.store), self.teardown.clone(), interval)
	}
}
