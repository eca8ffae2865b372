//! Claim-and-teardown, shared by the disconnect path and the expiry watcher.

use std::io;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::session::{SessionId, SessionStatus};
use crate::store::SessionStore;
use crate::tool::{ProvisioningTool, ToolStep};

/// How a teardown attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownOutcome {
	/// Another actor already claimed the session, or it was never claimable.
	LostRace,
	Destroyed,
	/// The destroy step failed; the working directory was kept.
	DestroyFailed,
}

#[derive(Clone)]
pub struct Teardown {
	store: Arc<dyn SessionStore>,
	tool: ProvisioningTool,
}

impl Teardown {
	pub fn new(store: Arc<dyn SessionStore>, tool: ProvisioningTool) -> Self {
		Self { store, tool }
	}

	/// Claim `id` and, if this caller won, destroy its environment.
	pub async fn claim_and_destroy(&self, id: &SessionId) -> Result<TeardownOutcome> {
		let Some(workdir) = self.store.claim(id).await? else {
			debug!(target = "chaoslab.teardown", session = %id, "session already claimed or not live");
			return Ok(TeardownOutcome::LostRace);
		};
		info!(target = "chaoslab.teardown", session = %id, workdir = %workdir.display(), "destroying environment");

		if let Err(err) = self.tool.run(ToolStep::Destroy, &workdir, None).await {
			error!(
				target = "chaoslab.teardown",
				session = %id,
				workdir = %workdir.display(),
				error = %err,
				"destroy failed; working directory kept for manual recovery"
			);
			self.store.update_status(id, SessionStatus::DestroyFailed).await?;
			return Ok(TeardownOutcome::DestroyFailed);
		}

		match tokio::fs::remove_dir_all(&workdir).await {
			Ok(()) => {}
			Err(err) if err.kind() == io::ErrorKind::NotFound => {}
			Err(err) => warn!(
				target = "chaoslab.teardown",
				session = %id,
				workdir = %workdir.display(),
				error = %err,
				"environment destroyed but working directory could not be removed"
			),
		}
		self.store.update_status(id, SessionStatus::Destroyed).await?;
		info!(target = "chaoslab.teardown", session = %id, "environment destroyed");
		Ok(TeardownOutcome::Destroyed)
	}

	/// [`Self::claim_and_destroy`], with any error logged instead of returned.
	pub async fn run_logged(&self, id: &SessionId) {
		if let Err(err) = self.claim_and_destroy(id).await {
			error!(target = "chaoslab.teardown", session = %id, error = %err, "teardown failed");
		}
	}

	/// Run the teardown of `id` as a detached task.
	pub fn spawn(&self, id: SessionId) -> JoinHandle<()> {
		let teardown = self.clone();
		tokio::spawn(async move { teardown.run_logged(&id).await })
	}
}
