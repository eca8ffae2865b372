//! Periodic sweep for expired sessions.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::store::SessionStore;
use crate::teardown::Teardown;

pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(30);

pub struct ExpiryWatcher {
	store: Arc<dyn SessionStore>,
	teardown: Teardown,
	interval: Duration,
}

impl ExpiryWatcher {
	pub fn new(store: Arc<dyn SessionStore>, teardown: Teardown, interval: Duration) -> Self {
		Self {
			store,
			teardown,
			interval,
		}
	}

	/// Start one detached teardown for every expired session. Does not wait for
	/// them; the handles are returned for callers that want to.
	pub async fn sweep(&self) -> Result<Vec<JoinHandle<()>>> {
		let expired = self.store.expired(Utc::now()).await?;
		if !expired.is_empty() {
			info!(target = "chaoslab.watcher", count = expired.len(), "tearing down expired sessions");
		}
		Ok(expired.into_iter().map(|id| self.teardown.spawn(id)).collect())
	}

	/// Sweep every interval until `shutdown` flips to true or its sender is dropped,
	/// then wait for the teardowns this watcher started.
	pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
		let mut ticker = tokio::time::interval(self.interval);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
		debug!(target = "chaoslab.watcher", interval_secs = self.interval.as_secs(), "expiry watcher started");

		let mut pending: Vec<JoinHandle<()>> = Vec::new();
		loop {
			tokio::select! {
				_ = ticker.tick() => {
					pending.retain(|teardown| !teardown.is_finished());
					match self.sweep().await {
						Ok(started) => pending.extend(started),
						Err(err) => warn!(target = "chaoslab.watcher", error = %err, "expiry sweep failed"),
					}
				}
				changed = shutdown.changed() => {
					if changed.is_err() || *shutdown.borrow() {
						break;
					}
				}
			}
		}

		pending.retain(|teardown| !teardown.is_finished());
		if !pending.is_empty() {
			info!(target = "chaoslab.watcher", count = pending.len(), "waiting for expiry teardowns");
		}
		for teardown in pending {
			if let Err(err) = teardown.await {
				warn!(target = "chaoslab.watcher", error = %err, "expiry teardown task failed");
			}
		}
		debug!(target = "chaoslab.watcher", "expiry watcher stopped");
	}
}
