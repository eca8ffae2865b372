//! Session store: the single source of truth for session status.
//!
//! Every status change goes through this trait. There is no in-process registry
//! of sessions, so two processes pointed at the same database coordinate through
//! [`SessionStore::claim`] alone.

mod sqlite;

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
pub use sqlite::SqliteSessionStore;

use crate::error::Result;
use crate::session::{NewSession, Session, SessionId, SessionStatus};

#[async_trait]
pub trait SessionStore: Send + Sync {
	/// Record a new session and return its id and stored expiry.
	async fn insert(&self, session: NewSession) -> Result<(SessionId, DateTime<Utc>)>;

	async fn get(&self, id: &SessionId) -> Result<Option<Session>>;

	/// All sessions, newest first, optionally filtered by status.
	async fn list(&self, status: Option<SessionStatus>) -> Result<Vec<Session>>;

	/// Atomically move a claimable session to `destroying`.
	///
	/// Returns the session's working directory if this caller won the claim, or
	/// `None` if the session was not `active`/`provisioning` (someone else owns
	/// teardown, or it already finished).
	async fn claim(&self, id: &SessionId) -> Result<Option<PathBuf>>;

	/// Ids of `active` sessions whose expiry is at or before `now`.
	async fn expired(&self, now: DateTime<Utc>) -> Result<Vec<SessionId>>;

	/// Unconditionally set a session's status.
	async fn update_status(&self, id: &SessionId, status: SessionStatus) -> Result<()>;

	/// Set `to` only if the current status is `from`. Returns whether it applied.
	async fn transition(&self, id: &SessionId, from: SessionStatus, to: SessionStatus) -> Result<bool>;

	/// Push an `active` session's expiry forward by `delta` and return the new value.
	async fn extend_expiry(&self, id: &SessionId, delta: Duration) -> Result<DateTime<Utc>>;
}
