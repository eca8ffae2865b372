//! SQLite-backed [`SessionStore`].
//!
//! Each handle owns one connection. Writes run in `BEGIN IMMEDIATE` transactions
//! so that several handles (or processes) on the same database file serialize on
//! SQLite's write lock instead of racing. WAL mode keeps readers from blocking on
//! a writer, which is what lets the expiry scan skip past rows another actor is
//! busy claiming.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use tracing::debug;

use super::SessionStore;
use crate::error::{Error, Result};
use crate::session::{NewSession, Session, SessionId, SessionStatus};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
	id TEXT PRIMARY KEY,
	owner TEXT NOT NULL,
	status TEXT NOT NULL,
	workdir TEXT NOT NULL UNIQUE,
	expires_at INTEGER NOT NULL,
	created_at INTEGER NOT NULL,
	updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS sessions_status_expiry ON sessions (status, expires_at);
";

const SELECT_COLUMNS: &str = "SELECT id, owner, status, workdir, expires_at, created_at, updated_at FROM sessions";

const BUSY_TIMEOUT: StdDuration = StdDuration::from_secs(5);

#[derive(Clone)]
pub struct SqliteSessionStore {
	conn: Arc<Mutex<Connection>>,
}

impl SqliteSessionStore {
	/// Open (creating if needed) the database at `path`.
	pub fn open(path: impl AsRef<Path>) -> Result<Self> {
		let path = path.as_ref();
		if let Some(parent) = path.parent() {
			if !parent.as_os_str().is_empty() {
				std::fs::create_dir_all(parent)?;
			}
		}
		let conn = Connection::open(path).map_err(Error::store("open"))?;
		let journal: String = conn
			.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
			.map_err(Error::store("open"))?;
		debug!(target = "chaoslab.store", path = %path.display(), journal, "opened session store");
		Self::bootstrap(conn)
	}

	/// Private database for tests and single-process embedding.
	pub fn in_memory() -> Result<Self> {
		let conn = Connection::open_in_memory().map_err(Error::store("open"))?;
		Self::bootstrap(conn)
	}

	fn bootstrap(conn: Connection) -> Result<Self> {
		conn.busy_timeout(BUSY_TIMEOUT).map_err(Error::store("open"))?;
		conn.execute_batch(SCHEMA).map_err(Error::store("migrate"))?;
		Ok(Self {
			conn: Arc::new(Mutex::new(conn)),
		})
	}

	async fn with_conn<T, F>(&self, op: &'static str, f: F) -> Result<T>
	where
		T: Send + 'static,
		F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
	{
		let conn = Arc::clone(&self.conn);
		tokio::task::spawn_blocking(move || {
			let mut guard = conn.lock();
			f(&mut guard)
		})
		.await
		.map_err(|e| Error::Join(e.to_string()))?
		.map_err(Error::store(op))
	}
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
	async fn insert(&self, session: NewSession) -> Result<(SessionId, DateTime<Utc>)> {
		let id = SessionId::generate();
		let row_id = id.clone();
		let expires_at = session.expires_at.timestamp();
		self.with_conn("insert", move |conn| {
			let now = Utc::now().timestamp();
			conn.execute(
				"INSERT INTO sessions (id, owner, status, workdir, expires_at, created_at, updated_at)
				 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
				params![
					row_id.as_str(),
					session.owner,
					session.status.as_str(),
					session.workdir.to_string_lossy(),
					expires_at,
					now,
				],
			)?;
			Ok(())
		})
		.await?;
		Ok((id, timestamp(expires_at)))
	}

	async fn get(&self, id: &SessionId) -> Result<Option<Session>> {
		let id = id.clone();
		self.with_conn("get", move |conn| {
			conn.query_row(&format!("{SELECT_COLUMNS} WHERE id = ?1"), params![id.as_str()], session_from_row)
				.optional()
		})
		.await
	}

	async fn list(&self, status: Option<SessionStatus>) -> Result<Vec<Session>> {
		self.with_conn("list", move |conn| {
			let mut stmt = conn.prepare(&format!(
				"{SELECT_COLUMNS} WHERE (?1 IS NULL OR status = ?1) ORDER BY created_at DESC, id"
			))?;
			let rows = stmt.query_map(params![status.map(SessionStatus::as_str)], session_from_row)?;
			rows.collect()
		})
		.await
	}

	async fn claim(&self, id: &SessionId) -> Result<Option<PathBuf>> {
		let id = id.clone();
		self.with_conn("claim", move |conn| {
			let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
			let workdir: Option<String> = tx
				.query_row(
					"UPDATE sessions SET status = ?2, updated_at = ?3
					 WHERE id = ?1 AND status IN (?4, ?5)
					 RETURNING workdir",
					params![
						id.as_str(),
						SessionStatus::Destroying.as_str(),
						Utc::now().timestamp(),
						SessionStatus::Active.as_str(),
						SessionStatus::Provisioning.as_str(),
					],
					|row| row.get(0),
				)
				.optional()?;
			tx.commit()?;
			Ok(workdir.map(PathBuf::from))
		})
		.await
	}

	async fn expired(&self, now: DateTime<Utc>) -> Result<Vec<SessionId>> {
		let now = now.timestamp();
		self.with_conn("expired", move |conn| {
			let mut stmt = conn.prepare(
				"SELECT id FROM sessions WHERE status = ?1 AND expires_at <= ?2 ORDER BY expires_at",
			)?;
			let rows = stmt.query_map(params![SessionStatus::Active.as_str(), now], |row| {
				row.get::<_, String>(0).map(SessionId::new)
			})?;
			rows.collect()
		})
		.await
	}

	async fn update_status(&self, id: &SessionId, status: SessionStatus) -> Result<()> {
		let row_id = id.clone();
		let changed = self
			.with_conn("update_status", move |conn| {
				conn.execute(
					"UPDATE sessions SET status = ?2, updated_at = ?3 WHERE id = ?1",
					params![row_id.as_str(), status.as_str(), Utc::now().timestamp()],
				)
			})
			.await?;
		if changed == 0 {
			return Err(Error::SessionNotFound(id.clone()));
		}
		Ok(())
	}

	async fn transition(&self, id: &SessionId, from: SessionStatus, to: SessionStatus) -> Result<bool> {
		let id = id.clone();
		let changed = self
			.with_conn("transition", move |conn| {
				let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
				let changed = tx.execute(
					"UPDATE sessions SET status = ?3, updated_at = ?4 WHERE id = ?1 AND status = ?2",
					params![id.as_str(), from.as_str(), to.as_str(), Utc::now().timestamp()],
				)?;
				tx.commit()?;
				Ok(changed)
			})
			.await?;
		Ok(changed == 1)
	}

	async fn extend_expiry(&self, id: &SessionId, delta: Duration) -> Result<DateTime<Utc>> {
		let secs = delta.num_seconds();
		if secs <= 0 {
			return Err(Error::InvalidExtension { secs });
		}

		let row_id = id.clone();
		let outcome = self
			.with_conn("extend_expiry", move |conn| {
				let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
				let extended: Option<i64> = tx
					.query_row(
						"UPDATE sessions SET expires_at = expires_at + ?2, updated_at = ?3
						 WHERE id = ?1 AND status = ?4
						 RETURNING expires_at",
						params![row_id.as_str(), secs, Utc::now().timestamp(), SessionStatus::Active.as_str()],
						|row| row.get(0),
					)
					.optional()?;
				let outcome = match extended {
					Some(expires_at) => Ok(expires_at),
					None => Err(tx
						.query_row("SELECT status FROM sessions WHERE id = ?1", params![row_id.as_str()], |row| {
							parse_status(row, 0)
						})
						.optional()?),
				};
				tx.commit()?;
				Ok(outcome)
			})
			.await?;

		match outcome {
			Ok(expires_at) => Ok(timestamp(expires_at)),
			Err(None) => Err(Error::SessionNotFound(id.clone())),
			Err(Some(status)) => Err(Error::SessionNotActive { id: id.clone(), status }),
		}
	}
}

fn parse_status(row: &Row<'_>, idx: usize) -> rusqlite::Result<SessionStatus> {
	let status: String = row.get(idx)?;
	status
		.parse()
		.map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
	let workdir: String = row.get(3)?;
	Ok(Session {
		id: SessionId::new(row.get::<_, String>(0)?),
		owner: row.get(1)?,
		status: parse_status(row, 2)?,
		workdir: PathBuf::from(workdir),
		expires_at: timestamp(row.get(4)?),
		created_at: timestamp(row.get(5)?),
		updated_at: timestamp(row.get(6)?),
	})
}

fn timestamp(secs: i64) -> DateTime<Utc> {
	DateTime::from_timestamp(secs, 0).unwrap_or(DateTime::UNIX_EPOCH)
}
