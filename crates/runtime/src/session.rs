//! Session records.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque session identifier assigned by the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
	pub fn new(id: impl Into<String>) -> Self {
		Self(id.into())
	}

	/// Fresh random identifier.
	pub fn generate() -> Self {
		Self(uuid::Uuid::new_v4().to_string())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for SessionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
	Provisioning,
	Active,
	Failed,
	Destroying,
	Destroyed,
	DestroyFailed,
}

impl SessionStatus {
	pub const ALL: [SessionStatus; 6] = [
		SessionStatus::Provisioning,
		SessionStatus::Active,
		SessionStatus::Failed,
		SessionStatus::Destroying,
		SessionStatus::Destroyed,
		SessionStatus::DestroyFailed,
	];

	pub fn as_str(self) -> &'static str {
		match self {
			SessionStatus::Provisioning => "provisioning",
			SessionStatus::Active => "active",
			SessionStatus::Failed => "failed",
			SessionStatus::Destroying => "destroying",
			SessionStatus::Destroyed => "destroyed",
			SessionStatus::DestroyFailed => "destroy_failed",
		}
	}

	/// States from which the teardown claim may proceed.
	pub fn is_claimable(self) -> bool {
		matches!(self, SessionStatus::Active | SessionStatus::Provisioning)
	}
}

impl fmt::Display for SessionStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for SessionStatus {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		SessionStatus::ALL
			.into_iter()
			.find(|status| status.as_str() == s)
			.ok_or_else(|| format!("unknown session status '{s}'"))
	}
}

/// One ephemeral environment's lifecycle record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
	pub id: SessionId,
	pub owner: String,
	pub status: SessionStatus,
	/// Exclusive staging directory for provisioning inputs and outputs.
	pub workdir: PathBuf,
	pub expires_at: DateTime<Utc>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

/// Fields supplied when a session is first recorded.
#[derive(Debug, Clone)]
pub struct NewSession {
	pub owner: String,
	pub status: SessionStatus,
	pub workdir: PathBuf,
	pub expires_at: DateTime<Utc>,
}
