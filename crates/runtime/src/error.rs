//! Error types for the chaoslab runtime.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::session::{SessionId, SessionStatus};
use crate::tool::ToolStep;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running a session lifecycle.
#[derive(Debug, Error)]
pub enum Error {
	/// Client frame was not a valid envelope.
	#[error("malformed message: {0}")]
	MalformedMessage(String),

	/// Scenario name does not resolve to a scenario directory.
	#[error("unknown scenario '{0}'")]
	UnknownScenario(String),

	/// Request is not valid in the connection's current state.
	#[error("{request} is not allowed while the connection is {state}")]
	InvalidState { request: &'static str, state: &'static str },

	/// Session-scoped request arrived before any session was started.
	#[error("no session has been started on this connection")]
	NoSession,

	/// Extension amount must be positive.
	#[error("session extension must be positive, got {secs}s")]
	InvalidExtension { secs: i64 },

	/// Session exists but is not in the state the operation requires.
	#[error("session {id} is {status}, expected active")]
	SessionNotActive { id: SessionId, status: SessionStatus },

	/// No session row with this id.
	#[error("session {0} not found")]
	SessionNotFound(SessionId),

	/// Scenario source directory vanished before staging.
	#[error("scenario directory missing: {}", path.display())]
	ScenarioMissing { path: PathBuf },

	/// Copying scenario inputs into the working directory failed.
	#[error("failed to stage scenario into {}: {source}", workdir.display())]
	Staging {
		workdir: PathBuf,
		#[source]
		source: std::io::Error,
	},

	/// The provisioning tool could not be started or its output could not be read.
	#[error("failed to run {step} in {}: {source}", workdir.display())]
	ToolLaunch {
		step: ToolStep,
		workdir: PathBuf,
		#[source]
		source: std::io::Error,
	},

	/// The provisioning tool exited unsuccessfully.
	#[error("{step} failed in {} ({status})", workdir.display())]
	ToolFailed {
		step: ToolStep,
		workdir: PathBuf,
		status: String,
	},

	/// Expected provisioning output is absent.
	#[error("{artifact} not found in {}", workdir.display())]
	MissingArtifact { artifact: &'static str, workdir: PathBuf },

	/// More than one file matched a single-artifact pattern.
	#[error("{count} candidates for {artifact} in {}", workdir.display())]
	AmbiguousArtifact {
		artifact: &'static str,
		workdir: PathBuf,
		count: usize,
	},

	/// Every dial attempt to the remote shell failed.
	#[error("could not reach {host} after {attempts} attempts: {last_error}")]
	DialExhausted {
		host: String,
		attempts: u32,
		last_error: String,
	},

	/// A single dial attempt failed.
	#[error("connection to {host} failed: {message}")]
	Dial { host: String, message: String },

	/// Session, PTY, or shell setup failed after connecting.
	#[error("remote shell setup on {host} failed: {message}")]
	ShellSetup { host: String, message: String },

	/// The remote shell stopped accepting keystrokes.
	#[error("remote shell stopped reading input (waited {waited:?})")]
	InputStalled { waited: Duration },

	/// A configuration value is out of range.
	#[error("invalid configuration: {0}")]
	InvalidConfig(String),

	/// The session store rejected an operation.
	#[error("session store {op} failed: {source}")]
	Store {
		op: &'static str,
		#[source]
		source: rusqlite::Error,
	},

	/// The client channel is no longer usable.
	#[error("client channel closed")]
	ChannelClosed,

	/// A background task could not be joined.
	#[error("background task failed: {0}")]
	Join(String),

	/// I/O error.
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	/// JSON serialization/deserialization error.
	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),
}

/// Coarse grouping used to decide how a failure is surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
	/// Bad client request. Reported, connection stays open.
	Input,
	/// Staging, init, apply, or artifact discovery failed. Reported, session
	/// marked failed, connection closed.
	Provisioning,
	/// Remote shell unreachable or unusable. Reported, connection closed.
	Connectivity,
	/// Destroy step failed. Logged and recorded as `destroy_failed` only.
	Teardown,
	/// The client is gone; nothing left to report to.
	Channel,
	/// Store, I/O, or task failures.
	Internal,
}

impl Error {
	/// Classify this error for reporting.
	pub fn class(&self) -> ErrorClass {
		match self {
			Error::MalformedMessage(_)
			| Error::UnknownScenario(_)
			| Error::InvalidState { .. }
			| Error::NoSession
			| Error::InvalidExtension { .. }
			| Error::SessionNotActive { .. }
			| Error::SessionNotFound(_) => ErrorClass::Input,
			Error::ToolLaunch { step: ToolStep::Destroy, .. } | Error::ToolFailed { step: ToolStep::Destroy, .. } => {
				ErrorClass::Teardown
			}
			Error::ScenarioMissing { .. }
			| Error::Staging { .. }
			| Error::ToolLaunch { .. }
			| Error::ToolFailed { .. }
			| Error::MissingArtifact { .. }
			| Error::AmbiguousArtifact { .. } => ErrorClass::Provisioning,
			Error::DialExhausted { .. }
			| Error::Dial { .. }
			| Error::ShellSetup { .. }
			| Error::InputStalled { .. } => ErrorClass::Connectivity,
			Error::ChannelClosed => ErrorClass::Channel,
			Error::InvalidConfig(_) | Error::Store { .. } | Error::Join(_) | Error::Io(_) | Error::Json(_) => {
				ErrorClass::Internal
			}
		}
	}

	/// Whether the connection can keep serving after reporting this error.
	pub fn keeps_connection(&self) -> bool {
		self.class() == ErrorClass::Input
	}

	pub(crate) fn store(op: &'static str) -> impl FnOnce(rusqlite::Error) -> Error {
		move |source| Error::Store { op, source }
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn input_errors_keep_the_connection() {
		assert!(Error::UnknownScenario("nope".into()).keeps_connection());
		assert!(Error::NoSession.keeps_connection());
		assert!(!Error::ChannelClosed.keeps_connection());
	}

	#[test]
	fn tool_failure_is_a_provisioning_error() {
		let err = Error::ToolFailed {
			step: ToolStep::Apply,
			workdir: PathBuf::from("/tmp/session-1"),
			status: "exit status: 1".into(),
		};
		assert_eq!(err.class(), ErrorClass::Provisioning);
		assert_eq!(err.to_string(), "apply failed in /tmp/session-1 (exit status: 1)");
	}

	#[test]
	fn destroy_failure_is_a_teardown_error() {
		let err = Error::ToolFailed {
			step: ToolStep::Destroy,
			workdir: PathBuf::from("/tmp/session-2"),
			status: "exit status: 1".into(),
		};
		assert_eq!(err.class(), ErrorClass::Teardown);
		assert!(!err.keeps_connection());
	}

	#[test]
	fn dial_exhaustion_is_a_connectivity_error() {
		let err = Error::DialExhausted {
			host: "10.0.0.7".into(),
			attempts: 30,
			last_error: "connection refused".into(),
		};
		assert_eq!(err.class(), ErrorClass::Connectivity);
		assert!(err.to_string().contains("30 attempts"));
	}
}
