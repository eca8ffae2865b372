//! Envelope types for the scenario terminal websocket.
//!
//! The protocol is small:
//!
//! 1. Browser connects to `/terminal`, server sends [`ServerMessage::Status`] with
//!    [`StatusToken::Connected`]
//! 2. Browser sends [`ClientMessage::RunTerraform`] naming a scenario
//! 3. Server streams provisioning output as [`ServerMessage::PtyOutput`] and reports
//!    the session expiry with [`ServerMessage::SessionStatus`]
//! 4. Once the remote shell is up, keystrokes travel as [`ClientMessage::PtyInput`]
//!    and terminal output as [`ServerMessage::PtyOutput`]
//! 5. [`ClientMessage::SessionExtend`] pushes the expiry forward
//!
//! Any failure that ends the session is reported with exactly one
//! [`ServerMessage::Error`] before the socket closes.

use serde::{Deserialize, Serialize};

/// Frame sent from the browser to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
	/// Provision the named scenario and attach a shell to it.
	RunTerraform(String),
	/// Raw terminal input for the remote shell.
	PtyInput(String),
	/// Push the session expiry forward by the server's fixed increment.
	SessionExtend,
}

/// Frame sent from the server to the browser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
	/// Terminal bytes, from the provisioning tool or the remote shell.
	PtyOutput(String),
	/// Short state token.
	Status(StatusToken),
	/// Session expiry report. Encoded as a JSON string inside `payload`.
	SessionStatus(#[serde(with = "json_string")] SessionStatusReport),
	/// Human-readable failure description.
	Error(String),
}

impl ServerMessage {
	/// Wire name of this frame's `type` field.
	pub fn kind(&self) -> &'static str {
		match self {
			ServerMessage::PtyOutput(_) => "pty_output",
			ServerMessage::Status(_) => "status",
			ServerMessage::SessionStatus(_) => "session_status",
			ServerMessage::Error(_) => "error",
		}
	}
}

/// State tokens carried by [`ServerMessage::Status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusToken {
	/// The websocket is open and the server is ready for a request.
	Connected,
	/// A provisioning run has started.
	Provisioning,
	/// The remote shell is connected and accepting input.
	ShellReady,
}

/// Expiry details for the connection's session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatusReport {
	/// Opaque session identifier.
	pub session_id: String,
	/// Expiry as a Unix timestamp in seconds.
	pub expires_at: i64,
	/// Optional human-readable note ("session extended", ...).
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub message: Option<String>,
}

/// Path the browser upgrades to for the terminal channel.
pub const TERMINAL_PATH: &str = "/terminal";

mod json_string {
	use serde::{Deserialize, Deserializer, Serializer};

	use super::SessionStatusReport;

	pub fn serialize<S: Serializer>(report: &SessionStatusReport, serializer: S) -> Result<S::Ok, S::Error> {
		let text = serde_json::to_string(report).map_err(serde::ser::Error::custom)?;
		serializer.serialize_str(&text)
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SessionStatusReport, D::Error> {
		let text = String::deserialize(deserializer)?;
		serde_json::from_str(&text).map_err(serde::de::Error::custom)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn run_terraform_parses_from_envelope() {
		let msg: ClientMessage = serde_json::from_str(r#"{"type":"run_terraform","payload":"s3-leak"}"#).unwrap();
		assert_eq!(msg, ClientMessage::RunTerraform("s3-leak".into()));
	}

	#[test]
	fn session_extend_needs_no_payload() {
		let msg: ClientMessage = serde_json::from_str(r#"{"type":"session_extend"}"#).unwrap();
		assert_eq!(msg, ClientMessage::SessionExtend);
	}

	#[test]
	fn unknown_type_is_rejected() {
		let result = serde_json::from_str::<ClientMessage>(r#"{"type":"resize","payload":"80x24"}"#);
		assert!(result.is_err());
	}

	#[test]
	fn status_serializes_with_type_tag() {
		let json = serde_json::to_string(&ServerMessage::Status(StatusToken::Connected)).unwrap();
		assert_eq!(json, r#"{"type":"status","payload":"connected"}"#);
	}

	#[test]
	fn session_status_payload_is_a_json_string() {
		let msg = ServerMessage::SessionStatus(SessionStatusReport {
			session_id: "abc".into(),
			expires_at: 1_700_000_000,
			message: None,
		});
		let value: serde_json::Value = serde_json::to_value(&msg).unwrap();
		assert_eq!(value["type"], "session_status");

		let payload = value["payload"].as_str().expect("payload should be a string");
		let report: SessionStatusReport = serde_json::from_str(payload).unwrap();
		assert_eq!(report.expires_at, 1_700_000_000);
		assert!(!payload.contains("message"));

		let back: ServerMessage = serde_json::from_value(value).unwrap();
		assert_eq!(back, msg);
	}

	#[test]
	fn kind_matches_wire_tag() {
		let msg = ServerMessage::Error("boom".into());
		let value: serde_json::Value = serde_json::to_value(&msg).unwrap();
		assert_eq!(value["type"], msg.kind());
	}
}
