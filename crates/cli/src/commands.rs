use std::fmt::Write as _;

use anyhow::{Context, Result};
use chaoslab_runtime::pipeline::Pipeline;
use chaoslab_runtime::tool::ProvisioningTool;
use chaoslab_runtime::{LabConfig, Session, SessionStatus, SessionStore, SqliteSessionStore};

use crate::cli::{Cli, Commands};
use crate::{config, server};

pub async fn dispatch(cli: Cli) -> Result<()> {
	let mut config = config::load(cli.config.as_deref())?;

	match cli.command {
		Commands::Serve { host, port } => {
			if let Some(host) = host {
				config.host = host;
			}
			if let Some(port) = port {
				config.port = port;
			}
			server::run_server(&config).await
		}
		Commands::Sessions { status, json } => sessions(&config, status, json).await,
		Commands::Scenarios => scenarios(&config),
	}
}

async fn sessions(config: &LabConfig, status: Option<SessionStatus>, json: bool) -> Result<()> {
	let store = SqliteSessionStore::open(&config.database)
		.with_context(|| format!("Failed to open session store {}", config.database.display()))?;
	let sessions = store.list(status).await.context("Failed to list sessions")?;

	if json {
		println!("{}", serde_json::to_string_pretty(&sessions)?);
	} else {
		print!("{}", render_sessions(&sessions));
	}
	Ok(())
}

fn scenarios(config: &LabConfig) -> Result<()> {
	let pipeline = Pipeline::new(ProvisioningTool::new(&config.tool_program), &config.scenarios_dir);
	let names = pipeline
		.scenarios()
		.with_context(|| format!("Failed to read scenarios from {}", config.scenarios_dir.display()))?;
	if names.is_empty() {
		eprintln!("no scenarios in {}", config.scenarios_dir.display());
	}
	for name in names {
		println!("{name}");
	}
	Ok(())
}

/// One line per session. `destroy_failed` rows point at the directory kept
/// for manual cleanup.
fn render_sessions(sessions: &[Session]) -> String {
	if sessions.is_empty() {
		return "no sessions\n".to_string();
	}

	let width = sessions.iter().map(|s| s.id.as_str().len()).max().unwrap_or(0);
	let mut out = String::new();
	for session in sessions {
		let _ = write!(
			out,
			"{:<width$}  {:<14}  {}  {}",
			session.id.as_str(),
			session.status.as_str(),
			session.expires_at.format("%Y-%m-%d %H:%M:%SZ"),
			session.owner,
		);
		if session.status == SessionStatus::DestroyFailed {
			let _ = write!(out, "  kept {}", session.workdir.display());
		}
		out.push('\n');
	}
	out
}

#[cfg(test)]
mod tests {
	use std::path::PathBuf;

	use chaoslab_runtime::SessionId;
	use chrono::{TimeZone, Utc};

	use super::*;

	fn session(id: &str, status: SessionStatus) -> Session {
		let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
		Session {
			id: SessionId::new(id),
			owner: "203.0.113.7:40110".to_string(),
			status,
			workdir: PathBuf::from(format!("/var/lib/chaoslab/{id}")),
			expires_at: at,
			created_at: at,
			updated_at: at,
		}
	}

	#[test]
	fn test_render_marks_retained_directories() {
		let rendered = render_sessions(&[
			session("session-a", SessionStatus::Active),
			session("session-b", SessionStatus::DestroyFailed),
		]);
		let lines: Vec<&str> = rendered.lines().collect();

		assert_eq!(lines.len(), 2);
		assert!(lines[0].starts_with("session-a  active"));
		assert!(lines[0].contains("2026-03-01 12:00:00Z"));
		assert!(!lines[0].contains("kept"));
		assert!(lines[1].contains("destroy_failed"));
		assert!(lines[1].ends_with("kept /var/lib/chaoslab/session-b"));
	}

	#[test]
	fn test_render_empty() {
		assert_eq!(render_sessions(&[]), "no sessions\n");
	}
}
