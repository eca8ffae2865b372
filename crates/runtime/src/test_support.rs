//! Shared fixtures for unit tests: a shell-script provisioning tool, an
//! in-memory client channel, and an in-process shell connector.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chaoslab_protocol::ServerMessage;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use crate::bridge::{DialPolicy, RemoteShell, ShellConnector, ShellSettings, ShellTarget};
use crate::context::LabContext;
use crate::error::{Error, Result};
use crate::pipeline::Pipeline;
use crate::store::SqliteSessionStore;
use crate::tool::ProvisioningTool;
use crate::writer::ChannelWriter;

pub(crate) const INIT_OK: &str = "echo 'Terraform has been successfully initialized!'";
pub(crate) const INIT_FAILS: &str =
	"echo 'Initializing provider plugins...'; echo 'Error: Failed to query available provider packages' >&2; exit 1";
pub(crate) const APPLY_OK: &str =
	"echo 'Apply complete! Resources: 3 added.'; echo ' 203.0.113.10 ' > ip_address.txt; echo KEY > lab.pem";
pub(crate) const APPLY_FAILS: &str = "echo 'Error: creating EC2 Instance: quota exceeded' >&2; exit 1";
pub(crate) const DESTROY_OK: &str = "echo 'Destroy complete! Resources: 3 destroyed.'";
pub(crate) const DESTROY_FAILS: &str = "echo 'Error: deleting security group: DependencyViolation' >&2; exit 1";

pub(crate) const SCENARIO: &str = "web-leak";

#[cfg(unix)]
pub(crate) fn write_script(path: &Path, body: &str) -> PathBuf {
	use std::os::unix::fs::PermissionsExt;

	fs::write(path, format!("#!/bin/sh\n{body}")).unwrap();
	let mut perms = fs::metadata(path).unwrap().permissions();
	perms.set_mode(0o755);
	fs::set_permissions(path, perms).unwrap();
	path.to_path_buf()
}

/// Fake provisioning tool that appends each subcommand to a log file.
/// Returns the tool path and the log path.
#[cfg(unix)]
pub(crate) fn fake_tool(dir: &Path, apply: &str, destroy: &str) -> (PathBuf, PathBuf) {
	fake_tool_steps(dir, INIT_OK, apply, destroy)
}

/// [`fake_tool`] with a custom `init` step as well.
#[cfg(unix)]
pub(crate) fn fake_tool_steps(dir: &Path, init: &str, apply: &str, destroy: &str) -> (PathBuf, PathBuf) {
	let log = dir.join("tool-calls.log");
	let body = format!(
		"echo \"$1\" >> '{log}'\n\
		 case \"$1\" in\n\
		 \tinit) {init} ;;\n\
		 \tapply) {apply} ;;\n\
		 \tdestroy) {destroy} ;;\n\
		 esac\n",
		log = log.display(),
	);
	(write_script(&dir.join("fake-terraform"), &body), log)
}

pub(crate) fn invocations(log: &Path) -> Vec<String> {
	fs::read_to_string(log)
		.map(|text| text.lines().map(str::to_string).collect())
		.unwrap_or_default()
}

pub(crate) fn channel() -> (ChannelWriter, mpsc::UnboundedReceiver<String>) {
	let (tx, rx) = mpsc::unbounded_channel();
	(ChannelWriter::new(tx), rx)
}

/// Every frame already sent, parsed.
pub(crate) fn received(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<ServerMessage> {
	let mut messages = Vec::new();
	while let Ok(frame) = rx.try_recv() {
		messages.push(serde_json::from_str(&frame).unwrap());
	}
	messages
}

pub(crate) fn received_output(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<String> {
	received(rx)
		.into_iter()
		.filter_map(|message| match message {
			ServerMessage::PtyOutput(text) => Some(text),
			_ => None,
		})
		.collect()
}

/// Wait for the next frame matching `pred`, returning it and every frame
/// before it.
pub(crate) async fn next_matching(
	rx: &mut mpsc::UnboundedReceiver<String>,
	pred: impl Fn(&ServerMessage) -> bool,
) -> Vec<ServerMessage> {
	let mut seen = Vec::new();
	loop {
		let frame = tokio::time::timeout(Duration::from_secs(10), rx.recv())
			.await
			.expect("timed out waiting for a frame")
			.expect("channel closed while waiting for a frame");
		let message: ServerMessage = serde_json::from_str(&frame).unwrap();
		let done = pred(&message);
		seen.push(message);
		if done {
			return seen;
		}
	}
}

/// Connector that fails a fixed number of times, then hands out in-memory
/// shells. The far end of each shell is delivered on the returned receiver.
pub(crate) struct FakeConnector {
	failures: u32,
	attempts: AtomicU32,
	remotes: mpsc::UnboundedSender<DuplexStream>,
}

impl FakeConnector {
	pub(crate) fn new(failures: u32) -> (Arc<Self>, mpsc::UnboundedReceiver<DuplexStream>) {
		let (remotes, rx) = mpsc::unbounded_channel();
		let connector = Arc::new(Self {
			failures,
			attempts: AtomicU32::new(0),
			remotes,
		});
		(connector, rx)
	}

	pub(crate) fn unreachable() -> Arc<Self> {
		Self::new(u32::MAX).0
	}

	pub(crate) fn attempts(&self) -> u32 {
		self.attempts.load(Ordering::SeqCst)
	}
}

#[async_trait]
impl ShellConnector for FakeConnector {
	async fn connect(&self, target: &ShellTarget) -> Result<RemoteShell> {
		let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
		if attempt <= self.failures {
			return Err(Error::Dial {
				host: target.host.clone(),
				message: "connection refused".into(),
			});
		}
		let (local, remote) = tokio::io::duplex(4096);
		let _ = self.remotes.send(remote);
		let (output, input) = tokio::io::split(local);
		Ok(RemoteShell::new(output, input))
	}
}

/// A lab rooted in `root` with one scenario, the fake tool, an in-memory store,
/// and a fast dial policy.
#[cfg(unix)]
pub(crate) fn test_context(
	root: &Path,
	apply: &str,
	destroy: &str,
	connector: Arc<dyn ShellConnector>,
) -> (LabContext, PathBuf) {
	let scenarios = root.join("scenarios");
	fs::create_dir_all(scenarios.join(SCENARIO)).unwrap();
	fs::write(scenarios.join(SCENARIO).join("main.tf"), "resource \"aws_instance\" \"lab\" {}\n").unwrap();

	let (tool, log) = fake_tool(root, apply, destroy);
	let store = Arc::new(SqliteSessionStore::in_memory().unwrap());
	let pipeline = Pipeline::new(ProvisioningTool::new(tool), scenarios);

	let mut ctx = LabContext::new(store, pipeline, connector, root.join("work"));
	ctx.shell = ShellSettings::default();
	ctx.dial = DialPolicy {
		attempts: 3,
		delay: Duration::ZERO,
	};
	(ctx, log)
}
