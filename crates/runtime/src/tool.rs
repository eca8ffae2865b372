//! Provisioning tool invocation.
//!
//! The tool is any Terraform-compatible executable. Each step runs to completion
//! in the session's working directory; its stdout and stderr are read
//! concurrently and forwarded line by line while the step runs.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use chaoslab_protocol::ServerMessage;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::writer::ChannelWriter;

/// One subcommand of the provisioning tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolStep {
	Init,
	Apply,
	Destroy,
}

impl ToolStep {
	pub fn as_str(self) -> &'static str {
		match self {
			ToolStep::Init => "init",
			ToolStep::Apply => "apply",
			ToolStep::Destroy => "destroy",
		}
	}

	/// Full argument list, non-interactive and without ANSI colour.
	pub fn args(self) -> &'static [&'static str] {
		match self {
			ToolStep::Init => &["init", "-input=false", "-no-color"],
			ToolStep::Apply => &["apply", "-auto-approve", "-input=false", "-no-color"],
			ToolStep::Destroy => &["destroy", "-auto-approve", "-input=false", "-no-color"],
		}
	}
}

impl fmt::Display for ToolStep {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone)]
pub struct ProvisioningTool {
	program: PathBuf,
}

impl ProvisioningTool {
	pub fn new(program: impl Into<PathBuf>) -> Self {
		Self { program: program.into() }
	}

	/// Run `step` in `workdir` and wait for it to exit.
	///
	/// With `output`, a header and then every output line are sent to the client
	/// as `pty_output`. If the client goes away mid-step the process is left to
	/// finish and the remaining lines only reach the log.
	pub async fn run(&self, step: ToolStep, workdir: &Path, output: Option<&ChannelWriter>) -> Result<()> {
		let launch_error = |source: io::Error| Error::ToolLaunch {
			step,
			workdir: workdir.to_path_buf(),
			source,
		};

		let mut forward = output.cloned();
		let header = format!("$ {} {}\r\n", self.program.display(), step.args().join(" "));
		if let Some(writer) = &forward {
			if writer.send(&ServerMessage::PtyOutput(header)).await.is_err() {
				forward = None;
			}
		}

		info!(target = "chaoslab.tool", %step, workdir = %workdir.display(), "running provisioning step");
		let mut child = Command::new(&self.program)
			.args(step.args())
			.current_dir(workdir)
			.stdin(Stdio::null())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.spawn()
			.map_err(launch_error)?;

		let stdout = child.stdout.take().ok_or_else(|| launch_error(io::Error::other("stdout not captured")))?;
		let stderr = child.stderr.take().ok_or_else(|| launch_error(io::Error::other("stderr not captured")))?;

		let (line_tx, mut lines) = mpsc::unbounded_channel();
		let out_task = tokio::spawn(read_lines(stdout, line_tx.clone()));
		let err_task = tokio::spawn(read_lines(stderr, line_tx));

		while let Some(line) = lines.recv().await {
			debug!(target = "chaoslab.tool", %step, line, "tool output");
			if let Some(writer) = &forward {
				if writer.send(&ServerMessage::PtyOutput(format!("{line}\r\n"))).await.is_err() {
					warn!(
						target = "chaoslab.tool",
						%step,
						workdir = %workdir.display(),
						"client channel closed; step continues with output logged only"
					);
					forward = None;
				}
			}
		}

		for task in [out_task, err_task] {
			match task.await {
				Ok(Ok(())) => {}
				Ok(Err(err)) => warn!(target = "chaoslab.tool", %step, error = %err, "reading tool output failed"),
				Err(err) => warn!(target = "chaoslab.tool", %step, error = %err, "tool output reader panicked"),
			}
		}

		let status = child.wait().await.map_err(launch_error)?;
		if !status.success() {
			return Err(Error::ToolFailed {
				step,
				workdir: workdir.to_path_buf(),
				status: status.to_string(),
			});
		}
		info!(target = "chaoslab.tool", %step, workdir = %workdir.display(), "provisioning step finished");
		Ok(())
	}
}

/// Forward `reader` line by line, decoding lossily, until EOF or until the
/// receiver is gone.
async fn read_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>) -> io::Result<()>
where
	R: AsyncRead + Unpin,
{
	let mut reader = BufReader::new(reader);
	let mut buf = Vec::new();
	loop {
		buf.clear();
		if reader.read_until(b'\n', &mut buf).await? == 0 {
			return Ok(());
		}
		let line = String::from_utf8_lossy(&buf);
		let line = line.trim_end_matches(['\n', '\r']);
		if tx.send(line.to_owned()).is_err() {
			return Ok(());
		}
	}
}
