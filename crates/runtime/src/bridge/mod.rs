//! Remote shell bridge.
//!
//! [`dial`] reaches the provisioned host with bounded retry, [`spawn_output_copier`]
//! relays shell output to the client, and [`InputGate`] relays client keystrokes
//! to the shell once it exists.

mod ssh;

use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chaoslab_protocol::ServerMessage;
pub use ssh::SshConnector;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::writer::ChannelWriter;

pub const DEFAULT_DIAL_ATTEMPTS: u32 = 30;
pub const DEFAULT_DIAL_DELAY: Duration = Duration::from_secs(10);
pub const DEFAULT_TERM: &str = "xterm-256color";
pub const DEFAULT_INPUT_TIMEOUT: Duration = Duration::from_secs(10);

const COPY_CHUNK: usize = 4096;

/// Everything needed to open one interactive shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellTarget {
	pub host: String,
	pub port: u16,
	pub user: String,
	pub key_path: PathBuf,
	pub term: String,
	pub cols: u32,
	pub rows: u32,
}

/// Connection settings that do not come from provisioning output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellSettings {
	pub user: String,
	pub port: u16,
	pub term: String,
	pub cols: u32,
	pub rows: u32,
}

impl Default for ShellSettings {
	fn default() -> Self {
		Self {
			user: "ubuntu".to_string(),
			port: 22,
			term: DEFAULT_TERM.to_string(),
			cols: 80,
			rows: 24,
		}
	}
}

impl ShellSettings {
	pub fn target(&self, host: impl Into<String>, key_path: impl Into<PathBuf>) -> ShellTarget {
		ShellTarget {
			host: host.into(),
			port: self.port,
			user: self.user.clone(),
			key_path: key_path.into(),
			term: self.term.clone(),
			cols: self.cols,
			rows: self.rows,
		}
	}
}

pub type ShellOutput = Box<dyn AsyncRead + Send + Unpin>;
pub type ShellInput = Box<dyn AsyncWrite + Send + Unpin>;

/// A started shell: its output and input streams, plus whatever transport state
/// has to stay alive as long as they are in use.
pub struct RemoteShell {
	pub output: ShellOutput,
	pub input: ShellInput,
	pub transport: Option<Box<dyn Any + Send>>,
}

impl RemoteShell {
	pub fn new(output: impl AsyncRead + Send + Unpin + 'static, input: impl AsyncWrite + Send + Unpin + 'static) -> Self {
		Self {
			output: Box::new(output),
			input: Box::new(input),
			transport: None,
		}
	}

	pub fn with_transport(mut self, transport: impl Any + Send) -> Self {
		self.transport = Some(Box::new(transport));
		self
	}
}

/// One dial attempt: connect, authenticate, PTY, shell.
#[async_trait]
pub trait ShellConnector: Send + Sync {
	async fn connect(&self, target: &ShellTarget) -> Result<RemoteShell>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialPolicy {
	pub attempts: u32,
	/// Pause between attempts. There is none after the last.
	pub delay: Duration,
}

impl Default for DialPolicy {
	fn default() -> Self {
		Self {
			attempts: DEFAULT_DIAL_ATTEMPTS,
			delay: DEFAULT_DIAL_DELAY,
		}
	}
}

/// Dial `target` until it answers or the policy runs out.
///
/// Only [`Error::Dial`] is retried. Anything else (a bad key, a refused PTY, a
/// shell that will not start) ends dialing at once with that error.
///
/// A progress line goes to the client before every attempt. If that send fails
/// the client is gone and dialing stops with [`Error::ChannelClosed`].
pub async fn dial(
	connector: &dyn ShellConnector,
	target: &ShellTarget,
	policy: &DialPolicy,
	writer: &ChannelWriter,
) -> Result<RemoteShell> {
	let attempts = policy.attempts.max(1);
	let mut last_error = String::new();

	for attempt in 1..=attempts {
		let progress = format!("Connecting to {}@{} (attempt {attempt}/{attempts})...\r\n", target.user, target.host);
		writer.send(&ServerMessage::PtyOutput(progress)).await?;

		match connector.connect(target).await {
			Ok(shell) => {
				info!(target = "chaoslab.bridge", host = %target.host, attempt, "remote shell attached");
				return Ok(shell);
			}
			Err(err @ Error::Dial { .. }) => {
				warn!(target = "chaoslab.bridge", host = %target.host, attempt, error = %err, "dial attempt failed");
				last_error = err.to_string();
			}
			Err(err) => {
				warn!(target = "chaoslab.bridge", host = %target.host, attempt, error = %err, "remote shell setup failed");
				return Err(err);
			}
		}

		if attempt < attempts {
			tokio::time::sleep(policy.delay).await;
		}
	}

	Err(Error::DialExhausted {
		host: target.host.clone(),
		attempts,
		last_error,
	})
}

/// Why an output copier stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyEnd {
	/// The remote side closed its output.
	Eof,
	ReadFailed(String),
	/// The client channel stopped accepting frames.
	ChannelClosed,
}

/// Relay `output` to the client until it ends. The task's completion is the
/// remote-session-ended event.
pub fn spawn_output_copier(mut output: ShellOutput, writer: ChannelWriter) -> JoinHandle<CopyEnd> {
	tokio::spawn(async move {
		let mut decoder = Utf8Carry::default();
		let mut buf = vec![0u8; COPY_CHUNK];
		loop {
			let read = match output.read(&mut buf).await {
				Ok(0) => {
					let tail = decoder.finish();
					if !tail.is_empty() && writer.send(&ServerMessage::PtyOutput(tail)).await.is_err() {
						return CopyEnd::ChannelClosed;
					}
					debug!(target = "chaoslab.bridge", "remote shell output ended");
					return CopyEnd::Eof;
				}
				Ok(n) => n,
				Err(err) => {
					debug!(target = "chaoslab.bridge", error = %err, "reading remote shell output failed");
					return CopyEnd::ReadFailed(err.to_string());
				}
			};
			let text = decoder.decode(&buf[..read]);
			if text.is_empty() {
				continue;
			}
			if writer.send(&ServerMessage::PtyOutput(text)).await.is_err() {
				return CopyEnd::ChannelClosed;
			}
		}
	})
}

/// Holds the shell's input stream once it exists.
///
/// Until [`InputGate::open`] is called, input is dropped, not buffered.
#[derive(Clone)]
pub struct InputGate {
	input: Arc<Mutex<Option<ShellInput>>>,
	write_timeout: Duration,
}

impl Default for InputGate {
	fn default() -> Self {
		Self {
			input: Arc::default(),
			write_timeout: DEFAULT_INPUT_TIMEOUT,
		}
	}
}

impl InputGate {
	pub fn new() -> Self {
		Self::default()
	}

	/// Bound on one forward. A shell that stops reading stdin for longer is
	/// treated as gone.
	pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
		self.write_timeout = timeout;
		self
	}

	pub async fn open(&self, input: ShellInput) {
		*self.input.lock().await = Some(input);
	}

	/// Write `data` to the shell. Returns `false` if the gate is not open yet and
	/// the data was discarded.
	pub async fn forward(&self, data: &[u8]) -> Result<bool> {
		let mut guard = self.input.lock().await;
		let Some(input) = guard.as_mut() else {
			return Ok(false);
		};
		let write = async {
			input.write_all(data).await?;
			input.flush().await
		};
		match tokio::time::timeout(self.write_timeout, write).await {
			Ok(written) => written?,
			Err(_) => {
				return Err(Error::InputStalled {
					waited: self.write_timeout,
				});
			}
		}
		Ok(true)
	}

	/// Shut the input stream down. Later forwards are discarded.
	pub async fn close(&self) {
		let input = self.input.lock().await.take();
		if let Some(mut input) = input {
			if let Err(err) = input.shutdown().await {
				debug!(target = "chaoslab.bridge", error = %err, "closing shell input failed");
			}
		}
	}
}

/// Incremental UTF-8 decoder that holds back an incomplete trailing sequence
/// until the next chunk arrives.
#[derive(Debug, Default)]
struct Utf8Carry {
	pending: Vec<u8>,
}

impl Utf8Carry {
	fn decode(&mut self, chunk: &[u8]) -> String {
		self.pending.extend_from_slice(chunk);
		let mut text = String::new();
		loop {
			match std::str::from_utf8(&self.pending) {
				Ok(valid) => {
					text.push_str(valid);
					self.pending.clear();
					return text;
				}
				Err(err) => {
					let valid = err.valid_up_to();
					text.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
					match err.error_len() {
						Some(bad) => {
							text.push(char::REPLACEMENT_CHARACTER);
							self.pending.drain(..valid + bad);
						}
						None => {
							self.pending.drain(..valid);
							return text;
						}
					}
				}
			}
		}
	}

	fn finish(&mut self) -> String {
		let tail = String::from_utf8_lossy(&self.pending).into_owned();
		self.pending.clear();
		tail
	}
}
