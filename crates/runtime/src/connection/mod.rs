//! Per-connection session state machine.
//!
//! A connection moves `idle -> provisioning -> active -> terminated`. The message
//! loop only ever reacts: provisioning and dialing run in a spawned task that
//! reports back over an event channel, and the shell output copier's completion
//! is itself an event. On termination the connection's session, if any, is
//! handed to a detached claim-and-teardown.

use std::any::Any;
use std::path::{Path, PathBuf};

use chaoslab_protocol::{ClientMessage, ServerMessage, SessionStatusReport, StatusToken};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bridge::{CopyEnd, InputGate, RemoteShell, dial, spawn_output_copier};
use crate::context::LabContext;
use crate::error::{Error, ErrorClass, Result};
use crate::session::{NewSession, SessionId, SessionStatus};
use crate::writer::ChannelWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
	Idle,
	Provisioning,
	Active,
	Terminated,
}

impl ConnectionState {
	pub fn as_str(self) -> &'static str {
		match self {
			ConnectionState::Idle => "idle",
			ConnectionState::Provisioning => "provisioning",
			ConnectionState::Active => "active",
			ConnectionState::Terminated => "terminated",
		}
	}
}

/// Outcome of the provisioning task.
enum ProvisionEvent {
	Ready(RemoteShell),
	Failed(Error),
}

enum Wake {
	Frame(Option<String>),
	Provision(ProvisionEvent),
	ShellEnded(CopyEnd),
	IdleTimeout,
}

pub struct ConnectionHandler {
	ctx: LabContext,
	writer: ChannelWriter,
	owner: String,
	state: ConnectionState,
	session: Option<SessionId>,
	gate: InputGate,
	provisioning: Option<JoinHandle<()>>,
	copier: Option<JoinHandle<CopyEnd>>,
	transport: Option<Box<dyn Any + Send>>,
	events_tx: mpsc::UnboundedSender<ProvisionEvent>,
	events: mpsc::UnboundedReceiver<ProvisionEvent>,
}

impl ConnectionHandler {
	pub fn new(ctx: LabContext, writer: ChannelWriter, owner: impl Into<String>) -> Self {
		let (events_tx, events) = mpsc::unbounded_channel();
		Self {
			ctx,
			writer,
			owner: owner.into(),
			state: ConnectionState::Idle,
			session: None,
			gate: InputGate::new(),
			provisioning: None,
			copier: None,
			transport: None,
			events_tx,
			events,
		}
	}

	/// Serve the connection until it terminates.
	///
	/// `inbound` yields client text frames and ends when the client goes away.
	/// Returns the detached teardown task for this connection's session, if one
	/// was started; callers are free to drop it.
	pub async fn run<S>(mut self, mut inbound: S) -> Option<JoinHandle<()>>
	where
		S: Stream<Item = String> + Unpin + Send,
	{
		info!(target = "chaoslab.connection", owner = %self.owner, "client connected");
		if self.writer.send(&ServerMessage::Status(StatusToken::Connected)).await.is_err() {
			return self.terminate("client channel closed").await;
		}

		let idle_timeout = self.ctx.idle_timeout;
		let idle = tokio::time::sleep(idle_timeout);
		tokio::pin!(idle);

		let reason = loop {
			let wake = tokio::select! {
				frame = inbound.next() => Wake::Frame(frame),
				Some(event) = self.events.recv() => Wake::Provision(event),
				end = wait_for_copier(&mut self.copier) => Wake::ShellEnded(end),
				() = &mut idle => Wake::IdleTimeout,
			};

			match wake {
				Wake::Frame(None) => break "client disconnected",
				Wake::Frame(Some(text)) => {
					idle.as_mut().reset(Instant::now() + idle_timeout);
					if let Err(err) = self.on_frame(&text).await {
						if !self.report(err).await {
							break "request failed";
						}
					}
				}
				Wake::Provision(ProvisionEvent::Ready(shell)) => {
					if let Err(err) = self.attach(shell).await {
						self.report(err).await;
						break "shell attach failed";
					}
				}
				Wake::Provision(ProvisionEvent::Failed(err)) => {
					self.report(err).await;
					break "provisioning failed";
				}
				Wake::ShellEnded(end) => {
					debug!(target = "chaoslab.connection", owner = %self.owner, ?end, "output copier finished");
					break "remote shell ended";
				}
				Wake::IdleTimeout => break "idle timeout",
			}
		};

		self.terminate(reason).await
	}

	async fn on_frame(&mut self, text: &str) -> Result<()> {
		let message: ClientMessage = serde_json::from_str(text).map_err(|e| Error::MalformedMessage(e.to_string()))?;
		match message {
			ClientMessage::RunTerraform(scenario) => self.start(scenario).await,
			ClientMessage::PtyInput(data) => {
				if !self.gate.forward(data.as_bytes()).await? {
					debug!(target = "chaoslab.connection", owner = %self.owner, bytes = data.len(), "shell not ready; input discarded");
				}
				Ok(())
			}
			ClientMessage::SessionExtend => self.extend().await,
		}
	}

	async fn start(&mut self, scenario: String) -> Result<()> {
		if self.state != ConnectionState::Idle {
			return Err(Error::InvalidState {
				request: "run_terraform",
				state: self.state.as_str(),
			});
		}
		self.ctx.pipeline.resolve_scenario(&scenario)?;

		let expires_at = Utc::now()
			.checked_add_signed(self.ctx.session_ttl)
			.ok_or_else(|| Error::InvalidConfig("session ttl out of range".into()))?;
		let workdir = self.ctx.workdir_root.join(format!("session-{}", Uuid::new_v4()));
		tokio::fs::create_dir_all(&workdir).await?;

		let inserted = self
			.ctx
			.store
			.insert(NewSession {
				owner: self.owner.clone(),
				status: SessionStatus::Provisioning,
				workdir: workdir.clone(),
				expires_at,
			})
			.await;
		let (id, expires_at) = match inserted {
			Ok(inserted) => inserted,
			Err(err) => {
				remove_workdir(&workdir).await;
				return Err(err);
			}
		};
		info!(
			target = "chaoslab.connection",
			session = %id,
			owner = %self.owner,
			scenario = %scenario,
			workdir = %workdir.display(),
			"provisioning session"
		);

		self.session = Some(id.clone());
		self.state = ConnectionState::Provisioning;

		let announced = self
			.writer
			.send(&status_report(&id, expires_at, format!("provisioning scenario {scenario}")))
			.await;
		let announced = match announced {
			Ok(()) => self.writer.send(&ServerMessage::Status(StatusToken::Provisioning)).await,
			Err(err) => Err(err),
		};
		if let Err(err) = announced {
			abandon(&self.ctx, &id, &workdir).await;
			return Err(err);
		}

		let task = ProvisionTask {
			ctx: self.ctx.clone(),
			writer: self.writer.clone(),
			id,
			scenario,
			workdir,
			expires_at,
		};
		let events = self.events_tx.clone();
		self.provisioning = Some(tokio::spawn(async move {
			let _ = events.send(task.run().await);
		}));
		Ok(())
	}

	async fn extend(&mut self) -> Result<()> {
		let id = self.session.clone().ok_or(Error::NoSession)?;
		let expires_at = self.ctx.store.extend_expiry(&id, self.ctx.extend_increment).await?;
		info!(target = "chaoslab.connection", session = %id, %expires_at, "session extended");
		self.writer.send(&status_report(&id, expires_at, "session extended")).await
	}

	async fn attach(&mut self, shell: RemoteShell) -> Result<()> {
		let RemoteShell {
			output,
			input,
			transport,
		} = shell;
		self.gate.open(input).await;
		self.copier = Some(spawn_output_copier(output, self.writer.clone()));
		self.transport = transport;
		self.state = ConnectionState::Active;
		self.writer.send(&ServerMessage::Status(StatusToken::ShellReady)).await
	}

	/// Tell the client about `err`. Returns whether the connection should stay open.
	async fn report(&mut self, err: Error) -> bool {
		let session = self.session.as_ref().map(SessionId::as_str).unwrap_or("-");
		match err.class() {
			ErrorClass::Channel => return false,
			ErrorClass::Input => {
				debug!(target = "chaoslab.connection", owner = %self.owner, session, error = %err, "rejected request")
			}
			_ => warn!(target = "chaoslab.connection", owner = %self.owner, session, error = %err, "session failed"),
		}
		if self.writer.send(&ServerMessage::Error(err.to_string())).await.is_err() {
			return false;
		}
		err.keeps_connection()
	}

	async fn terminate(mut self, reason: &'static str) -> Option<JoinHandle<()>> {
		self.state = ConnectionState::Terminated;
		info!(
			target = "chaoslab.connection",
			owner = %self.owner,
			session = self.session.as_ref().map(SessionId::as_str).unwrap_or("-"),
			reason,
			"connection closing"
		);

		if let Some(copier) = self.copier.take() {
			copier.abort();
		}
		self.gate.close().await;
		self.writer.close().await;
		drop(self.transport.take());

		let id = self.session.take()?;
		let provisioning = self.provisioning.take();
		let teardown = self.ctx.teardown.clone();
		Some(tokio::spawn(async move {
			if let Some(task) = provisioning {
				if let Err(err) = task.await {
					warn!(target = "chaoslab.connection", session = %id, error = %err, "provisioning task panicked");
				}
			}
			teardown.run_logged(&id).await;
		}))
	}
}

/// Resolves when the copier ends; never, if there is none.
async fn wait_for_copier(copier: &mut Option<JoinHandle<CopyEnd>>) -> CopyEnd {
	match copier {
		Some(handle) => handle.await.unwrap_or_else(|err| CopyEnd::ReadFailed(err.to_string())),
		None => std::future::pending().await,
	}
}

fn status_report(id: &SessionId, expires_at: DateTime<Utc>, message: impl Into<String>) -> ServerMessage {
	ServerMessage::SessionStatus(SessionStatusReport {
		session_id: id.to_string(),
		expires_at: expires_at.timestamp(),
		message: Some(message.into()),
	})
}

async fn remove_workdir(workdir: &Path) {
	if let Err(err) = tokio::fs::remove_dir_all(workdir).await {
		if err.kind() != std::io::ErrorKind::NotFound {
			warn!(target = "chaoslab.connection", workdir = %workdir.display(), error = %err, "could not remove working directory");
		}
	}
}

/// Mark a session that never became active as failed and drop its working
/// directory. Skipped if the session was claimed in the meantime, since the
/// claimant owns the directory.
async fn abandon(ctx: &LabContext, id: &SessionId, workdir: &Path) {
	match ctx.store.transition(id, SessionStatus::Provisioning, SessionStatus::Failed).await {
		Ok(true) => remove_workdir(workdir).await,
		Ok(false) => debug!(target = "chaoslab.connection", session = %id, "session claimed before it could be marked failed"),
		Err(err) => warn!(
			target = "chaoslab.connection",
			session = %id,
			workdir = %workdir.display(),
			error = %err,
			"could not mark session failed"
		),
	}
}

/// Provision, activate, and dial one session.
struct ProvisionTask {
	ctx: LabContext,
	writer: ChannelWriter,
	id: SessionId,
	scenario: String,
	workdir: PathBuf,
	expires_at: DateTime<Utc>,
}

impl ProvisionTask {
	async fn run(self) -> ProvisionEvent {
		match self.provision().await {
			Ok(shell) => ProvisionEvent::Ready(shell),
			Err(err) => ProvisionEvent::Failed(err),
		}
	}

	async fn provision(&self) -> Result<RemoteShell> {
		let artifacts = match self.ctx.pipeline.run(&self.scenario, &self.workdir, &self.writer).await {
			Ok(artifacts) => artifacts,
			Err(err) => {
				abandon(&self.ctx, &self.id, &self.workdir).await;
				return Err(err);
			}
		};

		let store = &self.ctx.store;
		if !store.transition(&self.id, SessionStatus::Provisioning, SessionStatus::Active).await? {
			return Err(match store.get(&self.id).await? {
				Some(session) => Error::SessionNotActive {
					id: self.id.clone(),
					status: session.status,
				},
				None => Error::SessionNotFound(self.id.clone()),
			});
		}
		info!(target = "chaoslab.connection", session = %self.id, host = %artifacts.host, "session active");
		self.writer
			.send(&status_report(&self.id, self.expires_at, "environment ready"))
			.await?;

		let target = self.ctx.shell.target(artifacts.host, artifacts.credential);
		dial(self.ctx.connector.as_ref(), &target, &self.ctx.dial, &self.writer).await
	}
}

#[cfg(all(test, unix))]
mod tests;
