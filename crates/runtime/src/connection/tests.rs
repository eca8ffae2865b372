use std::time::Duration;

use chaoslab_protocol::{ClientMessage, ServerMessage, StatusToken};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::*;
use crate::session::Session;
use crate::test_support::{
	APPLY_FAILS, APPLY_OK, DESTROY_OK, FakeConnector, SCENARIO, channel, invocations, next_matching, received, test_context,
};

const OWNER: &str = "198.51.100.4:52114";

struct Client {
	frames: mpsc::UnboundedSender<String>,
	messages: mpsc::UnboundedReceiver<String>,
	handler: JoinHandle<Option<JoinHandle<()>>>,
}

impl Client {
	fn connect(ctx: &LabContext) -> Self {
		let (writer, messages) = channel();
		let (frames, inbound) = mpsc::unbounded_channel();
		let handler = tokio::spawn(ConnectionHandler::new(ctx.clone(), writer, OWNER).run(UnboundedReceiverStream::new(inbound)));
		Self { frames, messages, handler }
	}

	fn send(&self, message: ClientMessage) {
		self.frames.send(serde_json::to_string(&message).unwrap()).unwrap();
	}

	async fn closed(self) -> (Vec<ServerMessage>, Option<JoinHandle<()>>) {
		let Client {
			frames,
			mut messages,
			handler,
		} = self;
		let teardown = tokio::time::timeout(Duration::from_secs(30), handler)
			.await
			.expect("handler should finish")
			.unwrap();
		drop(frames);
		(received(&mut messages), teardown)
	}
}

async fn only_session(ctx: &LabContext) -> Session {
	let mut sessions = ctx.store.list(None).await.unwrap();
	assert_eq!(sessions.len(), 1);
	sessions.remove(0)
}

fn errors(messages: &[ServerMessage]) -> Vec<&str> {
	messages
		.iter()
		.filter_map(|message| match message {
			ServerMessage::Error(text) => Some(text.as_str()),
			_ => None,
		})
		.collect()
}

#[tokio::test]
async fn test_apply_failure_marks_session_failed_without_dialing() {
	let temp = TempDir::new().unwrap();
	let (connector, _remotes) = FakeConnector::new(0);
	let (ctx, log) = test_context(temp.path(), APPLY_FAILS, DESTROY_OK, connector.clone());

	let client = Client::connect(&ctx);
	client.send(ClientMessage::RunTerraform(SCENARIO.into()));
	let (messages, teardown) = client.closed().await;
	teardown.expect("a session was started").await.unwrap();

	let errors = errors(&messages);
	assert_eq!(errors.len(), 1, "messages: {messages:?}");
	assert!(errors[0].starts_with("apply failed"), "error was {}", errors[0]);
	assert!(matches!(messages.last(), Some(ServerMessage::Error(_))));

	let session = only_session(&ctx).await;
	assert_eq!(session.status, SessionStatus::Failed);
	assert!(!session.workdir.exists());
	assert_eq!(connector.attempts(), 0);
	assert_eq!(invocations(&log), vec!["init", "apply"]);
}

#[tokio::test]
async fn test_input_errors_keep_the_connection_open() {
	let temp = TempDir::new().unwrap();
	let (ctx, log) = test_context(temp.path(), APPLY_OK, DESTROY_OK, FakeConnector::unreachable());

	let client = Client::connect(&ctx);
	client.send(ClientMessage::RunTerraform("no-such-scenario".into()));
	client.send(ClientMessage::RunTerraform("../scenarios".into()));
	client.send(ClientMessage::SessionExtend);
	client.send(ClientMessage::PtyInput("ls\n".into()));
	client.frames.send(r#"{"type":"resize","payload":"80x24"}"#.into()).unwrap();
	client.frames.send("not json".into()).unwrap();

	let mut messages = client.messages;
	let malformed = |m: &ServerMessage| matches!(m, ServerMessage::Error(text) if text.starts_with("malformed"));
	let mut seen = next_matching(&mut messages, malformed).await;
	seen.extend(next_matching(&mut messages, malformed).await);
	assert_eq!(seen[0], ServerMessage::Status(StatusToken::Connected));
	let errors = errors(&seen);
	assert_eq!(errors.len(), 5, "messages: {seen:?}");
	assert_eq!(errors[0], "unknown scenario 'no-such-scenario'");
	assert_eq!(errors[1], "unknown scenario '../scenarios'");
	assert!(errors[2].contains("no session"));

	drop(client.frames);
	let teardown = client.handler.await.unwrap();
	assert!(teardown.is_none());
	assert!(ctx.store.list(None).await.unwrap().is_empty());
	assert!(invocations(&log).is_empty());
}

#[tokio::test]
async fn test_full_session_lifecycle() {
	let temp = TempDir::new().unwrap();
	let (connector, mut remotes) = FakeConnector::new(1);
	let (ctx, log) = test_context(temp.path(), APPLY_OK, DESTROY_OK, connector.clone());

	let mut client = Client::connect(&ctx);
	client.send(ClientMessage::RunTerraform(SCENARIO.into()));
	for keys in ["early\n", "early\n", "early\n"] {
		client.send(ClientMessage::PtyInput(keys.into()));
	}

	let seen = next_matching(&mut client.messages, |m| *m == ServerMessage::Status(StatusToken::ShellReady)).await;
	let reports: Vec<_> = seen
		.iter()
		.filter_map(|m| match m {
			ServerMessage::SessionStatus(report) => Some(report.clone()),
			_ => None,
		})
		.collect();
	assert_eq!(reports.len(), 2);
	assert_eq!(reports[0].message.as_deref(), Some("provisioning scenario web-leak"));
	assert_eq!(reports[1].message.as_deref(), Some("environment ready"));
	assert!(seen.contains(&ServerMessage::Status(StatusToken::Provisioning)));
	assert!(seen.contains(&ServerMessage::PtyOutput("Apply complete! Resources: 3 added.\r\n".into())));
	assert_eq!(connector.attempts(), 2);

	let session = only_session(&ctx).await;
	assert_eq!(session.status, SessionStatus::Active);
	assert_eq!(session.owner, OWNER);
	assert_eq!(session.id.as_str(), reports[0].session_id);

	let mut remote = remotes.recv().await.unwrap();
	client.send(ClientMessage::PtyInput("uname -a\n".into()));
	let mut typed = [0u8; 9];
	remote.read_exact(&mut typed).await.unwrap();
	assert_eq!(&typed, b"uname -a\n");

	remote.write_all(b"Linux lab\r\n").await.unwrap();
	next_matching(&mut client.messages, |m| *m == ServerMessage::PtyOutput("Linux lab\r\n".into())).await;

	client.send(ClientMessage::SessionExtend);
	let seen = next_matching(&mut client.messages, |m| matches!(m, ServerMessage::SessionStatus(_))).await;
	let Some(ServerMessage::SessionStatus(extended)) = seen.last() else {
		unreachable!()
	};
	assert_eq!(extended.message.as_deref(), Some("session extended"));
	assert_eq!(extended.expires_at, reports[0].expires_at + 30 * 60);

	client.send(ClientMessage::RunTerraform(SCENARIO.into()));
	let seen = next_matching(&mut client.messages, |m| matches!(m, ServerMessage::Error(_))).await;
	assert_eq!(
		seen.last(),
		Some(&ServerMessage::Error("run_terraform is not allowed while the connection is active".into()))
	);

	drop(remote);
	let (_, teardown) = client.closed().await;
	teardown.expect("a session was started").await.unwrap();

	let session = only_session(&ctx).await;
	assert_eq!(session.status, SessionStatus::Destroyed);
	assert!(!session.workdir.exists());
	assert_eq!(invocations(&log), vec!["init", "apply", "destroy"]);
}

#[tokio::test]
async fn test_unreachable_shell_reports_once_and_tears_down() {
	let temp = TempDir::new().unwrap();
	let connector = FakeConnector::unreachable();
	let (ctx, log) = test_context(temp.path(), APPLY_OK, DESTROY_OK, connector.clone());

	let client = Client::connect(&ctx);
	client.send(ClientMessage::RunTerraform(SCENARIO.into()));
	let (messages, teardown) = client.closed().await;
	teardown.expect("a session was started").await.unwrap();

	let errors = errors(&messages);
	assert_eq!(errors.len(), 1);
	assert!(errors[0].contains("after 3 attempts"), "error was {}", errors[0]);
	assert_eq!(connector.attempts(), 3);

	let session = only_session(&ctx).await;
	assert_eq!(session.status, SessionStatus::Destroyed);
	assert_eq!(invocations(&log), vec!["init", "apply", "destroy"]);
}

#[tokio::test]
async fn test_disconnect_mid_provisioning_waits_then_tears_down() {
	let temp = TempDir::new().unwrap();
	let (connector, _remotes) = FakeConnector::new(0);
	let slow_apply = format!("sleep 1; {APPLY_OK}");
	let (ctx, log) = test_context(temp.path(), &slow_apply, DESTROY_OK, connector.clone());

	let mut client = Client::connect(&ctx);
	client.send(ClientMessage::RunTerraform(SCENARIO.into()));
	next_matching(&mut client.messages, |m| *m == ServerMessage::Status(StatusToken::Provisioning)).await;
	drop(client.messages);
	drop(client.frames);

	let teardown = client.handler.await.unwrap().expect("a session was started");
	teardown.await.unwrap();

	let session = only_session(&ctx).await;
	assert_eq!(session.status, SessionStatus::Destroyed);
	assert!(!session.workdir.exists());
	assert_eq!(invocations(&log), vec!["init", "apply", "destroy"]);
	assert_eq!(connector.attempts(), 0);
}

#[tokio::test]
async fn test_idle_connection_is_closed() {
	let temp = TempDir::new().unwrap();
	let (mut ctx, _log) = test_context(temp.path(), APPLY_OK, DESTROY_OK, FakeConnector::unreachable());
	ctx.idle_timeout = Duration::from_millis(50);

	let client = Client::connect(&ctx);
	let (messages, teardown) = client.closed().await;

	assert_eq!(messages, vec![ServerMessage::Status(StatusToken::Connected)]);
	assert!(teardown.is_none());
}
