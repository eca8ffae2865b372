//! HTTP listener: health check, scenario endpoints, and the terminal websocket.

use std::future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::http::{Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chaoslab_protocol::TERMINAL_PATH;
use chaoslab_runtime::{ChannelWriter, ConnectionHandler, LabConfig, LabContext, MessageSink, SqliteSessionStore};
use futures::stream::{BoxStream, SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

#[derive(Clone)]
struct AppState {
	ctx: LabContext,
	/// One token per open terminal; the tracker is empty once every
	/// connection's teardown has finished.
	connections: TaskTracker,
	/// Cancelled when the listener stops, which ends every terminal's inbound
	/// stream.
	closing: CancellationToken,
}

fn router(state: AppState) -> Router {
	let cors = CorsLayer::new()
		.allow_origin(Any)
		.allow_methods([Method::GET, Method::POST, Method::OPTIONS])
		.allow_headers([header::CONTENT_TYPE]);

	Router::new()
		.route("/", get(|| async { "OK" }))
		.route("/api/scenarios", get(list_scenarios).post(start_scenario))
		.route(TERMINAL_PATH, get(terminal))
		.layer(cors)
		.with_state(state)
}

/// Serve on `listener` until `shutdown` resolves.
///
/// Open terminals are then closed as if their clients had left, and this only
/// returns once their sessions have been torn down.
pub async fn serve<F>(listener: TcpListener, ctx: LabContext, shutdown: F) -> Result<()>
where
	F: Future<Output = ()> + Send + 'static,
{
	let addr = listener.local_addr().context("Listener has no local address")?;
	info!(target = "chaoslab.server", %addr, path = TERMINAL_PATH, "serving terminal");

	let state = AppState {
		ctx,
		connections: TaskTracker::new(),
		closing: CancellationToken::new(),
	};
	let connections = state.connections.clone();
	let closing = state.closing.clone();

	let served = axum::serve(listener, router(state).into_make_service_with_connect_info::<SocketAddr>())
		.with_graceful_shutdown(shutdown)
		.await
		.context("Terminal server error");

	closing.cancel();
	connections.close();
	if !connections.is_empty() {
		info!(
			target = "chaoslab.server",
			open = connections.len(),
			"waiting for open terminals to tear down"
		);
	}
	connections.wait().await;
	served
}

/// Open the store, start the expiry watcher, and serve until Ctrl+C.
pub async fn run_server(config: &LabConfig) -> Result<()> {
	std::fs::create_dir_all(&config.workdir_root).with_context(|| {
		format!("Failed to create working directory root {}", config.workdir_root.display())
	})?;
	let store = SqliteSessionStore::open(&config.database)
		.with_context(|| format!("Failed to open session store {}", config.database.display()))?;
	let ctx = LabContext::from_config(config, Arc::new(store));

	let listener = TcpListener::bind((config.host.as_str(), config.port))
		.await
		.with_context(|| format!("Failed to bind terminal server to {}:{}", config.host, config.port))?;

	let (shutdown_tx, shutdown_rx) = watch::channel(false);
	let watcher = tokio::spawn(ctx.watcher(config.watch_interval()).run(shutdown_rx));

	let result = serve(listener, ctx, async {
		if let Err(err) = tokio::signal::ctrl_c().await {
			warn!(target = "chaoslab.server", error = %err, "cannot listen for Ctrl+C");
			future::pending::<()>().await;
		}
		info!(target = "chaoslab.server", "received Ctrl+C, shutting down");
	})
	.await;

	let _ = shutdown_tx.send(true);
	if let Err(err) = watcher.await {
		warn!(target = "chaoslab.server", error = %err, "expiry watcher task failed");
	}
	result
}

async fn list_scenarios(State(state): State<AppState>) -> Response {
	match state.ctx.pipeline.scenarios() {
		Ok(scenarios) => Json(json!({
			"scenarios": scenarios,
			"websocketPath": TERMINAL_PATH,
		}))
		.into_response(),
		Err(err) => {
			warn!(target = "chaoslab.server", error = %err, "failed to list scenarios");
			(StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": err.to_string() }))).into_response()
		}
	}
}

#[derive(Debug, Deserialize)]
struct StartRequest {
	repo: String,
}

/// Check that a scenario exists and tell the client where to open its terminal.
/// Provisioning itself starts with `run_terraform` on that websocket.
async fn start_scenario(State(state): State<AppState>, Json(request): Json<StartRequest>) -> Response {
	match state.ctx.pipeline.resolve_scenario(&request.repo) {
		Ok(_) => Json(json!({
			"message": "Scenario ready to start",
			"scenario": request.repo,
			"websocketPath": TERMINAL_PATH,
		}))
		.into_response(),
		Err(err) => (StatusCode::NOT_FOUND, Json(json!({ "error": err.to_string() }))).into_response(),
	}
}

async fn terminal(
	ws: WebSocketUpgrade,
	ConnectInfo(peer): ConnectInfo<SocketAddr>,
	State(state): State<AppState>,
) -> Response {
	let open = state.connections.token();
	let AppState { ctx, closing, .. } = state;
	ws.on_upgrade(move |socket| async move {
		handle_terminal(socket, ctx, peer, closing).await;
		drop(open);
	})
}

async fn handle_terminal(socket: WebSocket, ctx: LabContext, peer: SocketAddr, closing: CancellationToken) {
	info!(target = "chaoslab.server", %peer, "terminal client connected");

	let (ws_tx, ws_rx) = socket.split();
	let writer = ChannelWriter::new(WsSink(ws_tx));
	let inbound = inbound_frames(ws_rx, peer).take_until(closing.cancelled_owned()).boxed();
	let teardown = ConnectionHandler::new(ctx, writer, peer.to_string()).run(inbound).await;

	info!(target = "chaoslab.server", %peer, "terminal client disconnected");
	if let Some(teardown) = teardown {
		if let Err(err) = teardown.await {
			warn!(target = "chaoslab.server", %peer, error = %err, "teardown task failed");
		}
	}
}

/// Text frames until the client closes or the socket errors.
fn inbound_frames(ws_rx: SplitStream<WebSocket>, peer: SocketAddr) -> BoxStream<'static, String> {
	ws_rx
		.take_while(move |msg| {
			let open = match msg {
				Ok(Message::Close(_)) => false,
				Ok(_) => true,
				Err(err) => {
					warn!(target = "chaoslab.server", %peer, error = %err, "terminal websocket error");
					false
				}
			};
			future::ready(open)
		})
		.filter_map(|msg| {
			future::ready(match msg {
				Ok(Message::Text(text)) => Some(text.as_str().to_owned()),
				_ => None,
			})
		})
		.boxed()
}

struct WsSink(SplitSink<WebSocket, Message>);

#[async_trait]
impl MessageSink for WsSink {
	async fn send_text(&mut self, text: String) -> chaoslab_runtime::Result<()> {
		self.0
			.send(Message::Text(text.into()))
			.await
			.map_err(|_| chaoslab_runtime::Error::ChannelClosed)
	}

	async fn close(&mut self) -> chaoslab_runtime::Result<()> {
		self.0.close().await.map_err(|_| chaoslab_runtime::Error::ChannelClosed)
	}
}
