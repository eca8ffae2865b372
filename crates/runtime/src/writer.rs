//! Single outbound path to a client.
//!
//! Every producer (provisioning output, shell output, handler notices) holds a
//! clone of the same [`ChannelWriter`]. Sends are serialized behind one async
//! mutex, so a frame is always written whole before the next one starts.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chaoslab_protocol::ServerMessage;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use crate::error::{Error, Result};

/// Transport half that accepts one text frame at a time.
#[async_trait]
pub trait MessageSink: Send {
	async fn send_text(&mut self, text: String) -> Result<()>;

	/// Close the transport. Called at most once.
	async fn close(&mut self) -> Result<()>;
}

#[async_trait]
impl MessageSink for mpsc::UnboundedSender<String> {
	async fn send_text(&mut self, text: String) -> Result<()> {
		self.send(text).map_err(|_| Error::ChannelClosed)
	}

	async fn close(&mut self) -> Result<()> {
		Ok(())
	}
}

/// Cloneable, mutex-guarded writer over one [`MessageSink`].
#[derive(Clone)]
pub struct ChannelWriter {
	sink: Arc<Mutex<Option<Box<dyn MessageSink>>>>,
	closed: Arc<AtomicBool>,
}

impl ChannelWriter {
	pub fn new(sink: impl MessageSink + 'static) -> Self {
		Self {
			sink: Arc::new(Mutex::new(Some(Box::new(sink)))),
			closed: Arc::new(AtomicBool::new(false)),
		}
	}

	/// Serialize `message` and write it as one frame.
	///
	/// Fails with [`Error::ChannelClosed`] once any earlier write has failed or
	/// the writer was closed; callers should stop producing at that point.
	pub async fn send(&self, message: &ServerMessage) -> Result<()> {
		if self.is_closed() {
			return Err(Error::ChannelClosed);
		}
		let text = serde_json::to_string(message)?;

		let mut guard = self.sink.lock().await;
		let Some(sink) = guard.as_mut() else {
			return Err(Error::ChannelClosed);
		};
		if let Err(err) = sink.send_text(text).await {
			debug!(target = "chaoslab.writer", kind = message.kind(), error = %err, "client write failed");
			self.closed.store(true, Ordering::Release);
			guard.take();
			return Err(Error::ChannelClosed);
		}
		Ok(())
	}

	/// Close the underlying sink. Later calls are no-ops.
	pub async fn close(&self) {
		self.closed.store(true, Ordering::Release);
		let sink = self.sink.lock().await.take();
		if let Some(mut sink) = sink {
			if let Err(err) = sink.close().await {
				debug!(target = "chaoslab.writer", error = %err, "closing client channel failed");
			}
		}
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::Acquire)
	}
}
