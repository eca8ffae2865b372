//! SSH transport for the shell bridge, built on russh.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, AuthResult, Handle};
use russh::keys::{PrivateKeyWithHashAlg, decode_secret_key};
use tracing::debug;

use super::{RemoteShell, ShellConnector, ShellTarget};
use crate::error::{Error, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Key-authenticated SSH connector. Host keys are accepted as presented.
#[derive(Clone)]
pub struct SshConnector {
	config: Arc<client::Config>,
}

impl Default for SshConnector {
	fn default() -> Self {
		Self::new()
	}
}

impl SshConnector {
	pub fn new() -> Self {
		let config = client::Config {
			keepalive_interval: Some(KEEPALIVE_INTERVAL),
			..client::Config::default()
		};
		Self { config: Arc::new(config) }
	}
}

struct LabHost {
	host: String,
}

impl client::Handler for LabHost {
	type Error = russh::Error;

	async fn check_server_key(&mut self, server_public_key: &russh::keys::PublicKey) -> std::result::Result<bool, Self::Error> {
		debug!(
			target = "chaoslab.bridge",
			host = %self.host,
			key_type = ?server_public_key.algorithm(),
			"accepting host key"
		);
		Ok(true)
	}
}

#[async_trait]
impl ShellConnector for SshConnector {
	async fn connect(&self, target: &ShellTarget) -> Result<RemoteShell> {
		let dial_error = |message: String| Error::Dial {
			host: target.host.clone(),
			message,
		};
		let setup_error = |message: String| Error::ShellSetup {
			host: target.host.clone(),
			message,
		};

		let pem = tokio::fs::read_to_string(&target.key_path)
			.await
			.map_err(|e| setup_error(format!("reading private key {}: {e}", target.key_path.display())))?;
		let key = decode_secret_key(&pem, None).map_err(|e| setup_error(format!("invalid private key: {e}")))?;

		let handler = LabHost {
			host: target.host.clone(),
		};
		let addr = (target.host.as_str(), target.port);
		let mut session: Handle<LabHost> =
			tokio::time::timeout(CONNECT_TIMEOUT, client::connect(Arc::clone(&self.config), addr, handler))
				.await
				.map_err(|_| dial_error(format!("timed out after {}s", CONNECT_TIMEOUT.as_secs())))?
				.map_err(|e| dial_error(e.to_string()))?;

		let hash_alg = session
			.best_supported_rsa_hash()
			.await
			.map_err(|e| dial_error(e.to_string()))?
			.flatten();
		let auth = session
			.authenticate_publickey(&target.user, PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
			.await
			.map_err(|e| dial_error(e.to_string()))?;
		if let AuthResult::Failure { remaining_methods, .. } = auth {
			return Err(dial_error(format!(
				"public key rejected for {} (remaining methods: {remaining_methods:?})",
				target.user
			)));
		}

		let channel = session
			.channel_open_session()
			.await
			.map_err(|e| setup_error(format!("opening session channel: {e}")))?;
		channel
			.request_pty(false, &target.term, target.cols, target.rows, 0, 0, &[])
			.await
			.map_err(|e| setup_error(format!("requesting pty: {e}")))?;
		channel
			.request_shell(false)
			.await
			.map_err(|e| setup_error(format!("starting shell: {e}")))?;
		debug!(
			target = "chaoslab.bridge",
			host = %target.host,
			term = %target.term,
			cols = target.cols,
			rows = target.rows,
			"shell started"
		);

		let (output, input) = tokio::io::split(channel.into_stream());
		Ok(RemoteShell::new(output, input).with_transport(session))
	}
}
