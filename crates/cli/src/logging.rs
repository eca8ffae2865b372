use std::io::IsTerminal;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;

/// Default directives per `-v` count. `RUST_LOG` replaces them entirely.
fn default_directives(verbosity: u8) -> &'static str {
	match verbosity {
		// session lifecycle only; russh logs every handshake step at info
		0 => "warn,chaoslab_runtime=info,chaoslab_cli=info,russh=off",
		1 => "info,russh=warn",
		_ => "debug",
	}
}

pub fn init_logging(verbosity: u8) {
	let env_filter =
		EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives(verbosity)));

	let stderr = std::io::stderr.with_max_level(tracing::Level::TRACE);

	tracing_subscriber::fmt()
		.with_env_filter(env_filter)
		.with_writer(stderr)
		.with_ansi(std::io::stderr().is_terminal())
		.with_target(true)
		.with_level(true)
		.compact()
		.init();
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_every_verbosity_parses() {
		for verbosity in 0..4 {
			EnvFilter::try_new(default_directives(verbosity)).unwrap();
		}
	}
}
