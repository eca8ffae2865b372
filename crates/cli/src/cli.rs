use std::path::PathBuf;

use chaoslab_runtime::SessionStatus;
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "chaoslab")]
#[command(about = "On-demand chaos lab environments behind a browser terminal")]
#[command(version)]
pub struct Cli {
	/// Increase verbosity (-v info, -vv debug)
	#[arg(short, long, global = true, action = clap::ArgAction::Count)]
	pub verbose: u8,

	/// Configuration file (default: <config dir>/chaoslab/config.json)
	#[arg(short, long, global = true, value_name = "FILE")]
	pub config: Option<PathBuf>,

	#[command(subcommand)]
	pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
	/// Serve the terminal websocket and sweep expired sessions
	Serve {
		/// Listen address (overrides the config file)
		#[arg(long)]
		host: Option<String>,

		/// Listen port (overrides the config file)
		#[arg(short, long)]
		port: Option<u16>,
	},

	/// List recorded sessions, newest first
	Sessions {
		/// Only sessions in this state (e.g. active, destroy_failed)
		#[arg(long, value_name = "STATUS")]
		status: Option<SessionStatus>,

		/// Print JSON instead of a table
		#[arg(long)]
		json: bool,
	},

	/// List scenarios available to clients
	Scenarios,
}
