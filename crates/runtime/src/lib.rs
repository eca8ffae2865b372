//! Session lifecycle core for chaoslab.
//!
//! A client connection asks for a scenario, the [`pipeline`] provisions it with an
//! external infrastructure tool, the [`bridge`] attaches an interactive shell to
//! the resulting host, and [`teardown`] destroys the environment exactly once when
//! the client leaves or the [`watcher`] finds the session expired.
//!
//! All session state lives in a [`store::SessionStore`]; nothing here keeps an
//! in-process registry of sessions.

pub mod bridge;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod pipeline;
pub mod session;
pub mod store;
pub mod teardown;
pub mod tool;
pub mod watcher;
pub mod writer;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::LabConfig;
pub use connection::ConnectionHandler;
pub use context::LabContext;
pub use error::{Error, ErrorClass, Result};
pub use session::{Session, SessionId, SessionStatus};
pub use store::{SessionStore, SqliteSessionStore};
pub use teardown::{Teardown, TeardownOutcome};
pub use watcher::ExpiryWatcher;
pub use writer::{ChannelWriter, MessageSink};
