//! Wire types for the chaoslab terminal channel.
//!
//! Every frame on the client websocket is one JSON envelope of the shape
//! `{ "type": string, "payload": string? }`. [`ClientMessage`] covers the frames a
//! browser sends, [`ServerMessage`] the frames the server emits.
//!
//! Types in this crate are pure data: no behavior beyond serialization.

pub mod terminal;

pub use terminal::*;
