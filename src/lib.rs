//! Newline-delimited JSON chat relay over TCP.
//!
//! Clients join under a unique name, then send messages to everyone or to
//! one named user. The server keeps the only copy of who is online.
//!
//! - [`codec`] splits the byte stream into frames and encodes outbound ones.
//! - [`protocol`] defines the envelopes and their validation rules.
//! - [`registry`] maps online names to connection handles.
//! - [`router`] delivers chat, directed sends and online lists.
//! - [`conn`] runs the per-connection join handshake and read loop.
//! - [`server`] accepts connections and handles shutdown.
//! - [`admin`] answers operator requests on a separate port.

pub mod admin;
pub mod codec;
pub mod config;
pub mod conn;
pub mod error;
pub mod limit;
pub mod peer;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;
pub mod state;
