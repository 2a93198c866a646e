//! wsio - event-multiplexed WebSocket channels
//!
//! One WebSocket connection carries any number of named events. Both ends
//! hold an event registry, frames on the wire are JSON arrays of the shape
//! `["event", ...args]`, and the reserved `connect`, `disconnect` and
//! `error` events report the connection lifecycle.
//!
//! The moving parts:
//! 1. [`EventRegistry`] keeps ordered listener lists per event name, with
//!    persistent and one-shot registration.
//! 2. [`Channel`] is the client end. It dials `{ws|wss}://{host}/wsio/` in
//!    the background and multiplexes events over the socket; lifecycle
//!    events are latched for listeners registered after the fact, and
//!    while disconnected, emits are dropped silently.
//! 3. [`Server`] accepts upgrades on the same path and hands every
//!    connection to the application as a [`Peer`] with the same event
//!    surface as the client.
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde_json::{json, Value};
//! use wsio::{Channel, ChannelConfig};
//!
//! # async fn demo() {
//! let channel = Channel::connect(ChannelConfig::default());
//! channel.on(
//!     "connect",
//!     Arc::new(|_: &[Value]| {
//!         println!("connected");
//!     }),
//! );
//! channel.on(
//!     "chat",
//!     Arc::new(|args: &[Value]| {
//!         println!("chat: {:?}", args);
//!     }),
//! );
//! channel.emit("chat", &[json!("hello"), json!(42)]);
//! # }
//! ```

pub mod channel;
pub mod config;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod server;

pub use channel::{Channel, ChannelState};
pub use config::{
    ChannelConfig, ServerConfig, DEFAULT_HEARTBEAT_MS, DEFAULT_PATH, DEFAULT_TIMEOUT_MS,
};
pub use error::{Result, WsioError};
pub use protocol::{Frame, RESERVED_EVENTS};
pub use registry::{EventRegistry, Listener, ListenerHandle};
pub use server::{ConnectionHandler, Peer, Server};
