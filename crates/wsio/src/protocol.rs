//! Wire protocol for wsio channels
//!
//! Every frame, in both directions, is a JSON array whose first element is
//! the event name and whose remaining elements are the positional
//! arguments: `["chat", "hello", 42]`. That array is the whole framing
//! contract. No compression, no binary mode, no sub-protocol negotiation.

use serde_json::Value;

use crate::error::{Result, WsioError};

/// Lifecycle event emitted when the transport opens.
pub const CONNECT: &str = "connect";

/// Lifecycle event emitted when the transport closes.
pub const DISCONNECT: &str = "disconnect";

/// Lifecycle event emitted on a transport failure, right before
/// [`DISCONNECT`].
pub const ERROR: &str = "error";

/// Event names owned by the channel lifecycle. Application code cannot emit
/// them, and inbound frames carrying them are dropped.
pub const RESERVED_EVENTS: [&str; 3] = [CONNECT, DISCONNECT, ERROR];

/// True if `event` is one of the reserved lifecycle names.
pub fn is_reserved(event: &str) -> bool {
    RESERVED_EVENTS.contains(&event)
}

/// One complete unit of data on the wire: an event name plus its positional
/// arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub event: String,
    pub args: Vec<Value>,
}

impl Frame {
    pub fn new(event: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            event: event.into(),
            args,
        }
    }

    /// Serialize as the `[event, ...args]` JSON array.
    pub fn encode(&self) -> Result<String> {
        let mut items = Vec::with_capacity(self.args.len() + 1);
        items.push(Value::String(self.event.clone()));
        items.extend(self.args.iter().cloned());
        Ok(serde_json::to_string(&Value::Array(items))?)
    }

    /// Parse a text frame back into an event name and argument list.
    pub fn decode(text: &str) -> Result<Self> {
        let items = match serde_json::from_str(text)? {
            Value::Array(items) => items,
            _ => return Err(WsioError::FrameNotArray),
        };
        let mut items = items.into_iter();
        let event = match items.next() {
            Some(Value::String(event)) => event,
            _ => return Err(WsioError::MissingEventName),
        };
        Ok(Self {
            event,
            args: items.collect(),
        })
    }
}
