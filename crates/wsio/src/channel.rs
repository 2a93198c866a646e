//! Client-side channel
//!
//! A [`Channel`] owns one WebSocket transport plus an event registry. The
//! connection is established in the background; lifecycle outcomes surface
//! through the reserved `connect`, `disconnect` and `error` events rather
//! than through call-site errors.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, WebSocketStream};
use url::Url;

use crate::config::ChannelConfig;
use crate::error::{Result, WsioError};
use crate::protocol::{self, Frame};
use crate::registry::{EventRegistry, Listener, ListenerHandle};

/// Where a channel is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    Disconnected = 0,
    Connected = 1,
}

impl ChannelState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ChannelState::Connected,
            _ => ChannelState::Disconnected,
        }
    }
}

/// Which reserved events have fired, with the arguments they carried. Each
/// fires at most once per connection (there is no reconnection), so a
/// recorded entry is final and safe to replay.
#[derive(Default)]
struct LifecycleLog {
    connect: Option<Vec<Value>>,
    error: Option<Vec<Value>>,
    disconnect: Option<Vec<Value>>,
}

impl LifecycleLog {
    fn get(&self, event: &str) -> Option<&Vec<Value>> {
        match event {
            protocol::CONNECT => self.connect.as_ref(),
            protocol::ERROR => self.error.as_ref(),
            protocol::DISCONNECT => self.disconnect.as_ref(),
            _ => None,
        }
    }

    fn record(&mut self, event: &str, args: &[Value]) {
        let slot = match event {
            protocol::CONNECT => &mut self.connect,
            protocol::ERROR => &mut self.error,
            protocol::DISCONNECT => &mut self.disconnect,
            _ => return,
        };
        *slot = Some(args.to_vec());
    }
}

/// State shared by the client [`Channel`] and a server-side peer: the
/// listener registry, the lifecycle latch, the outbound queue feeding the
/// writer task, and the shutdown trigger for the socket loop.
pub(crate) struct ChannelCore {
    state: AtomicU8,
    registry: EventRegistry,
    lifecycle: Mutex<LifecycleLog>,
    outbound: mpsc::UnboundedSender<Message>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    heartbeat: Duration,
    timeout: Duration,
}

impl ChannelCore {
    pub(crate) fn new(
        heartbeat: Duration,
        timeout: Duration,
    ) -> (
        Arc<Self>,
        mpsc::UnboundedReceiver<Message>,
        oneshot::Receiver<()>,
    ) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let core = Arc::new(Self {
            state: AtomicU8::new(ChannelState::Disconnected as u8),
            registry: EventRegistry::new(),
            lifecycle: Mutex::new(LifecycleLog::default()),
            outbound: outbound_tx,
            shutdown: Mutex::new(Some(shutdown_tx)),
            heartbeat,
            timeout,
        });
        (core, outbound_rx, shutdown_rx)
    }

    pub(crate) fn registry(&self) -> &EventRegistry {
        &self.registry
    }

    pub(crate) fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: ChannelState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    /// Register a listener for `event`. A reserved event that already fired
    /// is replayed to the listener immediately, so registration cannot race
    /// the background socket task.
    pub(crate) fn on(&self, event: String, listener: Listener) -> ListenerHandle {
        self.add_listener(event, listener, false)
    }

    /// One-shot variant of [`Self::on`], with the same replay behavior.
    pub(crate) fn once(&self, event: String, listener: Listener) -> ListenerHandle {
        self.add_listener(event, listener, true)
    }

    fn add_listener(&self, event: String, listener: Listener, once: bool) -> ListenerHandle {
        if !protocol::is_reserved(&event) {
            return if once {
                self.registry.once(event, listener)
            } else {
                self.registry.on(event, listener)
            };
        }

        // Registration serializes with lifecycle emission on the log, so
        // the listener lands either in a dispatch snapshot or in the
        // replay, never in neither.
        let log = self
            .lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match log.get(&event) {
            Some(args) => {
                let args = args.clone();
                // A fired lifecycle event never fires again; a one-shot is
                // satisfied by the replay alone.
                let handle = if once {
                    ListenerHandle::dangling()
                } else {
                    self.registry.on(event, Arc::clone(&listener))
                };
                drop(log);
                listener(&args);
                handle
            }
            None => {
                if once {
                    self.registry.once(event, listener)
                } else {
                    self.registry.on(event, listener)
                }
            }
        }
    }

    /// Queue an event frame for the writer task. Reserved names are
    /// rejected, and emitting while disconnected drops the frame silently.
    pub(crate) fn emit(&self, event: &str, args: &[Value]) {
        if protocol::is_reserved(event) {
            tracing::warn!("Cannot emit reserved event \"{}\"", event);
            return;
        }
        if !self.is_connected() {
            tracing::trace!("Dropping \"{}\": channel is disconnected", event);
            return;
        }
        match Frame::new(event, args.to_vec()).encode() {
            Ok(text) => {
                let _ = self.outbound.send(Message::Text(text));
            }
            Err(e) => tracing::warn!("Failed to encode \"{}\": {}", event, e),
        }
    }

    /// Decode an inbound text frame and dispatch it to listeners. Frames
    /// carrying a reserved name are spoofing the lifecycle and are refused.
    pub(crate) fn handle_frame(&self, text: &str) -> Result<()> {
        let frame = Frame::decode(text)?;
        if protocol::is_reserved(&frame.event) {
            return Err(WsioError::Reserved(frame.event));
        }
        self.registry.emit(&frame.event, &frame.args);
        Ok(())
    }

    /// Ask the socket loop to shut down. Idempotent.
    pub(crate) fn close(&self) {
        let mut slot = self
            .shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = slot.take() {
            let _ = tx.send(());
        }
    }

    /// Emit a reserved event: record it in the latch, then dispatch. The
    /// snapshot is taken under the log lock so it pairs exactly with
    /// [`Self::add_listener`]'s check, while invocation happens outside it.
    pub(crate) fn emit_lifecycle(&self, event: &str, args: &[Value]) {
        let snapshot = {
            let mut log = self
                .lifecycle
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            log.record(event, args);
            self.registry.snapshot(event)
        };
        for listener in snapshot {
            listener(args);
        }
    }

    pub(crate) fn emit_error(&self, message: &str) {
        self.emit_lifecycle(protocol::ERROR, &[Value::String(message.to_string())]);
    }

    /// Run the socket until it closes: dispatch inbound frames, drain the
    /// outbound queue through a writer task, ping on the heartbeat interval
    /// and drop the connection when the peer goes silent past the timeout.
    ///
    /// Emits `disconnect` exactly once on the way out, whatever ended the
    /// loop.
    pub(crate) async fn drive<S>(
        &self,
        socket: WebSocketStream<S>,
        mut outbound_rx: mpsc::UnboundedReceiver<Message>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut stream) = socket.split();
        let mut writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = sink.send(message).await {
                    tracing::warn!("Write failed: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        // Zero would panic in tokio's interval; clamp and let timeout_ms
        // stay the knob that disables liveness checks.
        let mut ping = tokio::time::interval(self.heartbeat.max(Duration::from_millis(1)));
        let mut last_seen = Instant::now();
        let mut local_close = false;

        loop {
            tokio::select! {
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        last_seen = Instant::now();
                        if let Err(e) = self.handle_frame(&text) {
                            tracing::warn!("Dropping inbound frame: {}", e);
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        last_seen = Instant::now();
                        let _ = self.outbound.send(Message::Pong(payload));
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_seen = Instant::now();
                    }
                    Some(Ok(Message::Binary(_))) => {
                        last_seen = Instant::now();
                        tracing::warn!("Dropping binary frame: the protocol is text-only");
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!("Socket error: {}", e);
                        self.emit_error(&e.to_string());
                        break;
                    }
                },
                _ = ping.tick() => {
                    if !self.timeout.is_zero() && last_seen.elapsed() >= self.timeout {
                        tracing::warn!("Peer silent for {:?}, dropping connection", self.timeout);
                        self.emit_error("heartbeat timeout");
                        break;
                    }
                    let _ = self.outbound.send(Message::Ping(Vec::new()));
                }
                _ = &mut shutdown_rx => {
                    let _ = self.outbound.send(Message::Close(None));
                    local_close = true;
                    break;
                }
            }
        }

        self.set_state(ChannelState::Disconnected);
        if local_close {
            // Give the writer a beat to flush the close frame.
            if tokio::time::timeout(Duration::from_secs(1), &mut writer)
                .await
                .is_err()
            {
                writer.abort();
            }
        } else {
            writer.abort();
        }
        self.emit_lifecycle(protocol::DISCONNECT, &[]);
    }
}

/// A typed event channel over one WebSocket connection.
///
/// Created with [`Channel::connect`], which returns immediately; the
/// transport opens in the background and the reserved `connect` event fires
/// once it is up. Lifecycle events are latched, so a listener registered
/// after `connect`, `error` or `disconnect` already fired is invoked right
/// away with the original arguments; registration never races the
/// background task. Application events are not latched, and emitting while
/// disconnected drops the frame silently.
///
/// Dropping the channel closes the connection.
pub struct Channel {
    core: Arc<ChannelCore>,
    url: String,
}

impl Channel {
    /// Open a channel to the address in `config`. Must be called within a
    /// Tokio runtime.
    pub fn connect(config: ChannelConfig) -> Self {
        let url = config.resolve_url();
        let (core, outbound_rx, shutdown_rx) =
            ChannelCore::new(config.heartbeat(), config.timeout());
        tokio::spawn(run_client(
            Arc::clone(&core),
            url.clone(),
            outbound_rx,
            shutdown_rx,
        ));
        Self { core, url }
    }

    /// The address this channel dials.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Register a listener for `event`. Lifecycle events are latched: if
    /// `event` is reserved and already fired, `listener` runs immediately
    /// with the original arguments.
    pub fn on(&self, event: impl Into<String>, listener: Listener) -> ListenerHandle {
        self.core.on(event.into(), listener)
    }

    /// Register a listener that runs on the next `event` only, or right away
    /// if `event` is a lifecycle event that already fired.
    pub fn once(&self, event: impl Into<String>, listener: Listener) -> ListenerHandle {
        self.core.once(event.into(), listener)
    }

    /// Remove the earliest registration of `listener` for `event`.
    pub fn remove_listener(&self, event: &str, listener: &Listener) {
        self.core.registry().remove_listener(event, listener);
    }

    /// Send `event` with `args` to the remote endpoint. While disconnected
    /// this is a silent no-op, and reserved names are refused.
    pub fn emit(&self, event: &str, args: &[Value]) {
        self.core.emit(event, args);
    }

    pub fn state(&self) -> ChannelState {
        self.core.state()
    }

    pub fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    /// Close the connection. The reserved `disconnect` event fires once the
    /// socket loop winds down; before the transport has opened, closing is
    /// silent.
    pub fn close(&self) {
        self.core.close();
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.core.close();
    }
}

async fn run_client(
    core: Arc<ChannelCore>,
    url: String,
    outbound_rx: mpsc::UnboundedReceiver<Message>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    if let Err(e) = Url::parse(&url) {
        let err = WsioError::from(e);
        tracing::warn!("Refusing to dial {}: {}", url, err);
        core.emit_error(&err.to_string());
        core.emit_lifecycle(protocol::DISCONNECT, &[]);
        return;
    }

    let socket = tokio::select! {
        connected = connect_async(url.as_str()) => match connected {
            Ok((socket, _response)) => socket,
            Err(e) => {
                tracing::warn!("Failed to connect to {}: {}", url, e);
                core.emit_error(&e.to_string());
                core.emit_lifecycle(protocol::DISCONNECT, &[]);
                return;
            }
        },
        _ = &mut shutdown_rx => return,
    };

    tracing::info!("Connected to {}", url);
    core.set_state(ChannelState::Connected);
    core.emit_lifecycle(protocol::CONNECT, &[]);
    core.drive(socket, outbound_rx, shutdown_rx).await;
    tracing::info!("Disconnected from {}", url);
}
