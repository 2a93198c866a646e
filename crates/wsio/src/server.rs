//! Server-side acceptor and peers
//!
//! [`Server`] owns the TCP listener and hands every accepted connection to
//! the connection handler as a [`Peer`], the server-side twin of the client
//! channel. Peers are cheap clones holding a weak reference to the
//! connection, so listeners can capture one without keeping a dead
//! connection alive.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use uuid::Uuid;

use crate::channel::{ChannelCore, ChannelState};
use crate::config::ServerConfig;
use crate::error::Result;
use crate::protocol;
use crate::registry::{Listener, ListenerHandle};

/// Called once per accepted connection, before any event is dispatched.
pub type ConnectionHandler = Arc<dyn Fn(Peer) + Send + Sync>;

/// Accepts WebSocket upgrades on the configured path and runs one channel
/// per connection.
pub struct Server {
    config: ServerConfig,
    listener: TcpListener,
    on_connection: Option<ConnectionHandler>,
}

impl Server {
    /// Bind the TCP listener named in `config`.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        tracing::info!(
            "Listening on {} (path {})",
            listener.local_addr()?,
            config.path
        );
        Ok(Self {
            config,
            listener,
            on_connection: None,
        })
    }

    /// The address the listener actually bound, useful with port 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Install the handler invoked with the [`Peer`] of every accepted
    /// connection. Listeners it registers see the `connect` event and every
    /// frame the peer sends.
    pub fn on_connection(&mut self, handler: impl Fn(Peer) + Send + Sync + 'static) {
        self.on_connection = Some(Arc::new(handler));
    }

    /// Accept connections forever, one spawned task per connection.
    pub async fn run(self) -> Result<()> {
        loop {
            let (stream, addr) = self.listener.accept().await?;
            let config = self.config.clone();
            let handler = self.on_connection.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, config, handler).await {
                    tracing::warn!("Connection from {} failed: {}", addr, e);
                }
            });
        }
    }
}

/// Server-side handle to one connected client.
///
/// Mirrors the client channel surface: listeners, emit, state, close. The
/// underlying connection is owned by its socket task; once that winds down,
/// a lingering `Peer` turns every call into a no-op.
#[derive(Clone)]
pub struct Peer {
    core: Weak<ChannelCore>,
    id: String,
    addr: SocketAddr,
}

impl Peer {
    /// Identifier assigned at accept time, unique per connection.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Register a listener for `event`. Lifecycle events are latched: if
    /// `event` is reserved and already fired, `listener` runs immediately
    /// with the original arguments.
    pub fn on(&self, event: impl Into<String>, listener: Listener) -> ListenerHandle {
        match self.core.upgrade() {
            Some(core) => core.on(event.into(), listener),
            None => ListenerHandle::dangling(),
        }
    }

    /// Register a listener that runs on the next `event` only, or right away
    /// if `event` is a lifecycle event that already fired.
    pub fn once(&self, event: impl Into<String>, listener: Listener) -> ListenerHandle {
        match self.core.upgrade() {
            Some(core) => core.once(event.into(), listener),
            None => ListenerHandle::dangling(),
        }
    }

    /// Remove the earliest registration of `listener` for `event`.
    pub fn remove_listener(&self, event: &str, listener: &Listener) {
        if let Some(core) = self.core.upgrade() {
            core.registry().remove_listener(event, listener);
        }
    }

    /// Send `event` with `args` to this client. Silent no-op once the
    /// connection is gone, and reserved names are refused.
    pub fn emit(&self, event: &str, args: &[Value]) {
        match self.core.upgrade() {
            Some(core) => core.emit(event, args),
            None => tracing::trace!("Dropping \"{}\": peer is gone", event),
        }
    }

    pub fn state(&self) -> ChannelState {
        self.core
            .upgrade()
            .map_or(ChannelState::Disconnected, |core| core.state())
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    /// Disconnect this client. The peer's `disconnect` event fires once the
    /// socket loop winds down.
    pub fn close(&self) {
        if let Some(core) = self.core.upgrade() {
            core.close();
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    config: ServerConfig,
    handler: Option<ConnectionHandler>,
) -> Result<()> {
    let path = config.path.clone();
    let socket = accept_hdr_async(stream, |request: &Request, response: Response| {
        if request.uri().path() == path {
            Ok(response)
        } else {
            tracing::debug!("Rejecting upgrade on {} from {}", request.uri().path(), addr);
            let mut response = ErrorResponse::new(Some("no websocket endpoint here\n".to_string()));
            *response.status_mut() = StatusCode::NOT_FOUND;
            Err(response)
        }
    })
    .await?;

    let (core, outbound_rx, shutdown_rx) = ChannelCore::new(config.heartbeat(), config.timeout());
    core.set_state(ChannelState::Connected);
    let peer = Peer {
        core: Arc::downgrade(&core),
        id: Uuid::now_v7().to_string(),
        addr,
    };
    tracing::info!("Peer {} connected from {}", peer.id, addr);

    // Handler first, so its listeners catch the connect event and every
    // frame that follows.
    if let Some(handler) = &handler {
        handler(peer.clone());
    }
    core.emit_lifecycle(protocol::CONNECT, &[]);

    core.drive(socket, outbound_rx, shutdown_rx).await;
    tracing::info!("Peer {} disconnected", peer.id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::config::ChannelConfig;
    use futures_util::SinkExt;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message;

    async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    async fn local_server(config: ServerConfig) -> Server {
        Server::bind(ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            ..config
        })
        .await
        .expect("failed to bind test server")
    }

    #[tokio::test]
    async fn rejects_upgrades_off_the_configured_path() {
        let server = local_server(ServerConfig::default()).await;
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());

        let refused = connect_async(format!("ws://{}/other/", addr)).await;
        assert!(refused.is_err());

        let accepted = connect_async(format!("ws://{}/wsio/", addr)).await;
        assert!(accepted.is_ok());
    }

    #[tokio::test]
    async fn inbound_reserved_frames_are_not_dispatched() {
        let mut server = local_server(ServerConfig::default()).await;
        let addr = server.local_addr().unwrap();

        let (connect_tx, mut connect_rx) = mpsc::unbounded_channel();
        let (chat_tx, mut chat_rx) = mpsc::unbounded_channel();
        server.on_connection(move |peer: Peer| {
            let connects = connect_tx.clone();
            peer.on(
                "connect",
                Arc::new(move |_: &[Value]| {
                    let _ = connects.send(());
                }),
            );
            let chats = chat_tx.clone();
            peer.on(
                "chat",
                Arc::new(move |args: &[Value]| {
                    let _ = chats.send(args.to_vec());
                }),
            );
        });
        tokio::spawn(server.run());

        let (mut socket, _) = connect_async(format!("ws://{}/wsio/", addr))
            .await
            .unwrap();
        socket
            .send(Message::Text(r#"["connect", "spoofed"]"#.to_string()))
            .await
            .unwrap();
        socket
            .send(Message::Text(r#"["chat", "real"]"#.to_string()))
            .await
            .unwrap();

        // Frames dispatch in order, so once "chat" has landed the spoofed
        // "connect" is already behind us.
        assert_eq!(recv(&mut chat_rx).await, vec![json!("real")]);
        recv(&mut connect_rx).await;
        assert!(connect_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn silent_peers_trip_the_heartbeat_timeout() {
        let mut server = local_server(ServerConfig {
            heartbeat_ms: 50,
            timeout_ms: 150,
            ..ServerConfig::default()
        })
        .await;
        let addr = server.local_addr().unwrap();

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        server.on_connection(move |peer: Peer| {
            let errors = event_tx.clone();
            peer.on(
                "error",
                Arc::new(move |args: &[Value]| {
                    let _ = errors.send(("error", args.to_vec()));
                }),
            );
            let downs = event_tx.clone();
            peer.on(
                "disconnect",
                Arc::new(move |args: &[Value]| {
                    let _ = downs.send(("disconnect", args.to_vec()));
                }),
            );
        });
        tokio::spawn(server.run());

        // Held open but never polled, so it answers no pings.
        let (_socket, _) = connect_async(format!("ws://{}/wsio/", addr))
            .await
            .unwrap();

        let (event, args) = recv(&mut event_rx).await;
        assert_eq!(event, "error");
        assert_eq!(args, vec![json!("heartbeat timeout")]);
        let (event, args) = recv(&mut event_rx).await;
        assert_eq!(event, "disconnect");
        assert!(args.is_empty());
    }

    #[tokio::test]
    async fn peer_connect_fires_before_inbound_frames() {
        let mut server = local_server(ServerConfig::default()).await;
        let addr = server.local_addr().unwrap();

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        server.on_connection(move |peer: Peer| {
            let events = event_tx.clone();
            peer.on(
                "connect",
                Arc::new(move |_: &[Value]| {
                    let _ = events.send("connect");
                }),
            );
            let events = event_tx.clone();
            peer.on(
                "chat",
                Arc::new(move |_: &[Value]| {
                    let _ = events.send("chat");
                }),
            );
        });
        tokio::spawn(server.run());

        // A raw client can have a frame in flight the moment the upgrade
        // finishes; the connect event must still come through first.
        let (mut socket, _) = connect_async(format!("ws://{}/wsio/", addr))
            .await
            .unwrap();
        socket
            .send(Message::Text(r#"["chat", "first thing"]"#.to_string()))
            .await
            .unwrap();

        assert_eq!(recv(&mut event_rx).await, "connect");
        assert_eq!(recv(&mut event_rx).await, "chat");
    }

    #[tokio::test]
    async fn closing_a_peer_disconnects_the_client() {
        let mut server = local_server(ServerConfig::default()).await;
        let addr = server.local_addr().unwrap();

        let (peer_tx, mut peer_rx) = mpsc::unbounded_channel();
        server.on_connection(move |peer: Peer| {
            let _ = peer_tx.send(peer);
        });
        tokio::spawn(server.run());

        let channel = Channel::connect(ChannelConfig {
            host: addr.to_string(),
            ..ChannelConfig::default()
        });
        let (down_tx, mut down_rx) = mpsc::unbounded_channel();
        channel.on(
            "disconnect",
            Arc::new(move |_: &[Value]| {
                let _ = down_tx.send(());
            }),
        );

        let peer = recv(&mut peer_rx).await;
        assert!(peer.is_connected());
        peer.close();

        recv(&mut down_rx).await;
        assert!(!peer.is_connected());
    }
}
