//! Echo server demo
//!
//! Run with `cargo run --example echo_server`, then point a chat_client at
//! it from another terminal.

use std::sync::Arc;

use serde_json::Value;
use wsio::{Peer, Server, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let mut server = Server::bind(ServerConfig {
        bind_addr: "127.0.0.1:8080".to_string(),
        ..ServerConfig::default()
    })
    .await?;
    println!("Echo server on ws://{}/wsio/", server.local_addr()?);

    server.on_connection(|peer: Peer| {
        println!("+ {} ({})", peer.id(), peer.addr());

        let echo = peer.clone();
        peer.on(
            "chat",
            Arc::new(move |args: &[Value]| {
                echo.emit("chat", args);
            }),
        );

        let id = peer.id().to_string();
        peer.on(
            "disconnect",
            Arc::new(move |_: &[Value]| {
                println!("- {}", id);
            }),
        );
    });

    server.run().await?;
    Ok(())
}
