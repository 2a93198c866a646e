//! Interactive chat client demo
//!
//! Connects to a local echo server, forwards stdin lines as "chat" events
//! and prints whatever comes back. `/quit` exits.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use wsio::{Channel, ChannelConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let channel = Channel::connect(ChannelConfig {
        host: "localhost:8080".to_string(),
        ..ChannelConfig::default()
    });
    println!("Dialing {}", channel.url());

    channel.on(
        "connect",
        Arc::new(|_: &[Value]| {
            println!("* connected, type away (/quit to exit)");
        }),
    );
    channel.on(
        "disconnect",
        Arc::new(|_: &[Value]| {
            println!("* disconnected");
        }),
    );
    channel.on(
        "error",
        Arc::new(|args: &[Value]| {
            println!("* error: {:?}", args);
        }),
    );
    channel.on(
        "chat",
        Arc::new(|args: &[Value]| {
            println!("> {}", render(args));
        }),
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        channel.emit("chat", &[json!(line)]);
    }

    channel.close();
    Ok(())
}

fn render(args: &[Value]) -> String {
    args.iter()
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}
