use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use linkwire::config::{Role, SocketConfig};
use linkwire::socket::{Connection, Message, MsgHandler};
use log::{debug, info, warn};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpListener;

const CODE_OK: i32 = 0;
const CODE_BAD_CONTENT: i32 = 2;
const CODE_UNKNOWN_EVENT: i32 = 3;

/// Echo server speaking the \r\n-framed JSON message protocol
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:7878")]
    addr: String,

    /// JSON config file (defaults apply to missing fields)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

/// Handles client requests: echo, ping, add, info, reverse_ping
struct EchoHandler;

impl EchoHandler {
    fn add(content: &str) -> Result<f64, String> {
        let value: Value = serde_json::from_str(content).map_err(|e| e.to_string())?;
        let a = value["a"].as_f64().ok_or("Missing or invalid 'a'")?;
        let b = value["b"].as_f64().ok_or("Missing or invalid 'b'")?;
        Ok(a + b)
    }

    /// Ask the client for a pong and report how long it took
    async fn reverse_ping(connection: &Connection) -> Result<String, String> {
        let started = std::time::Instant::now();
        let response = connection
            .request("ping", "", Some(Duration::from_secs(5)))
            .await
            .map_err(|e| e.to_string())?;
        Ok(json!({
            "client_said": response.content,
            "round_trip_ms": started.elapsed().as_millis() as u64,
        })
        .to_string())
    }
}

#[async_trait]
impl MsgHandler for EchoHandler {
    async fn handle(&self, message: Message, connection: Connection) {
        debug!("Handling request: {} ({})", message.event_name, message.cmd_idx);

        let (code, content) = match message.event_name.as_str() {
            "echo" => (CODE_OK, message.content.clone()),
            "ping" => (CODE_OK, "pong".to_string()),
            "add" => match Self::add(&message.content) {
                Ok(sum) => (CODE_OK, json!(sum).to_string()),
                Err(e) => (CODE_BAD_CONTENT, Message::error_content(CODE_BAD_CONTENT, &e)),
            },
            "info" => (
                CODE_OK,
                json!({
                    "name": "echo_server",
                    "version": env!("CARGO_PKG_VERSION"),
                    "events": ["echo", "ping", "add", "info", "reverse_ping"],
                    "timestamp": chrono::Utc::now().to_rfc3339(),
                })
                .to_string(),
            ),
            "reverse_ping" => match Self::reverse_ping(&connection).await {
                Ok(report) => (CODE_OK, report),
                Err(e) => (CODE_BAD_CONTENT, Message::error_content(CODE_BAD_CONTENT, &e)),
            },
            other => (
                CODE_UNKNOWN_EVENT,
                Message::error_content(CODE_UNKNOWN_EVENT, &format!("Unknown event: {}", other)),
            ),
        };

        if let Err(e) = connection.respond(&message, code, content).await {
            warn!("Failed to reply to {}: {}", message.cmd_idx, e);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => SocketConfig::from_file(path)?,
        None => SocketConfig::default(),
    }
    .with_role(Role::Server);

    let listener = TcpListener::bind(&cli.addr)
        .await
        .with_context(|| format!("Failed to bind {}", cli.addr))?;
    info!("Echo server listening on {}", cli.addr);

    loop {
        let (stream, peer) = listener.accept().await?;
        info!("Accepted connection from {}", peer);

        let (_connection, handle) = Connection::from_tcp(stream, EchoHandler, config.clone());
        tokio::spawn(async move {
            if let Err(e) = handle.await {
                warn!("Dispatch loop for {} failed: {}", peer, e);
            }
            info!("Connection from {} closed", peer);
        });
    }
}
