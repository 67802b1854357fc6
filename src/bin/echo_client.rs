use anyhow::{Context, Result};
use clap::Parser;
use linkwire::config::{Role, SocketConfig};
use linkwire::socket::{handler_fn, Connection, Message};
use log::{debug, info, warn};
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpStream;

/// Sends requests to an echo server and prints the responses
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:7878")]
    addr: String,

    /// Event to request
    #[arg(short, long, default_value = "ping")]
    event: String,

    /// Request content
    #[arg(long, default_value = "")]
    content: String,

    /// Number of concurrent requests
    #[arg(short = 'n', long, default_value_t = 1)]
    count: usize,

    /// Per-request timeout in milliseconds (config default when omitted)
    #[arg(short, long)]
    timeout_ms: Option<u64>,

    /// JSON config file (defaults apply to missing fields)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => SocketConfig::from_file(path)?,
        None => SocketConfig::default(),
    }
    .with_role(Role::Client);

    let stream = TcpStream::connect(&cli.addr)
        .await
        .with_context(|| format!("Failed to connect to {}", cli.addr))?;
    info!("Connected to {}", cli.addr);

    // サーバーからのリクエストにも応答する
    let handler = handler_fn(|message: Message, connection: Connection| async move {
        debug!("Server request: {} ({})", message.event_name, message.cmd_idx);
        let content = match message.event_name.as_str() {
            "ping" => "pong".to_string(),
            other => Message::error_content(3, &format!("Unknown event: {}", other)),
        };
        let code = if message.event_name == "ping" { 0 } else { 3 };
        if let Err(e) = connection.respond(&message, code, content).await {
            warn!("Failed to reply to server request: {}", e);
        }
    });
    let (connection, handle) = Connection::from_tcp(stream, handler, config);

    let timeout = cli.timeout_ms.map(Duration::from_millis);
    let requests = (0..cli.count).map(|_| connection.request(&cli.event, cli.content.clone(), timeout));
    let results = futures_util::future::join_all(requests).await;

    let mut failed = 0;
    for (i, result) in results.into_iter().enumerate() {
        match result {
            Ok(response) => println!("[{}] code={} content={}", i + 1, response.code, response.content),
            Err(e) => {
                failed += 1;
                eprintln!("[{}] request failed: {}", i + 1, e);
                if e.is_fatal() {
                    warn!("Connection unusable: {}", e);
                }
            }
        }
    }

    connection.close();
    let _ = handle.await;

    if failed > 0 {
        anyhow::bail!("{} of {} requests failed", failed, cli.count);
    }
    Ok(())
}
