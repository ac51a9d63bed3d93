use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

use lectern_proto::{ClientFrame, ServerFrame};

#[derive(Parser, Debug)]
#[command(name = "lectern-relay")]
#[command(about = "Classroom relay hub and debug client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Address the relay listens on
    #[arg(long, env = "LECTERN_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Maximum number of concurrently registered students
    #[arg(long, env = "LECTERN_MAX_STUDENTS", default_value_t = 100)]
    pub max_students: usize,

    /// Largest accepted websocket message, in bytes
    #[arg(long, env = "LECTERN_MAX_MESSAGE_BYTES", default_value_t = 10 * 1024 * 1024)]
    pub max_message_bytes: usize,

    /// Deadline for a single websocket write, in seconds
    #[arg(long, env = "LECTERN_WRITE_TIMEOUT_SECS", default_value_t = 5)]
    pub write_timeout_secs: u64,

    /// Sessions with no inbound traffic for this long are closed, in seconds
    #[arg(long, env = "LECTERN_PONG_TIMEOUT_SECS", default_value_t = 60)]
    pub pong_timeout_secs: u64,

    /// Keepalive ping cadence, in seconds
    #[arg(long, env = "LECTERN_PING_INTERVAL_SECS", default_value_t = 50)]
    pub ping_interval_secs: u64,

    /// Frames buffered per session before drops kick in
    #[arg(long, env = "LECTERN_OUTBOX_CAPACITY", default_value_t = 128)]
    pub outbox_capacity: usize,

    /// Queued hub requests before connection tasks back off
    #[arg(long, env = "LECTERN_HUB_QUEUE_DEPTH", default_value_t = 256)]
    pub hub_queue_depth: usize,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect as the teacher dashboard and print relayed events
    Watch {
        /// Relay URL (e.g., ws://localhost:8080)
        #[arg(short, long, default_value = "ws://localhost:8080")]
        url: String,
    },
}

pub async fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Watch { url } => run_watch(url).await,
    }
}

/// Debug client: registers as the teacher and prints everything the relay
/// fans out. Connecting evicts a real dashboard, so point it at test rigs.
async fn run_watch(url: String) -> Result<()> {
    let ws_url = format!("{}/ws", url.trim_end_matches('/'));
    debug!("connecting to {}", ws_url);

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&ws_url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => return Err(anyhow!("connection failed: {err}")),
        Err(_) => return Err(anyhow!("connection timeout - is the relay running?")),
    };
    let (mut write, mut read) = ws_stream.split();

    let identify = serde_json::to_string(&ClientFrame::IdentifyTeacher)?;
    write.send(Message::Text(identify.into())).await?;
    println!("watching {ws_url} as the teacher dashboard");

    while let Some(message) = read.next().await {
        match message? {
            Message::Text(text) => {
                for line in text.as_str().split('\n') {
                    print_frame(line);
                }
            }
            Message::Close(_) => {
                println!("relay closed the connection");
                break;
            }
            _ => {}
        }
    }
    Ok(())
}

fn print_frame(raw: &str) {
    match serde_json::from_str::<ServerFrame>(raw) {
        Ok(ServerFrame::InitialRoster { data }) => {
            println!("roster: {} student(s)", data.len());
            for entry in data {
                println!("  {} <{}>", entry.client_id, entry.email);
            }
        }
        Ok(ServerFrame::StudentConnected { data }) => {
            println!("+ {} <{}>", data.client_id, data.email);
        }
        Ok(ServerFrame::StudentDisconnected { data }) => {
            println!("- {}", data.client_id);
        }
        Ok(ServerFrame::StudentCaptureFrame { data }) => {
            let image_bytes = data
                .payload
                .get("imageData")
                .and_then(Value::as_str)
                .map(str::len)
                .unwrap_or(0);
            println!(
                "capture from {} ({} byte image)",
                data.client_id, image_bytes
            );
        }
        Ok(ServerFrame::Error { message }) => {
            println!("error from relay: {message}");
        }
        Ok(_) => println!("{raw}"),
        Err(_) => println!("unparsed: {raw}"),
    }
}
