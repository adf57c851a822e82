use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use tandem_proto::{ClientFrame, RelayFrame, RoomId};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

use crate::config::RelayConfig;

#[derive(Parser, Debug)]
#[command(name = "tandem-relay")]
#[command(about = "Tandem room signaling relay and probe client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Address to bind (overrides TANDEM_RELAY_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on (overrides TANDEM_RELAY_PORT)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Evict members silent for this many seconds
    #[arg(long)]
    pub heartbeat_timeout_secs: Option<u64>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Join a room and print every relay frame as a JSON line
    Probe {
        /// Relay base URL
        #[arg(short, long, default_value = "ws://127.0.0.1:3001")]
        url: String,

        /// Room token (7 digits or xxxx-xxxx-xxxx)
        room: String,

        /// Stop after this many seconds
        #[arg(long, default_value_t = 30)]
        seconds: u64,
    },
}

impl Cli {
    pub fn apply(&self, mut config: RelayConfig) -> RelayConfig {
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(secs) = self.heartbeat_timeout_secs.filter(|secs| *secs > 0) {
            config.heartbeat_timeout = Duration::from_secs(secs);
        }
        config
    }
}

pub async fn run_probe(url: &str, room: &str, seconds: u64) -> Result<()> {
    let room = RoomId::parse(room)?;
    let endpoint = format!("{}/ws/{}", url.trim_end_matches('/'), room);
    let (mut socket, _) = connect_async(endpoint.as_str())
        .await
        .with_context(|| format!("connecting to {endpoint}"))?;

    let ping = serde_json::to_string(&ClientFrame::Ping)?;
    socket.send(Message::text(ping)).await?;

    let deadline = tokio::time::sleep(Duration::from_secs(seconds));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            next = socket.next() => {
                let Some(msg) = next else { break };
                match msg? {
                    Message::Text(text) => {
                        let frame: RelayFrame = serde_json::from_str(&text)
                            .with_context(|| format!("unexpected relay frame: {}", text.as_str()))?;
                        println!("{}", serde_json::to_string(&frame)?);
                    }
                    Message::Close(_) => break,
                    other => debug!("ignoring {:?}", other),
                }
            }
        }
    }
    let _ = socket.close(None).await;
    Ok(())
}
