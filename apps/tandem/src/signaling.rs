//! WebSocket client for the tandem relay.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tandem_proto::{ClientFrame, RelayFrame, RoomId};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, trace, warn};
use url::Url;

pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum RelayClientError {
    #[error("invalid relay url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("relay connection failed: {0}")]
    Connect(#[from] WsError),
}

/// An open relay session. Frames pushed into `outbound` are written to the
/// socket; frames from the relay arrive on `inbound`, which closes when the
/// socket does.
pub struct RelayConnection {
    pub outbound: mpsc::UnboundedSender<ClientFrame>,
    pub inbound: mpsc::UnboundedReceiver<RelayFrame>,
    tasks: Vec<JoinHandle<()>>,
}

impl RelayConnection {
    /// Wraps frame channels that are not backed by a socket, such as an
    /// in-process relay.
    pub fn detached(
        outbound: mpsc::UnboundedSender<ClientFrame>,
        inbound: mpsc::UnboundedReceiver<RelayFrame>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            tasks: Vec::new(),
        }
    }
}

impl Drop for RelayConnection {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// `ws(s)://host[:port]/ws/{room}` for a relay base url. `http` and `https`
/// are accepted and mapped to their websocket schemes.
pub fn room_websocket_url(relay_url: &str, room: &RoomId) -> Result<Url, RelayClientError> {
    let invalid = |reason: &str| RelayClientError::InvalidUrl {
        url: relay_url.to_string(),
        reason: reason.to_string(),
    };
    let mut url = Url::parse(relay_url).map_err(|err| invalid(&err.to_string()))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        _ => return Err(invalid("scheme must be ws, wss, http or https")),
    };
    url.set_scheme(scheme)
        .map_err(|_| invalid("cannot switch to a websocket scheme"))?;
    let base = url.path().trim_end_matches('/').to_string();
    url.set_path(&format!("{base}/ws/{room}"));
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

pub async fn connect(
    relay_url: &str,
    room: &RoomId,
    ping_interval: Duration,
) -> Result<RelayConnection, RelayClientError> {
    let url = room_websocket_url(relay_url, room)?;
    let (stream, _) = connect_async(url.as_str()).await?;
    debug!(target: "tandem::signaling", %url, "relay websocket connected");
    let (mut write, mut read) = stream.split();

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientFrame>();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<RelayFrame>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(err) => {
                    warn!(target: "tandem::signaling", "unencodable frame: {err}");
                    continue;
                }
            };
            if write.send(Message::text(text)).await.is_err() {
                break;
            }
        }
        if let Err(err) = write.close().await {
            debug!(target: "tandem::signaling", "relay websocket close failed: {err}");
        }
    });

    let reader = tokio::spawn(async move {
        while let Some(message) = read.next().await {
            let text = match message {
                Ok(Message::Text(text)) => text.as_str().to_owned(),
                Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => text,
                    Err(_) => continue,
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(err) => {
                    match &err {
                        WsError::ConnectionClosed
                        | WsError::AlreadyClosed
                        | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                            debug!(target: "tandem::signaling", "relay websocket closed: {err}");
                        }
                        _ => warn!(target: "tandem::signaling", "relay websocket error: {err}"),
                    }
                    break;
                }
            };
            trace!(target: "tandem::signaling", len = text.len(), "relay frame");
            match serde_json::from_str::<RelayFrame>(&text) {
                Ok(frame) => {
                    if inbound_tx.send(frame).is_err() {
                        break;
                    }
                }
                Err(err) => debug!(target: "tandem::signaling", "unrecognised relay frame: {err}"),
            }
        }
    });

    let heartbeat_tx = outbound_tx.clone();
    let heartbeat = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ping_interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if heartbeat_tx.send(ClientFrame::Ping).is_err() {
                break;
            }
        }
    });

    Ok(RelayConnection {
        outbound: outbound_tx,
        inbound: inbound_rx,
        tasks: vec![writer, reader, heartbeat],
    })
}
