use std::net::SocketAddr;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, Path, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use tandem_proto::{ClientFrame, RelayFrame, RoomId};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::rooms::{MemberTx, Outbound, RoomRegistry};

/// `GET /ws/{room}`. Unknown room shapes are refused before the upgrade.
pub async fn websocket_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    Path(room): Path<String>,
    State(registry): State<RoomRegistry>,
    ws: WebSocketUpgrade,
) -> Response {
    let room = match RoomId::parse(&room) {
        Ok(room) => room,
        Err(err) => {
            debug!(target: "tandem_relay::websocket", %remote_addr, "rejected upgrade: {err}");
            return (StatusCode::NOT_FOUND, err.to_string()).into_response();
        }
    };
    ws.on_upgrade(move |socket| handle_socket(socket, room, registry, remote_addr))
}

async fn handle_socket(
    socket: WebSocket,
    room: RoomId,
    registry: RoomRegistry,
    remote_addr: SocketAddr,
) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Frame(frame) => match serde_json::to_string(&frame) {
                    Ok(json) => {
                        if sink.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(target: "tandem_relay::websocket", "unserializable frame: {err}"),
                },
                Outbound::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    let member_id = registry.join(&room, tx.clone());
    debug!(
        target: "tandem_relay::websocket",
        room = %room,
        member = %member_id,
        %remote_addr,
        "websocket connected"
    );

    while let Some(next) = stream.next().await {
        let msg = match next {
            Ok(msg) => msg,
            Err(err) => {
                debug!(target: "tandem_relay::websocket", member = %member_id, "socket error: {err}");
                break;
            }
        };

        match msg {
            Message::Text(text) => handle_text(&registry, &room, &member_id, &tx, &text),
            // Some clients send JSON in binary frames.
            Message::Binary(data) => match std::str::from_utf8(&data) {
                Ok(text) => handle_text(&registry, &room, &member_id, &tx, text),
                Err(_) => debug!(
                    target: "tandem_relay::websocket",
                    member = %member_id,
                    len = data.len(),
                    "ignoring non-utf8 binary frame"
                ),
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => registry.touch(&room, &member_id),
        }
    }

    registry.leave(&room, &member_id);
    debug!(
        target: "tandem_relay::websocket",
        room = %room,
        member = %member_id,
        "websocket disconnected"
    );
}

fn handle_text(registry: &RoomRegistry, room: &RoomId, member_id: &str, tx: &MemberTx, text: &str) {
    registry.touch(room, member_id);

    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(target: "tandem_relay::websocket", member = %member_id, "invalid frame: {err}");
            let _ = tx.send(Outbound::Frame(RelayFrame::Error {
                message: format!("invalid frame: {err}"),
            }));
            return;
        }
    };

    match frame {
        ClientFrame::Ping => {
            let _ = tx.send(Outbound::Frame(RelayFrame::Pong));
        }
        ClientFrame::Signal { recipient, payload } => {
            if let Err(err) = registry.relay_signal(room, member_id, recipient.as_deref(), payload) {
                debug!(target: "tandem_relay::websocket", member = %member_id, "signal not relayed: {err}");
                let _ = tx.send(Outbound::Frame(RelayFrame::Error {
                    message: err.to_string(),
                }));
            }
        }
    }
}
