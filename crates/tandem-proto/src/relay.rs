use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frames sent from a client to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ClientFrame {
    /// Opaque signaling payload. `recipient` is required in multi-party rooms
    /// and ignored in two-party rooms.
    #[serde(rename = "signal")]
    Signal {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recipient: Option<String>,
        payload: Value,
    },
    /// Heartbeat to keep the membership alive.
    #[serde(rename = "ping")]
    Ping,
}

/// Frames sent from the relay to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum RelayFrame {
    /// Sent to the joiner right after registration: its own id and the
    /// members that were already present.
    #[serde(rename = "connected peers")]
    ConnectedPeers {
        assigned_id: String,
        peers: Vec<String>,
    },
    /// Sent to existing members when someone joins after them.
    #[serde(rename = "connected peer")]
    ConnectedPeer { peer_id: String },
    /// Sent to remaining members when someone leaves.
    #[serde(rename = "disconnected peer")]
    DisconnectedPeer { peer_id: String },
    #[serde(rename = "signal")]
    Signal {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender: Option<String>,
        payload: Value,
    },
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "error")]
    Error { message: String },
}
