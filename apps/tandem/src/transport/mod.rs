//! Seam between the call session and the WebRTC stack.
//!
//! The session only ever talks to [`PeerConnection`] and [`DataChannel`]
//! trait objects; callbacks from the stack are funnelled into a single
//! [`PeerEventSink`] so the session can process them on its own loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tandem_proto::{BinaryType, IceCandidate, SessionDescription};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::media::{LocalTrack, RemoteTrack};

#[cfg(test)]
pub mod mock;
pub mod webrtc;

/// Pre-negotiated channel carrying feature maps.
pub const FEATURES_CHANNEL_LABEL: &str = "features";
pub const FEATURES_CHANNEL_ID: u16 = 110;
/// Pre-negotiated channel carrying chat envelopes and acknowledgements.
pub const CHAT_CHANNEL_LABEL: &str = "text chat";
pub const CHAT_CHANNEL_ID: u16 = 100;
pub const FILTER_CHANNEL_PREFIX: &str = "filter-";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer connection is closed")]
    Closed,
    #[error("data channel {0:?} is not open")]
    ChannelNotOpen(String),
    #[error("operation invalid in signaling state {0:?}")]
    InvalidState(SignalingState),
    #[error("webrtc error: {0}")]
    WebRtc(#[from] ::webrtc::Error),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Handle used to route channel events back to the owning entry. Unique per
/// process, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ChannelId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub label: String,
    /// `Some(id)` for channels both sides create with the same id; `None`
    /// for channels announced to the remote through a channel-opened event.
    pub negotiated_id: Option<u16>,
    pub ordered: bool,
}

impl ChannelSpec {
    pub fn features() -> Self {
        Self::negotiated(FEATURES_CHANNEL_LABEL, FEATURES_CHANNEL_ID)
    }

    pub fn chat() -> Self {
        Self::negotiated(CHAT_CHANNEL_LABEL, CHAT_CHANNEL_ID)
    }

    pub fn negotiated(label: &str, id: u16) -> Self {
        Self {
            label: label.to_string(),
            negotiated_id: Some(id),
            ordered: true,
        }
    }

    pub fn ad_hoc(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            negotiated_id: None,
            ordered: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelPayload {
    Text(String),
    Binary(Bytes),
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn id(&self) -> ChannelId;
    fn label(&self) -> String;
    fn state(&self) -> ChannelState;
    fn binary_type(&self) -> BinaryType;
    fn set_binary_type(&self, binary_type: BinaryType);
    async fn send_text(&self, text: &str) -> Result<(), TransportError>;
    async fn send_binary(&self, data: Bytes) -> Result<(), TransportError>;
    async fn close(&self) -> Result<(), TransportError>;

    fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    fn signaling_state(&self) -> SignalingState;
    fn connection_state(&self) -> ConnectionState;
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;
    async fn set_local_description(&self, description: SessionDescription)
        -> Result<(), TransportError>;
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;
    /// Drops a pending local offer and returns to `stable`.
    async fn rollback(&self) -> Result<(), TransportError>;
    /// Current local description, including any candidates gathered so far.
    async fn local_description(&self) -> Option<SessionDescription>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;
    async fn create_data_channel(
        &self,
        spec: ChannelSpec,
    ) -> Result<Arc<dyn DataChannel>, TransportError>;
    async fn add_track(&self, track: LocalTrack) -> Result<(), TransportError>;
    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(&self, events: PeerEventSink)
        -> Result<Arc<dyn PeerConnection>, TransportError>;
}

/// Everything the stack reports asynchronously.
#[derive(Clone)]
pub enum PeerEvent {
    NegotiationNeeded,
    IceCandidate(IceCandidate),
    ConnectionState(ConnectionState),
    /// A channel the remote side created without pre-negotiation.
    RemoteChannel(Arc<dyn DataChannel>),
    ChannelOpen(ChannelId),
    ChannelMessage(ChannelId, ChannelPayload),
    ChannelClosed(ChannelId),
    Track(RemoteTrack),
}

impl std::fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerEvent::NegotiationNeeded => f.write_str("NegotiationNeeded"),
            PeerEvent::IceCandidate(c) => f.debug_tuple("IceCandidate").field(c).finish(),
            PeerEvent::ConnectionState(s) => f.debug_tuple("ConnectionState").field(s).finish(),
            PeerEvent::RemoteChannel(dc) => {
                f.debug_tuple("RemoteChannel").field(&dc.label()).finish()
            }
            PeerEvent::ChannelOpen(id) => f.debug_tuple("ChannelOpen").field(id).finish(),
            PeerEvent::ChannelMessage(id, payload) => {
                let len = match payload {
                    ChannelPayload::Text(t) => t.len(),
                    ChannelPayload::Binary(b) => b.len(),
                };
                f.debug_tuple("ChannelMessage").field(id).field(&len).finish()
            }
            PeerEvent::ChannelClosed(id) => f.debug_tuple("ChannelClosed").field(id).finish(),
            PeerEvent::Track(t) => f.debug_tuple("Track").field(t).finish(),
        }
    }
}

/// A [`PeerEvent`] stamped with the generation of the connection that
/// produced it. Events from a torn-down connection are discarded.
#[derive(Debug, Clone)]
pub struct PeerEventEnvelope {
    pub generation: u64,
    pub event: PeerEvent,
}

#[derive(Clone)]
pub struct PeerEventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<PeerEventEnvelope>,
}

impl PeerEventSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<PeerEventEnvelope>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns false once the session has gone away.
    pub fn emit(&self, event: PeerEvent) -> bool {
        self.tx
            .send(PeerEventEnvelope {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// STUN/TURN server as handed to the stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}
