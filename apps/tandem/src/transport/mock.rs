//! In-memory stand-in for the WebRTC stack.
//!
//! Two factories created with [`MockFactory::pair`] share a network: once the
//! latest connection on each side has completed an offer/answer exchange with
//! matching descriptions, both report `connected`, pre-negotiated channels
//! are paired by id, ad hoc channels are announced to the other side, and
//! everything opens. Signaling follows the browser state machine closely
//! enough for glare and rollback to behave like the real thing.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tandem_proto::{BinaryType, IceCandidate, SdpKind, SessionDescription};

use super::{
    ChannelId, ChannelPayload, ChannelSpec, ChannelState, ConnectionState, DataChannel,
    PeerConnection, PeerConnectionFactory, PeerEvent, PeerEventSink, SignalingState,
    TransportError,
};
use crate::media::{LocalTrack, RemoteTrack};

#[derive(Default)]
pub struct MockNetwork {
    sides: Mutex<[Option<Weak<MockPeer>>; 2]>,
}

impl MockNetwork {
    fn register(&self, side: usize, peer: &Arc<MockPeer>) {
        self.sides.lock()[side] = Some(Arc::downgrade(peer));
    }

    fn counterpart(&self, side: usize) -> Option<Arc<MockPeer>> {
        self.sides.lock()[1 - side].as_ref().and_then(Weak::upgrade)
    }
}

pub struct MockFactory {
    network: Option<Arc<MockNetwork>>,
    side: usize,
    created: Mutex<Vec<Arc<MockPeer>>>,
}

impl MockFactory {
    pub fn pair() -> (Arc<MockFactory>, Arc<MockFactory>) {
        let network = Arc::new(MockNetwork::default());
        (
            Arc::new(Self {
                network: Some(network.clone()),
                side: 0,
                created: Mutex::new(Vec::new()),
            }),
            Arc::new(Self {
                network: Some(network),
                side: 1,
                created: Mutex::new(Vec::new()),
            }),
        )
    }

    pub fn standalone() -> Arc<MockFactory> {
        Arc::new(Self {
            network: None,
            side: 0,
            created: Mutex::new(Vec::new()),
        })
    }

    pub fn latest(&self) -> Option<Arc<MockPeer>> {
        self.created.lock().last().cloned()
    }

    pub fn created(&self) -> usize {
        self.created.lock().len()
    }
}

#[async_trait]
impl PeerConnectionFactory for MockFactory {
    async fn create(
        &self,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, TransportError> {
        let peer = MockPeer::new(self.side, self.network.clone(), events);
        if let Some(network) = &self.network {
            network.register(self.side, &peer);
        }
        self.created.lock().push(peer.clone());
        Ok(peer)
    }
}

struct PeerState {
    signaling: SignalingState,
    connection: ConnectionState,
    current_local: Option<SessionDescription>,
    pending_local: Option<SessionDescription>,
    current_remote: Option<SessionDescription>,
    pending_remote: Option<SessionDescription>,
    descriptions_made: u32,
    negotiation_requested: bool,
    channels: Vec<Arc<MockChannel>>,
    tracks: Vec<LocalTrack>,
    candidates: Vec<IceCandidate>,
    reject_candidates: bool,
    fail_channel_closes: bool,
}

pub struct MockPeer {
    tag: String,
    side: usize,
    network: Option<Arc<MockNetwork>>,
    events: PeerEventSink,
    state: Mutex<PeerState>,
}

impl MockPeer {
    fn new(side: usize, network: Option<Arc<MockNetwork>>, events: PeerEventSink) -> Arc<Self> {
        Arc::new(Self {
            tag: format!("side{side}-gen{}", events.generation()),
            side,
            network,
            events,
            state: Mutex::new(PeerState {
                signaling: SignalingState::Stable,
                connection: ConnectionState::New,
                current_local: None,
                pending_local: None,
                current_remote: None,
                pending_remote: None,
                descriptions_made: 0,
                negotiation_requested: false,
                channels: Vec::new(),
                tracks: Vec::new(),
                candidates: Vec::new(),
                reject_candidates: false,
                fail_channel_closes: false,
            }),
        })
    }

    pub fn request_renegotiation(&self) {
        self.events.emit(PeerEvent::NegotiationNeeded);
    }

    pub fn emit_connection_state(&self, state: ConnectionState) {
        self.state.lock().connection = state;
        self.events.emit(PeerEvent::ConnectionState(state));
    }

    pub fn emit_local_candidate(&self, candidate: IceCandidate) {
        self.events.emit(PeerEvent::IceCandidate(candidate));
    }

    pub fn emit_remote_track(&self, track: RemoteTrack) {
        self.events.emit(PeerEvent::Track(track));
    }

    pub fn set_reject_candidates(&self, reject: bool) {
        self.state.lock().reject_candidates = reject;
    }

    /// Channels created from now on, on either end, fail to close.
    pub fn fail_channel_closes(&self, fail: bool) {
        self.state.lock().fail_channel_closes = fail;
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().candidates.clone()
    }

    pub fn tracks(&self) -> Vec<LocalTrack> {
        self.state.lock().tracks.clone()
    }

    pub fn channel(&self, label: &str) -> Option<Arc<MockChannel>> {
        self.state
            .lock()
            .channels
            .iter()
            .rev()
            .find(|c| c.label == label)
            .cloned()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().signaling == SignalingState::Closed
    }

    fn next_sdp(&self, kind: &str) -> String {
        let mut state = self.state.lock();
        state.descriptions_made += 1;
        format!("{kind}:{}:{}", self.tag, state.descriptions_made)
    }

    fn request_negotiation_once(&self) {
        let first = {
            let mut state = self.state.lock();
            !std::mem::replace(&mut state.negotiation_requested, true)
        };
        if first {
            self.events.emit(PeerEvent::NegotiationNeeded);
        }
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    /// Local and remote descriptions of the last completed exchange, while
    /// the signaling state is stable.
    pub fn negotiated_pair(&self) -> Option<(SessionDescription, SessionDescription)> {
        let state = self.state.lock();
        if state.signaling != SignalingState::Stable {
            return None;
        }
        Some((state.current_local.clone()?, state.current_remote.clone()?))
    }

    /// Brings both sides up once their last exchange matches.
    fn try_connect(&self) {
        let Some(other) = self.network.as_ref().and_then(|n| n.counterpart(self.side)) else {
            return;
        };
        let (Some((local, remote)), Some((other_local, other_remote))) =
            (self.negotiated_pair(), other.negotiated_pair())
        else {
            return;
        };
        if local != other_remote || remote != other_local {
            return;
        }

        for peer in [self, other.as_ref()] {
            let already = peer.state.lock().connection == ConnectionState::Connected;
            if !already {
                peer.state.lock().connection = ConnectionState::Connected;
                peer.events
                    .emit(PeerEvent::ConnectionState(ConnectionState::Connecting));
                peer.events
                    .emit(PeerEvent::ConnectionState(ConnectionState::Connected));
            }
        }
        link_channels(self, &other);
        link_channels(&other, self);
    }

    fn connected_counterpart(&self) -> Option<Arc<MockPeer>> {
        if self.state.lock().connection != ConnectionState::Connected {
            return None;
        }
        self.network.as_ref()?.counterpart(self.side)
    }
}

/// Pairs every unlinked channel of `from` with one on `to`, creating the
/// remote end of ad hoc channels, then opens both ends.
fn link_channels(from: &MockPeer, to: &MockPeer) {
    let pending: Vec<Arc<MockChannel>> = from
        .state
        .lock()
        .channels
        .iter()
        .filter(|c| c.counterpart.lock().is_none() && c.state() == ChannelState::Connecting)
        .cloned()
        .collect();

    for local in pending {
        let remote = match local.negotiated_id {
            Some(id) => {
                let found = to
                    .state
                    .lock()
                    .channels
                    .iter()
                    .find(|c| {
                        c.negotiated_id == Some(id)
                            && c.counterpart.lock().is_none()
                            && c.state() == ChannelState::Connecting
                    })
                    .cloned();
                match found {
                    Some(remote) => remote,
                    None => continue,
                }
            }
            None => {
                let fail_closes = to.state.lock().fail_channel_closes;
                let remote = MockChannel::new(
                    &ChannelSpec::ad_hoc(&local.label),
                    to.events.clone(),
                    fail_closes,
                );
                to.state.lock().channels.push(remote.clone());
                to.events.emit(PeerEvent::RemoteChannel(remote.clone()));
                remote
            }
        };

        *local.counterpart.lock() = Some(Arc::downgrade(&remote));
        *remote.counterpart.lock() = Some(Arc::downgrade(&local));
        for end in [&local, &remote] {
            end.set_state(ChannelState::Open);
            end.owner.emit(PeerEvent::ChannelOpen(end.id));
        }
    }
}

#[async_trait]
impl PeerConnection for MockPeer {
    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    fn connection_state(&self) -> ConnectionState {
        self.state.lock().connection
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        match self.signaling_state() {
            SignalingState::Stable | SignalingState::HaveLocalOffer => {
                Ok(SessionDescription::offer(self.next_sdp("offer")))
            }
            other => Err(TransportError::InvalidState(other)),
        }
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        match self.signaling_state() {
            SignalingState::HaveRemoteOffer => Ok(SessionDescription::answer(self.next_sdp("answer"))),
            other => Err(TransportError::InvalidState(other)),
        }
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let connect = {
            let mut state = self.state.lock();
            match (description.kind, state.signaling) {
                (SdpKind::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                    state.pending_local = Some(description);
                    state.signaling = SignalingState::HaveLocalOffer;
                    false
                }
                (SdpKind::Answer, SignalingState::HaveRemoteOffer) => {
                    state.current_local = Some(description);
                    state.current_remote = state.pending_remote.take();
                    state.signaling = SignalingState::Stable;
                    true
                }
                (SdpKind::Rollback, SignalingState::HaveLocalOffer) => {
                    state.pending_local = None;
                    state.signaling = SignalingState::Stable;
                    false
                }
                (_, signaling) => return Err(TransportError::InvalidState(signaling)),
            }
        };
        if connect {
            self.try_connect();
        }
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let connect = {
            let mut state = self.state.lock();
            match (description.kind, state.signaling) {
                (SdpKind::Offer, SignalingState::Stable) => {
                    state.pending_remote = Some(description);
                    state.signaling = SignalingState::HaveRemoteOffer;
                    false
                }
                (SdpKind::Answer, SignalingState::HaveLocalOffer) => {
                    state.current_remote = Some(description);
                    state.current_local = state.pending_local.take();
                    state.signaling = SignalingState::Stable;
                    true
                }
                (SdpKind::Rollback, SignalingState::HaveRemoteOffer) => {
                    state.pending_remote = None;
                    state.signaling = SignalingState::Stable;
                    false
                }
                (_, signaling) => return Err(TransportError::InvalidState(signaling)),
            }
        };
        if connect {
            self.try_connect();
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        match state.signaling {
            SignalingState::HaveLocalOffer => {
                state.pending_local = None;
                state.signaling = SignalingState::Stable;
                Ok(())
            }
            SignalingState::Stable => Ok(()),
            other => Err(TransportError::InvalidState(other)),
        }
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let state = self.state.lock();
        state
            .pending_local
            .clone()
            .or_else(|| state.current_local.clone())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        if state.reject_candidates {
            return Err(TransportError::Other("candidate rejected".into()));
        }
        if state.current_remote.is_none() && state.pending_remote.is_none() {
            return Err(TransportError::InvalidState(state.signaling));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    async fn create_data_channel(
        &self,
        spec: ChannelSpec,
    ) -> Result<Arc<dyn DataChannel>, TransportError> {
        self.ensure_open()?;
        let fail_closes = self.state.lock().fail_channel_closes;
        let channel = MockChannel::new(&spec, self.events.clone(), fail_closes);
        self.state.lock().channels.push(channel.clone());
        self.request_negotiation_once();
        if let Some(other) = self.connected_counterpart() {
            link_channels(self, &other);
        }
        Ok(channel)
    }

    async fn add_track(&self, track: LocalTrack) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.state.lock().tracks.push(track);
        self.request_negotiation_once();
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let channels = {
            let mut state = self.state.lock();
            state.signaling = SignalingState::Closed;
            state.connection = ConnectionState::Closed;
            std::mem::take(&mut state.channels)
        };
        for channel in channels {
            channel.set_state(ChannelState::Closed);
            if let Some(remote) = channel.counterpart() {
                if remote.state() != ChannelState::Closed {
                    remote.set_state(ChannelState::Closed);
                    remote.owner.emit(PeerEvent::ChannelClosed(remote.id));
                }
            }
        }
        Ok(())
    }
}

pub struct MockChannel {
    id: ChannelId,
    label: String,
    negotiated_id: Option<u16>,
    owner: PeerEventSink,
    state: Mutex<ChannelState>,
    binary_type: AtomicU8,
    counterpart: Mutex<Option<Weak<MockChannel>>>,
    fail_sends: AtomicBool,
    fail_closes: bool,
    sent: Mutex<Vec<ChannelPayload>>,
}

impl MockChannel {
    fn new(spec: &ChannelSpec, owner: PeerEventSink, fail_closes: bool) -> Arc<Self> {
        Arc::new(Self {
            id: ChannelId::next(),
            label: spec.label.clone(),
            negotiated_id: spec.negotiated_id,
            owner,
            state: Mutex::new(ChannelState::Connecting),
            binary_type: AtomicU8::new(0),
            counterpart: Mutex::new(None),
            fail_sends: AtomicBool::new(false),
            fail_closes,
            sent: Mutex::new(Vec::new()),
        })
    }

    fn set_state(&self, state: ChannelState) {
        *self.state.lock() = state;
    }

    fn counterpart(&self) -> Option<Arc<MockChannel>> {
        self.counterpart.lock().as_ref().and_then(Weak::upgrade)
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<ChannelPayload> {
        self.sent.lock().clone()
    }

    fn deliver(&self, payload: ChannelPayload) -> Result<(), TransportError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Other("injected send failure".into()));
        }
        if self.state() != ChannelState::Open {
            return Err(TransportError::ChannelNotOpen(self.label.clone()));
        }
        let remote = self
            .counterpart()
            .ok_or_else(|| TransportError::ChannelNotOpen(self.label.clone()))?;
        self.sent.lock().push(payload.clone());
        remote.owner.emit(PeerEvent::ChannelMessage(remote.id, payload));
        Ok(())
    }
}

#[async_trait]
impl DataChannel for MockChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn label(&self) -> String {
        self.label.clone()
    }

    fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    fn binary_type(&self) -> BinaryType {
        match self.binary_type.load(Ordering::SeqCst) {
            0 => BinaryType::Blob,
            _ => BinaryType::ArrayBuffer,
        }
    }

    fn set_binary_type(&self, binary_type: BinaryType) {
        let raw = match binary_type {
            BinaryType::Blob => 0,
            BinaryType::ArrayBuffer => 1,
        };
        self.binary_type.store(raw, Ordering::SeqCst);
    }

    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        self.deliver(ChannelPayload::Text(text.to_string()))
    }

    async fn send_binary(&self, data: Bytes) -> Result<(), TransportError> {
        self.deliver(ChannelPayload::Binary(data))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.fail_closes {
            return Err(TransportError::Other("injected close failure".into()));
        }
        if self.state() == ChannelState::Closed {
            return Ok(());
        }
        self.set_state(ChannelState::Closed);
        self.owner.emit(PeerEvent::ChannelClosed(self.id));
        if let Some(remote) = self.counterpart() {
            if remote.state() != ChannelState::Closed {
                remote.set_state(ChannelState::Closed);
                remote.owner.emit(PeerEvent::ChannelClosed(remote.id));
            }
        }
        Ok(())
    }
}
