//! webrtc-rs backed implementation of the transport traits.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tandem_proto::{BinaryType, IceCandidate, SdpKind, SessionDescription};
use tracing::{debug, trace, warn};

use ::webrtc::api::APIBuilder;
use ::webrtc::api::interceptor_registry::register_default_interceptors;
use ::webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use ::webrtc::data_channel::RTCDataChannel;
use ::webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use ::webrtc::data_channel::data_channel_message::DataChannelMessage;
use ::webrtc::data_channel::data_channel_state::RTCDataChannelState;
use ::webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use ::webrtc::ice_transport::ice_server::RTCIceServer;
use ::webrtc::interceptor::registry::Registry;
use ::webrtc::peer_connection::RTCPeerConnection;
use ::webrtc::peer_connection::configuration::RTCConfiguration;
use ::webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use ::webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use ::webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use ::webrtc::peer_connection::signaling_state::RTCSignalingState;
use ::webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use ::webrtc::track::track_local::TrackLocal;
use ::webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::{
    ChannelId, ChannelPayload, ChannelSpec, ChannelState, ConnectionState, DataChannel,
    IceServer, PeerConnection, PeerConnectionFactory, PeerEvent, PeerEventSink, SignalingState,
    TransportError,
};
use crate::media::{LocalTrack, MediaKind, RemoteTrack};

pub struct WebRtcFactory {
    ice_servers: Vec<IceServer>,
}

impl WebRtcFactory {
    pub fn new(ice_servers: Vec<IceServer>) -> Self {
        Self { ice_servers }
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcFactory {
    async fn create(
        &self,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, TransportError> {
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await?);
        register_callbacks(&pc, &events);
        debug!(
            target: "tandem::transport",
            generation = events.generation(),
            "peer connection created"
        );
        Ok(Arc::new(WebRtcPeer { pc, events }))
    }
}

fn register_callbacks(pc: &Arc<RTCPeerConnection>, events: &PeerEventSink) {
    let sink = events.clone();
    pc.on_negotiation_needed(Box::new(move || {
        let sink = sink.clone();
        Box::pin(async move {
            sink.emit(PeerEvent::NegotiationNeeded);
        })
    }));

    let sink = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let sink = sink.clone();
        Box::pin(async move {
            // `None` marks the end of gathering; nothing to forward.
            let Some(candidate) = candidate else { return };
            match candidate.to_json() {
                Ok(init) => {
                    sink.emit(PeerEvent::IceCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }));
                }
                Err(err) => warn!(target: "tandem::transport", "unserializable candidate: {err}"),
            }
        })
    }));

    let sink = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let sink = sink.clone();
        Box::pin(async move {
            if let Some(state) = map_connection_state(state) {
                sink.emit(PeerEvent::ConnectionState(state));
            }
        })
    }));

    let sink = events.clone();
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let sink = sink.clone();
        Box::pin(async move {
            let channel = WebRtcChannel::wrap(dc, sink.clone());
            sink.emit(PeerEvent::RemoteChannel(channel.clone()));
            channel.report_open_if_ready();
        })
    }));

    let sink = events.clone();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let sink = sink.clone();
        let kind = match track.kind() {
            RTPCodecType::Audio => Some(MediaKind::Audio),
            RTPCodecType::Video => Some(MediaKind::Video),
            _ => None,
        };
        let id = track.id();
        Box::pin(async move {
            if let Some(kind) = kind {
                sink.emit(PeerEvent::Track(RemoteTrack { id, kind }));
            }
        })
    }));
}

fn map_connection_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    Some(match state {
        RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        _ => return None,
    })
}

fn map_signaling_state(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
        RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
        RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
        RTCSignalingState::Closed => SignalingState::Closed,
        _ => SignalingState::Stable,
    }
}

fn to_rtc_description(
    description: SessionDescription,
) -> Result<RTCSessionDescription, TransportError> {
    Ok(match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp)?,
        SdpKind::Pranswer => RTCSessionDescription::pranswer(description.sdp)?,
        SdpKind::Rollback => {
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            rollback
        }
    })
}

fn from_rtc_description(description: RTCSessionDescription) -> Option<SessionDescription> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        _ => return None,
    };
    Some(SessionDescription {
        kind,
        sdp: description.sdp,
    })
}

struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    events: PeerEventSink,
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    fn signaling_state(&self) -> SignalingState {
        map_signaling_state(self.pc.signaling_state())
    }

    fn connection_state(&self) -> ConnectionState {
        map_connection_state(self.pc.connection_state()).unwrap_or(ConnectionState::New)
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.pc.create_offer(None).await?;
        from_rtc_description(offer).ok_or_else(|| TransportError::Other("offer without type".into()))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self.pc.create_answer(None).await?;
        from_rtc_description(answer)
            .ok_or_else(|| TransportError::Other("answer without type".into()))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.pc
            .set_local_description(to_rtc_description(description)?)
            .await?;
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.pc
            .set_remote_description(to_rtc_description(description)?)
            .await?;
        Ok(())
    }

    async fn rollback(&self) -> Result<(), TransportError> {
        if self.signaling_state() != SignalingState::HaveLocalOffer {
            return Ok(());
        }
        let mut rollback = RTCSessionDescription::default();
        rollback.sdp_type = RTCSdpType::Rollback;
        self.pc.set_local_description(rollback).await?;
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.pc
            .local_description()
            .await
            .and_then(from_rtc_description)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn create_data_channel(
        &self,
        spec: ChannelSpec,
    ) -> Result<Arc<dyn DataChannel>, TransportError> {
        let init = RTCDataChannelInit {
            ordered: Some(spec.ordered),
            negotiated: spec.negotiated_id,
            ..Default::default()
        };
        let dc = self.pc.create_data_channel(&spec.label, Some(init)).await?;
        let channel = WebRtcChannel::wrap(dc, self.events.clone());
        channel.report_open_if_ready();
        Ok(channel)
    }

    async fn add_track(&self, track: LocalTrack) -> Result<(), TransportError> {
        let capability = match track.kind {
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
        };
        let local = Arc::new(TrackLocalStaticSample::new(
            capability,
            track.id.clone(),
            track.stream_id.clone(),
        ));
        self.pc
            .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.pc.close().await?;
        Ok(())
    }
}

pub struct WebRtcChannel {
    id: ChannelId,
    inner: Arc<RTCDataChannel>,
    binary_type: AtomicU8,
    open_reported: Arc<AtomicBool>,
    events: PeerEventSink,
}

impl WebRtcChannel {
    fn wrap(inner: Arc<RTCDataChannel>, events: PeerEventSink) -> Arc<Self> {
        let id = ChannelId::next();
        let open_reported = Arc::new(AtomicBool::new(false));

        let sink = events.clone();
        let reported = open_reported.clone();
        inner.on_open(Box::new(move || {
            let sink = sink.clone();
            let reported = reported.clone();
            Box::pin(async move {
                if !reported.swap(true, Ordering::AcqRel) {
                    sink.emit(PeerEvent::ChannelOpen(id));
                }
            })
        }));

        let sink = events.clone();
        inner.on_message(Box::new(move |msg: DataChannelMessage| {
            let sink = sink.clone();
            Box::pin(async move {
                let payload = if msg.is_string {
                    match String::from_utf8(msg.data.to_vec()) {
                        Ok(text) => ChannelPayload::Text(text),
                        Err(_) => ChannelPayload::Binary(msg.data),
                    }
                } else {
                    ChannelPayload::Binary(msg.data)
                };
                trace!(target: "tandem::transport", channel = ?id, "message");
                sink.emit(PeerEvent::ChannelMessage(id, payload));
            })
        }));

        let sink = events.clone();
        inner.on_close(Box::new(move || {
            let sink = sink.clone();
            Box::pin(async move {
                sink.emit(PeerEvent::ChannelClosed(id));
            })
        }));

        Arc::new(Self {
            id,
            inner,
            binary_type: AtomicU8::new(0),
            open_reported,
            events,
        })
    }

    /// The stack may have opened the channel before our handler was set.
    fn report_open_if_ready(&self) {
        if self.inner.ready_state() == RTCDataChannelState::Open
            && !self.open_reported.swap(true, Ordering::AcqRel)
        {
            self.events.emit(PeerEvent::ChannelOpen(self.id));
        }
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.state() == ChannelState::Open {
            Ok(())
        } else {
            Err(TransportError::ChannelNotOpen(self.label()))
        }
    }
}

#[async_trait]
impl DataChannel for WebRtcChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn label(&self) -> String {
        self.inner.label().to_string()
    }

    fn state(&self) -> ChannelState {
        match self.inner.ready_state() {
            RTCDataChannelState::Open => ChannelState::Open,
            RTCDataChannelState::Closing => ChannelState::Closing,
            RTCDataChannelState::Closed => ChannelState::Closed,
            _ => ChannelState::Connecting,
        }
    }

    fn binary_type(&self) -> BinaryType {
        match self.binary_type.load(Ordering::Acquire) {
            0 => BinaryType::Blob,
            _ => BinaryType::ArrayBuffer,
        }
    }

    fn set_binary_type(&self, binary_type: BinaryType) {
        let raw = match binary_type {
            BinaryType::Blob => 0,
            BinaryType::ArrayBuffer => 1,
        };
        self.binary_type.store(raw, Ordering::Release);
    }

    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.inner.send_text(text.to_string()).await?;
        Ok(())
    }

    async fn send_binary(&self, data: Bytes) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.inner.send(&data).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner.close().await?;
        Ok(())
    }
}
