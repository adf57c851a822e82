//! One call with one remote party.
//!
//! A [`CallSession`] owns the local endpoint state (features, outbound queue,
//! negotiation role) and the remote endpoint state (peer connection, remote
//! stream, channels). Relay signals, peer-connection callbacks, local
//! commands and a periodic tick are all processed on a single task.

mod channels;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tandem_proto::{Ack, Features, Signal};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::delivery::{MessageQueue, Outgoing, ReceivedFile, Stamper, TransferPolicy};
use crate::media::{LocalTrack, RemoteStream, RemoteTrack};
use crate::negotiation::{CandidateOutcome, NegotiationEngine, SignalSink};
use crate::transport::{
    ChannelSpec, ConnectionState, PeerConnection, PeerConnectionFactory, PeerEvent,
    PeerEventEnvelope, PeerEventSink, TransportError,
};

use channels::ChannelSet;

const DEFAULT_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("session has shut down")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Fixed by join order: true when the remote party was already present.
    pub polite: bool,
    /// Relay id of the remote party. Required in mesh rooms; carried in every
    /// event for routing.
    pub peer: Option<String>,
    pub features: Features,
    pub tracks: Vec<LocalTrack>,
    pub transfer_policy: TransferPolicy,
    pub tick: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            polite: false,
            peer: None,
            features: Features::default(),
            tracks: Vec::new(),
            transfer_policy: TransferPolicy::default(),
            tick: DEFAULT_TICK,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SessionInput {
    /// Payload of a relay `signal` frame.
    Signal(Value),
    /// Someone joined the room after us.
    PeerJoined,
    /// The remote party left; the remote endpoint is rebuilt.
    PeerLeft,
    Command(SessionCommand),
    Shutdown,
}

#[derive(Debug, Clone)]
pub enum SessionCommand {
    Send(Outgoing),
    /// Merge into the local features and publish just these keys.
    UpdateFeatures(Map<String, Value>),
    /// Announce a video filter through a short-lived channel.
    ApplyFilter(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    ConnectionState(ConnectionState),
    ChatReceived { text: String, timestamp: u64 },
    FileReceived(ReceivedFile),
    Acknowledged(Ack),
    RemoteMic(bool),
    RemoteVideo { enabled: bool, attached: bool },
    RemoteFilter(String),
    RemoteTrack(RemoteTrack),
    TransferAbandoned { label: String, reason: String },
    /// Recoverable trouble the session kept running through.
    Warning(String),
    /// The remote endpoint was torn down and rebuilt.
    Reset,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    pub peer: Option<String>,
    pub update: SessionUpdate,
}

pub struct SessionHandle {
    inputs: mpsc::UnboundedSender<SessionInput>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn send(&self, input: SessionInput) -> Result<(), SessionError> {
        self.inputs.send(input).map_err(|_| SessionError::Closed)
    }

    pub fn command(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.send(SessionInput::Command(command))
    }

    pub fn signal(&self, payload: Value) -> Result<(), SessionError> {
        self.send(SessionInput::Signal(payload))
    }

    /// A sender that outlives the handle, for routing relay frames.
    pub fn inputs(&self) -> mpsc::UnboundedSender<SessionInput> {
        self.inputs.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Closes the connection and waits for the loop to exit.
    pub async fn shutdown(self) {
        let _ = self.inputs.send(SessionInput::Shutdown);
        if let Err(err) = self.task.await {
            warn!(target: "tandem::session", "session task ended abnormally: {err}");
        }
    }
}

pub(crate) struct LocalEndpointState {
    pub(crate) features: Features,
    pub(crate) queue: MessageQueue,
    pub(crate) engine: NegotiationEngine,
}

pub(crate) struct RemoteEndpointState {
    pub(crate) connection: Arc<dyn PeerConnection>,
    pub(crate) stream: RemoteStream,
    pub(crate) features: Map<String, Value>,
    pub(crate) channels: ChannelSet,
}

pub struct CallSession {
    peer: Option<String>,
    factory: Arc<dyn PeerConnectionFactory>,
    signals: Arc<dyn SignalSink>,
    stamper: Arc<Stamper>,
    policy: TransferPolicy,
    tracks: Vec<LocalTrack>,
    generation: u64,
    peer_events: mpsc::UnboundedSender<PeerEventEnvelope>,
    updates: mpsc::UnboundedSender<SessionEvent>,
    local: LocalEndpointState,
    remote: RemoteEndpointState,
}

impl CallSession {
    /// Builds the first connection and its channels, then runs the session
    /// on its own task.
    pub async fn spawn(
        config: SessionConfig,
        factory: Arc<dyn PeerConnectionFactory>,
        signals: Arc<dyn SignalSink>,
        stamper: Arc<Stamper>,
        updates: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<SessionHandle, SessionError> {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (input_tx, input_rx) = mpsc::unbounded_channel();

        let generation = 1;
        let remote = establish(
            factory.as_ref(),
            PeerEventSink::new(generation, peer_tx.clone()),
            &config.tracks,
        )
        .await?;

        let session = CallSession {
            peer: config.peer,
            factory,
            signals,
            stamper,
            policy: config.transfer_policy,
            tracks: config.tracks,
            generation,
            peer_events: peer_tx,
            updates,
            local: LocalEndpointState {
                features: config.features,
                queue: MessageQueue::new(),
                engine: NegotiationEngine::new(config.polite),
            },
            remote,
        };
        debug!(
            target: "tandem::session",
            peer = ?session.peer,
            polite = config.polite,
            "session started"
        );

        let task = tokio::spawn(session.run(input_rx, peer_rx, config.tick));
        Ok(SessionHandle {
            inputs: input_tx,
            task,
        })
    }

    async fn run(
        mut self,
        mut inputs: mpsc::UnboundedReceiver<SessionInput>,
        mut peer_events: mpsc::UnboundedReceiver<PeerEventEnvelope>,
        tick: Duration,
    ) {
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                input = inputs.recv() => match input {
                    Some(SessionInput::Shutdown) | None => break,
                    Some(input) => self.handle_input(input).await,
                },
                Some(envelope) = peer_events.recv() => {
                    if envelope.generation != self.generation {
                        trace!(
                            target: "tandem::session",
                            stale = envelope.generation,
                            current = self.generation,
                            "dropping event from previous connection"
                        );
                        continue;
                    }
                    self.handle_peer_event(envelope.event).await;
                }
                _ = ticker.tick() => self.expire_transfers(Instant::now()).await,
            }
        }

        if let Err(err) = self.remote.connection.close().await {
            debug!(target: "tandem::session", "close on shutdown failed: {err}");
        }
        debug!(target: "tandem::session", peer = ?self.peer, "session stopped");
    }

    async fn handle_input(&mut self, input: SessionInput) {
        match input {
            SessionInput::Signal(payload) => self.handle_signal(payload).await,
            SessionInput::PeerJoined => {
                let result = self
                    .local
                    .engine
                    .on_peer_joined(self.remote.connection.as_ref(), self.signals.as_ref())
                    .await;
                if let Err(err) = result {
                    warn!(target: "tandem::session", "failed to resend offer: {err}");
                }
            }
            SessionInput::PeerLeft => self.reset().await,
            SessionInput::Command(command) => self.handle_command(command).await,
            SessionInput::Shutdown => {}
        }
    }

    async fn handle_signal(&mut self, payload: Value) {
        let signal = match Signal::from_value(payload) {
            Ok(signal) => signal,
            Err(err) => {
                debug!(target: "tandem::session", "ignoring unrecognised signal: {err}");
                return;
            }
        };
        let pc = self.remote.connection.clone();
        match signal {
            Signal::Description { description } => {
                let kind = description.kind;
                match self
                    .local
                    .engine
                    .on_remote_description(pc.as_ref(), self.signals.as_ref(), description)
                    .await
                {
                    Ok(outcome) => {
                        trace!(target: "tandem::session", ?kind, ?outcome, "remote description")
                    }
                    Err(err) => {
                        warn!(target: "tandem::session", ?kind, "remote description failed: {err}")
                    }
                }
            }
            Signal::Candidate { candidate } => {
                match self.local.engine.on_remote_candidate(pc.as_ref(), candidate).await {
                    Ok(CandidateOutcome::Added) => {}
                    Ok(CandidateOutcome::Suppressed) => {}
                    Err(err) => {
                        warn!(target: "tandem::session", "unable to add ICE candidate: {err}");
                        self.emit(SessionUpdate::Warning(format!("ICE candidate rejected: {err}")));
                    }
                }
            }
        }
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Send(item) => self.send_or_queue(item).await,
            SessionCommand::UpdateFeatures(map) => self.share_features(map).await,
            SessionCommand::ApplyFilter(name) => self.apply_filter(&name).await,
        }
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        let pc = self.remote.connection.clone();
        match event {
            PeerEvent::NegotiationNeeded => {
                if let Err(err) = self
                    .local
                    .engine
                    .on_negotiation_needed(pc.as_ref(), self.signals.as_ref())
                    .await
                {
                    warn!(target: "tandem::session", "failed to send offer: {err}");
                }
            }
            PeerEvent::IceCandidate(candidate) => {
                if let Err(err) = self
                    .local
                    .engine
                    .on_local_candidate(self.signals.as_ref(), candidate)
                    .await
                {
                    warn!(target: "tandem::session", "failed to send candidate: {err}");
                }
            }
            PeerEvent::ConnectionState(state) => {
                info!(target: "tandem::session", peer = ?self.peer, ?state, "connection state");
                self.emit(SessionUpdate::ConnectionState(state));
            }
            PeerEvent::RemoteChannel(channel) => self.on_remote_channel(channel).await,
            PeerEvent::ChannelOpen(id) => self.on_channel_open(id).await,
            PeerEvent::ChannelMessage(id, payload) => self.on_channel_message(id, payload).await,
            PeerEvent::ChannelClosed(id) => self.on_channel_closed(id),
            PeerEvent::Track(track) => {
                self.remote.stream.add(track.clone());
                self.emit(SessionUpdate::RemoteTrack(track));
            }
        }
    }

    /// Queues `item` behind anything already waiting, then drains if the chat
    /// channel is open.
    async fn send_or_queue(&mut self, item: Outgoing) {
        self.local.queue.push_back(item);
        if self.remote.channels.chat_open() {
            self.drain_queue().await;
        } else {
            trace!(
                target: "tandem::session",
                queued = self.local.queue.len(),
                "chat channel not open; queued"
            );
        }
    }

    /// Sends oldest-first. A failed item goes back to the head and draining
    /// stops until the next trigger.
    async fn drain_queue(&mut self) {
        while let Some(item) = self.local.queue.pop_front() {
            if let Err(item) = self.send_now(item).await {
                self.local.queue.push_front(item);
                break;
            }
        }
    }

    /// Tears down the remote endpoint and builds a fresh one. The outbound
    /// queue and local features survive.
    async fn reset(&mut self) {
        info!(target: "tandem::session", peer = ?self.peer, "resetting remote endpoint");
        if let Err(err) = self.remote.connection.close().await {
            debug!(target: "tandem::session", "close during reset failed: {err}");
        }
        for label in self.remote.channels.in_flight_transfers() {
            self.emit(SessionUpdate::TransferAbandoned {
                label,
                reason: "peer disconnected".into(),
            });
        }

        self.generation += 1;
        let polite = self.local.engine.polite();
        self.local.engine = NegotiationEngine::new(polite);
        let sink = PeerEventSink::new(self.generation, self.peer_events.clone());
        match establish(self.factory.as_ref(), sink, &self.tracks).await {
            Ok(remote) => self.remote = remote,
            Err(err) => {
                warn!(target: "tandem::session", "failed to rebuild connection: {err}");
                self.remote.channels = ChannelSet::default();
                self.remote.features.clear();
                self.remote.stream = RemoteStream::default();
            }
        }
        self.emit(SessionUpdate::Reset);
    }

    fn emit(&self, update: SessionUpdate) {
        let _ = self.updates.send(SessionEvent {
            peer: self.peer.clone(),
            update,
        });
    }
}

/// Creates a connection with the features and chat channels and the local
/// tracks attached.
async fn establish(
    factory: &dyn PeerConnectionFactory,
    events: PeerEventSink,
    tracks: &[LocalTrack],
) -> Result<RemoteEndpointState, TransportError> {
    let connection = factory.create(events).await?;
    let mut channels = ChannelSet::default();
    let features = connection.create_data_channel(ChannelSpec::features()).await?;
    channels.set_features(features);
    let chat = connection.create_data_channel(ChannelSpec::chat()).await?;
    channels.set_chat(chat);
    for track in tracks {
        connection.add_track(track.clone()).await?;
    }
    Ok(RemoteEndpointState {
        connection,
        stream: RemoteStream::default(),
        features: Map::new(),
        channels,
    })
}
