//! Room membership on top of the relay.
//!
//! A [`RoomController`] turns relay membership frames into call sessions:
//! one session in a two-party room, one per remote member in a multi-party
//! room. It also owns the chat log, local media and the collaborator calls.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tandem_proto::{Features, FileMetadata, RelayFrame, RoomId, RoomKind};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::assist::{ASSIST_PLACEHOLDER, CompletionClient, TranscriptionClient};
use crate::delivery::{
    Author, ChatEntry, ChatLog, DeliveryState, FileSource, Outgoing, OutgoingFile, ReceivedFile,
    Stamper, TransferPolicy,
};
use crate::media::{LocalMedia, VideoFilter};
use crate::negotiation::RelaySignalSink;
use crate::session::{
    CallSession, SessionCommand, SessionConfig, SessionEvent, SessionHandle, SessionInput,
    SessionUpdate,
};
use crate::signaling::RelayConnection;
use crate::transport::PeerConnectionFactory;

#[derive(Debug, Clone)]
pub struct RoomOptions {
    pub features: Features,
    pub capture_audio: bool,
    pub capture_video: bool,
    pub transfer_policy: TransferPolicy,
    /// Received files are written here. Nothing is written when unset.
    pub download_dir: Option<PathBuf>,
    pub tick: Duration,
}

impl Default for RoomOptions {
    fn default() -> Self {
        Self {
            features: Features::default(),
            capture_audio: true,
            capture_video: true,
            transfer_policy: TransferPolicy::default(),
            download_dir: None,
            tick: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AssistClients {
    pub completion: Option<CompletionClient>,
    pub transcription: Option<TranscriptionClient>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomCommand {
    SendText(String),
    SendFile(PathBuf),
    ToggleMic,
    ToggleCam,
    CycleFilter,
    /// Ask the completion endpoint; the answer lands in the chat log only.
    Ask(String),
    /// Transcribe a wav file and send the text as chat.
    Transcribe(PathBuf),
    Leave,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    Joined { self_id: String, peers: Vec<String> },
    MemberJoined(String),
    MemberLeft(String),
    Sent(ChatEntry),
    Received(ChatEntry),
    Assistant(ChatEntry),
    Delivered { timestamp: u64, state: DeliveryState },
    MicToggled(bool),
    CamToggled(bool),
    FilterApplied(VideoFilter),
    /// Session updates the room does not consume itself.
    Peer(SessionEvent),
    Error(String),
    Closed,
}

#[derive(Debug, Error)]
#[error("room has closed")]
pub struct RoomClosed;

pub struct RoomHandle {
    commands: mpsc::UnboundedSender<RoomCommand>,
    task: JoinHandle<ChatLog>,
}

impl RoomHandle {
    pub fn command(&self, command: RoomCommand) -> Result<(), RoomClosed> {
        self.commands.send(command).map_err(|_| RoomClosed)
    }

    pub fn commands(&self) -> mpsc::UnboundedSender<RoomCommand> {
        self.commands.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Leaves the room and returns the final chat log.
    pub async fn leave(self) -> ChatLog {
        let _ = self.commands.send(RoomCommand::Leave);
        match self.task.await {
            Ok(log) => log,
            Err(err) => {
                warn!(target: "tandem::room", "room task ended abnormally: {err}");
                ChatLog::new()
            }
        }
    }
}

enum AssistReply {
    Answer(String),
    Transcript(String),
}

pub struct RoomController {
    room: RoomId,
    relay: RelayConnection,
    factory: Arc<dyn PeerConnectionFactory>,
    stamper: Arc<Stamper>,
    options: RoomOptions,
    assist: AssistClients,
    features: Features,
    media: LocalMedia,
    log: ChatLog,
    self_id: Option<String>,
    sessions: HashMap<String, SessionHandle>,
    /// Commands issued before the relay confirmed membership.
    pending: Vec<SessionCommand>,
    session_tx: mpsc::UnboundedSender<SessionEvent>,
    assist_tx: mpsc::UnboundedSender<AssistReply>,
    events: mpsc::UnboundedSender<RoomEvent>,
}

impl RoomController {
    pub fn start(
        room: RoomId,
        relay: RelayConnection,
        factory: Arc<dyn PeerConnectionFactory>,
        stamper: Arc<Stamper>,
        options: RoomOptions,
        assist: AssistClients,
    ) -> (RoomHandle, mpsc::UnboundedReceiver<RoomEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let (assist_tx, assist_rx) = mpsc::unbounded_channel();

        let features = options.features.clone();
        let media = LocalMedia::new(options.capture_audio, options.capture_video, &features);
        let controller = RoomController {
            room,
            relay,
            factory,
            stamper,
            options,
            assist,
            features,
            media,
            log: ChatLog::new(),
            self_id: None,
            sessions: HashMap::new(),
            pending: Vec::new(),
            session_tx,
            assist_tx,
            events: event_tx,
        };
        let task = tokio::spawn(controller.run(command_rx, session_rx, assist_rx));
        (
            RoomHandle {
                commands: command_tx,
                task,
            },
            event_rx,
        )
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<RoomCommand>,
        mut session_events: mpsc::UnboundedReceiver<SessionEvent>,
        mut assist_replies: mpsc::UnboundedReceiver<AssistReply>,
    ) -> ChatLog {
        info!(target: "tandem::room", room = %self.room, kind = ?self.room.kind(), "joining room");
        loop {
            tokio::select! {
                frame = self.relay.inbound.recv() => match frame {
                    Some(frame) => self.on_relay_frame(frame).await,
                    None => {
                        warn!(target: "tandem::room", "relay connection closed");
                        self.emit(RoomEvent::Error("relay connection closed".into()));
                        break;
                    }
                },
                command = commands.recv() => match command {
                    Some(RoomCommand::Leave) | None => break,
                    Some(command) => self.on_command(command).await,
                },
                Some(event) = session_events.recv() => self.on_session_event(event).await,
                Some(reply) = assist_replies.recv() => self.on_assist_reply(reply).await,
            }
        }

        for (_, session) in self.sessions.drain() {
            session.shutdown().await;
        }
        info!(target: "tandem::room", room = %self.room, "left room");
        self.emit(RoomEvent::Closed);
        self.log
    }

    async fn on_relay_frame(&mut self, frame: RelayFrame) {
        let kind = self.room.kind();
        match frame {
            RelayFrame::ConnectedPeers { assigned_id, peers } => {
                info!(
                    target: "tandem::room",
                    id = %assigned_id,
                    present = peers.len(),
                    "registered with relay"
                );
                self.self_id = Some(assigned_id.clone());
                self.emit(RoomEvent::Joined {
                    self_id: assigned_id,
                    peers: peers.clone(),
                });
                match kind {
                    RoomKind::Pair => self.spawn_session(None, !peers.is_empty()).await,
                    RoomKind::Mesh => {
                        for peer in peers {
                            self.spawn_session(Some(peer), true).await;
                        }
                    }
                }
                for command in std::mem::take(&mut self.pending) {
                    self.broadcast(command);
                }
            }
            RelayFrame::ConnectedPeer { peer_id } => {
                self.emit(RoomEvent::MemberJoined(peer_id.clone()));
                match kind {
                    RoomKind::Pair => self.forward(String::new(), SessionInput::PeerJoined),
                    RoomKind::Mesh => self.spawn_session(Some(peer_id), false).await,
                }
            }
            RelayFrame::DisconnectedPeer { peer_id } => {
                self.emit(RoomEvent::MemberLeft(peer_id.clone()));
                match kind {
                    RoomKind::Pair => self.forward(String::new(), SessionInput::PeerLeft),
                    RoomKind::Mesh => {
                        if let Some(session) = self.sessions.remove(&peer_id) {
                            session.shutdown().await;
                        }
                    }
                }
            }
            RelayFrame::Signal { sender, payload } => {
                let key = match (kind, sender) {
                    (RoomKind::Pair, _) => String::new(),
                    (RoomKind::Mesh, Some(sender)) => sender,
                    (RoomKind::Mesh, None) => {
                        debug!(target: "tandem::room", "dropping signal without sender");
                        return;
                    }
                };
                self.forward(key, SessionInput::Signal(payload));
            }
            RelayFrame::Pong => trace!(target: "tandem::room", "pong"),
            RelayFrame::Error { message } => {
                warn!(target: "tandem::room", "relay error: {message}");
                self.emit(RoomEvent::Error(message));
            }
        }
    }

    /// Starts a session for `peer` (`None` in two-party rooms), replacing any
    /// previous one under the same key.
    async fn spawn_session(&mut self, peer: Option<String>, polite: bool) {
        let recipient = match self.room.kind() {
            RoomKind::Pair => None,
            RoomKind::Mesh => peer.clone(),
        };
        let signals = Arc::new(RelaySignalSink::new(self.relay.outbound.clone(), recipient));
        let key = peer.clone().unwrap_or_default();
        let config = SessionConfig {
            polite,
            peer,
            features: self.features.clone(),
            tracks: self.media.tracks(),
            transfer_policy: self.options.transfer_policy,
            tick: self.options.tick,
        };
        match CallSession::spawn(
            config,
            self.factory.clone(),
            signals,
            self.stamper.clone(),
            self.session_tx.clone(),
        )
        .await
        {
            Ok(handle) => {
                if let Some(previous) = self.sessions.insert(key, handle) {
                    previous.shutdown().await;
                }
            }
            Err(err) => {
                warn!(target: "tandem::room", "failed to start session: {err}");
                self.emit(RoomEvent::Error(format!("failed to start session: {err}")));
            }
        }
    }

    fn forward(&mut self, key: String, input: SessionInput) {
        let Some(session) = self.sessions.get(&key) else {
            debug!(target: "tandem::room", peer = %key, "no session for relay frame");
            return;
        };
        if session.send(input).is_err() {
            warn!(target: "tandem::room", peer = %key, "session has stopped");
            self.sessions.remove(&key);
        }
    }

    fn broadcast(&mut self, command: SessionCommand) {
        if self.self_id.is_none() {
            self.pending.push(command);
            return;
        }
        for (peer, session) in &self.sessions {
            if session.command(command.clone()).is_err() {
                warn!(target: "tandem::room", %peer, "session has stopped");
            }
        }
    }

    async fn on_command(&mut self, command: RoomCommand) {
        match command {
            RoomCommand::SendText(text) => self.send_text(text),
            RoomCommand::SendFile(path) => {
                let timestamp = self.stamper.next();
                match outgoing_file(&path, timestamp).await {
                    Ok(file) => {
                        self.log
                            .append_file(Author::Local, file.metadata.clone(), Some(path));
                        self.emit_latest(RoomEvent::Sent);
                        self.broadcast(SessionCommand::Send(Outgoing::File(file)));
                    }
                    Err(err) => {
                        warn!(target: "tandem::room", path = %path.display(), "cannot send file: {err}");
                        self.emit(RoomEvent::Error(format!(
                            "cannot send {}: {err}",
                            path.display()
                        )));
                    }
                }
            }
            RoomCommand::ToggleMic => {
                let enabled = self.media.toggle_mic(&mut self.features);
                self.broadcast(SessionCommand::UpdateFeatures(self.features.subset(&["audio"])));
                self.emit(RoomEvent::MicToggled(enabled));
            }
            RoomCommand::ToggleCam => {
                let enabled = self.media.toggle_cam(&mut self.features);
                self.broadcast(SessionCommand::UpdateFeatures(self.features.subset(&["video"])));
                self.emit(RoomEvent::CamToggled(enabled));
            }
            RoomCommand::CycleFilter => {
                let filter = self.media.cycle_filter();
                self.broadcast(SessionCommand::ApplyFilter(filter.name().to_string()));
                self.emit(RoomEvent::FilterApplied(filter));
            }
            RoomCommand::Ask(question) => self.ask(question),
            RoomCommand::Transcribe(path) => self.transcribe(path),
            RoomCommand::Leave => {}
        }
    }

    fn send_text(&mut self, text: String) {
        let timestamp = self.stamper.next();
        self.log.append_text(Author::Local, text.clone(), timestamp);
        self.emit_latest(RoomEvent::Sent);
        self.broadcast(SessionCommand::Send(Outgoing::Text { text, timestamp }));
    }

    fn ask(&mut self, question: String) {
        let Some(client) = self.assist.completion.clone() else {
            warn!(target: "tandem::assist", "no completion endpoint configured");
            self.append_assistant(ASSIST_PLACEHOLDER.to_string());
            return;
        };
        let history = self.log.chat_history();
        let replies = self.assist_tx.clone();
        tokio::spawn(async move {
            let answer = match client.complete(&question, &history).await {
                Ok(answer) => answer,
                Err(err) => {
                    warn!(target: "tandem::assist", "completion failed: {err}");
                    ASSIST_PLACEHOLDER.to_string()
                }
            };
            let _ = replies.send(AssistReply::Answer(answer));
        });
    }

    fn transcribe(&mut self, path: PathBuf) {
        let Some(client) = self.assist.transcription.clone() else {
            warn!(target: "tandem::assist", "no transcription endpoint configured");
            self.append_assistant(ASSIST_PLACEHOLDER.to_string());
            return;
        };
        let replies = self.assist_tx.clone();
        tokio::spawn(async move {
            let reply = match client.transcribe_file(&path).await {
                Ok(text) => AssistReply::Transcript(text),
                Err(err) => {
                    warn!(target: "tandem::assist", path = %path.display(), "transcription failed: {err}");
                    AssistReply::Answer(ASSIST_PLACEHOLDER.to_string())
                }
            };
            let _ = replies.send(reply);
        });
    }

    async fn on_assist_reply(&mut self, reply: AssistReply) {
        match reply {
            AssistReply::Answer(text) => self.append_assistant(text),
            AssistReply::Transcript(text) if text.trim().is_empty() => {
                debug!(target: "tandem::assist", "empty transcript");
            }
            AssistReply::Transcript(text) => self.send_text(text),
        }
    }

    fn append_assistant(&mut self, text: String) {
        let timestamp = self.stamper.now();
        self.log.append_text(Author::Assistant, text, timestamp);
        self.emit_latest(RoomEvent::Assistant);
    }

    async fn on_session_event(&mut self, event: SessionEvent) {
        let SessionEvent { peer, update } = event;
        match update {
            SessionUpdate::ChatReceived { text, timestamp } => {
                self.log.append_text(Author::Remote(peer), text, timestamp);
                self.emit_latest(RoomEvent::Received);
            }
            SessionUpdate::FileReceived(file) => {
                let saved_to = self.save(&file).await;
                self.log
                    .append_file(Author::Remote(peer), file.metadata, saved_to);
                self.emit_latest(RoomEvent::Received);
            }
            SessionUpdate::Acknowledged(ack) => {
                if let Some(state) = self.log.mark_delivered(&ack) {
                    debug!(
                        target: "tandem::room",
                        id = ack.id,
                        round_trip_ms = ack.round_trip_ms(),
                        ?state,
                        "delivered"
                    );
                    self.emit(RoomEvent::Delivered {
                        timestamp: ack.id,
                        state,
                    });
                }
            }
            update => self.emit(RoomEvent::Peer(SessionEvent { peer, update })),
        }
    }

    async fn save(&self, file: &ReceivedFile) -> Option<PathBuf> {
        let dir = self.options.download_dir.as_deref()?;
        match file.save_to(dir).await {
            Ok(path) => {
                info!(target: "tandem::room", path = %path.display(), "saved received file");
                Some(path)
            }
            Err(err) => {
                warn!(target: "tandem::room", "failed to save {}: {err}", file.metadata.name);
                None
            }
        }
    }

    fn emit_latest(&self, wrap: fn(ChatEntry) -> RoomEvent) {
        if let Some(entry) = self.log.entries().last() {
            self.emit(wrap(entry.clone()));
        }
    }

    fn emit(&self, event: RoomEvent) {
        let _ = self.events.send(event);
    }
}

/// Describes a file on disk for sending. `kind` is `image` for image MIME
/// types and `file` otherwise.
pub async fn outgoing_file(path: &Path, timestamp: u64) -> io::Result<OutgoingFile> {
    let stat = tokio::fs::metadata(path).await?;
    if !stat.is_file() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"));
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let mime = mime_for(&name);
    let kind = if mime.starts_with("image/") { "image" } else { "file" };
    Ok(OutgoingFile {
        metadata: FileMetadata {
            kind: kind.to_string(),
            name,
            size: stat.len(),
            timestamp,
            mime: mime.to_string(),
        },
        source: FileSource::Path(path.to_path_buf()),
    })
}

fn mime_for(name: &str) -> &'static str {
    let extension = Path::new(name)
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "txt" => "text/plain",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "wav" => "audio/wav",
        _ => "application/octet-stream",
    }
}
