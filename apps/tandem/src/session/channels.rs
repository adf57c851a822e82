//! Data channel bookkeeping and per-channel protocol handling.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value};
use tandem_proto::{BinaryType, Capability, Message};
use tracing::{debug, trace, warn};

use super::{CallSession, SessionEvent, SessionUpdate};
use crate::delivery::{
    FileReceiver, FileSender, Outgoing, OutgoingFile, ReceiveProgress, TransferError,
    negotiate_binary_type,
};
use crate::media::MediaKind;
use crate::transport::{
    ChannelId, ChannelPayload, ChannelSpec, ConnectionState, DataChannel, FILTER_CHANNEL_PREFIX,
};

enum ChannelRole {
    Features,
    Chat,
    /// Outgoing file; `file` is taken when the channel opens.
    FileOut {
        file: Option<OutgoingFile>,
        started_at: Instant,
    },
    FileIn(FileReceiver),
    FilterOut,
    FilterIn,
}

struct ChannelEntry {
    channel: Arc<dyn DataChannel>,
    role: ChannelRole,
}

#[derive(Default)]
pub(crate) struct ChannelSet {
    entries: HashMap<ChannelId, ChannelEntry>,
    features: Option<ChannelId>,
    chat: Option<ChannelId>,
}

impl ChannelSet {
    pub(crate) fn set_features(&mut self, channel: Arc<dyn DataChannel>) {
        self.features = Some(channel.id());
        self.insert(channel, ChannelRole::Features);
    }

    pub(crate) fn set_chat(&mut self, channel: Arc<dyn DataChannel>) {
        self.chat = Some(channel.id());
        self.insert(channel, ChannelRole::Chat);
    }

    fn insert(&mut self, channel: Arc<dyn DataChannel>, role: ChannelRole) {
        self.entries.insert(channel.id(), ChannelEntry { channel, role });
    }

    fn channel(&self, id: ChannelId) -> Option<Arc<dyn DataChannel>> {
        self.entries.get(&id).map(|entry| entry.channel.clone())
    }

    pub(crate) fn chat(&self) -> Option<Arc<dyn DataChannel>> {
        self.chat.and_then(|id| self.channel(id))
    }

    pub(crate) fn features(&self) -> Option<Arc<dyn DataChannel>> {
        self.features.and_then(|id| self.channel(id))
    }

    pub(crate) fn chat_open(&self) -> bool {
        self.chat().is_some_and(|channel| channel.is_open())
    }

    /// Labels of file transfers still in progress in either direction.
    pub(crate) fn in_flight_transfers(&self) -> Vec<String> {
        self.entries
            .values()
            .filter(|entry| {
                matches!(
                    entry.role,
                    ChannelRole::FileOut { .. } | ChannelRole::FileIn(_)
                )
            })
            .map(|entry| entry.channel.label())
            .collect()
    }

    fn expired_transfers(
        &self,
        now: Instant,
        expired: impl Fn(Instant, Instant) -> bool,
    ) -> Vec<ChannelId> {
        self.entries
            .iter()
            .filter_map(|(id, entry)| {
                let started_at = match &entry.role {
                    ChannelRole::FileOut { started_at, .. } => *started_at,
                    ChannelRole::FileIn(receiver) => receiver.started_at(),
                    _ => return None,
                };
                expired(started_at, now).then_some(*id)
            })
            .collect()
    }
}

impl CallSession {
    /// Sends one queued item. Hands the item back on failure.
    pub(super) async fn send_now(&mut self, item: Outgoing) -> Result<(), Outgoing> {
        if let Outgoing::File(file) = &item {
            let spec = ChannelSpec::ad_hoc(file.metadata.channel_label());
            return match self.remote.connection.create_data_channel(spec).await {
                Ok(channel) => {
                    debug!(
                        target: "tandem::channels",
                        label = %channel.label(),
                        size = file.metadata.size,
                        "file channel created"
                    );
                    self.remote.channels.insert(
                        channel,
                        ChannelRole::FileOut {
                            file: Some(file.clone()),
                            started_at: Instant::now(),
                        },
                    );
                    Ok(())
                }
                Err(err) => {
                    warn!(target: "tandem::channels", "failed to open file channel: {err}");
                    Err(item)
                }
            };
        }

        let Some(envelope) = item.envelope() else {
            return Ok(());
        };
        let Some(chat) = self.remote.channels.chat() else {
            return Err(item);
        };
        let text = match serde_json::to_string(&envelope) {
            Ok(text) => text,
            Err(err) => {
                warn!(target: "tandem::channels", "dropping unencodable message: {err}");
                return Ok(());
            }
        };
        match chat.send_text(&text).await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(target: "tandem::channels", "error sending message: {err}");
                Err(item)
            }
        }
    }

    pub(super) async fn share_features(&mut self, update: Map<String, Value>) {
        self.local.features.merge(update.clone());
        let Some(channel) = self.remote.channels.features().filter(|c| c.is_open()) else {
            debug!(
                target: "tandem::channels",
                "features channel not open; full state goes out on open"
            );
            return;
        };
        self.send_features(channel.as_ref(), update).await;
    }

    async fn send_features(&self, channel: &dyn DataChannel, map: Map<String, Value>) {
        let text = Value::Object(map).to_string();
        if let Err(err) = channel.send_text(&text).await {
            warn!(target: "tandem::channels", "failed to share features: {err}");
        }
    }

    pub(super) async fn apply_filter(&mut self, name: &str) {
        if self.remote.connection.connection_state() != ConnectionState::Connected {
            debug!(target: "tandem::channels", filter = name, "not connected; filter not shared");
            return;
        }
        let spec = ChannelSpec::ad_hoc(format!("{FILTER_CHANNEL_PREFIX}{name}"));
        match self.remote.connection.create_data_channel(spec).await {
            Ok(channel) => self.remote.channels.insert(channel, ChannelRole::FilterOut),
            Err(err) => warn!(target: "tandem::channels", "failed to open filter channel: {err}"),
        }
    }

    pub(super) async fn on_remote_channel(&mut self, channel: Arc<dyn DataChannel>) {
        let label = channel.label();
        debug!(target: "tandem::channels", %label, "data channel added");
        if let Some(filter) = label.strip_prefix(FILTER_CHANNEL_PREFIX) {
            self.emit(SessionUpdate::RemoteFilter(filter.to_string()));
            if channel.is_open() {
                close_channel(channel.as_ref()).await;
            } else {
                self.remote.channels.insert(channel, ChannelRole::FilterIn);
            }
            return;
        }
        let receiver = FileReceiver::new(label, Instant::now());
        self.remote
            .channels
            .insert(channel, ChannelRole::FileIn(receiver));
    }

    pub(super) async fn on_channel_open(&mut self, id: ChannelId) {
        let Some(entry) = self.remote.channels.entries.get_mut(&id) else {
            trace!(target: "tandem::channels", ?id, "open for unknown channel");
            return;
        };
        let channel = entry.channel.clone();
        match entry.role {
            ChannelRole::Features => {
                self.local.features.binary_type = Some(channel.binary_type());
                let full = self.local.features.to_map();
                self.send_features(channel.as_ref(), full).await;
            }
            ChannelRole::Chat => {
                debug!(
                    target: "tandem::channels",
                    queued = self.local.queue.len(),
                    "chat channel opened"
                );
                self.drain_queue().await;
            }
            ChannelRole::FileOut { ref mut file, .. } => {
                let Some(file) = file.take() else { return };
                let binary_type = negotiate_binary_type(
                    self.local.features.binary_type,
                    self.remote_binary_type(),
                );
                self.spawn_file_send(channel, file, binary_type);
            }
            ChannelRole::FilterIn => {
                self.remote.channels.entries.remove(&id);
                close_channel(channel.as_ref()).await;
            }
            ChannelRole::FileIn(_) | ChannelRole::FilterOut => {}
        }
    }

    fn spawn_file_send(
        &self,
        channel: Arc<dyn DataChannel>,
        file: OutgoingFile,
        binary_type: BinaryType,
    ) {
        let updates = self.updates.clone();
        let peer = self.peer.clone();
        tokio::spawn(async move {
            let sender = FileSender::new(file, binary_type);
            if let Err(err) = sender.send_over(channel.as_ref()).await {
                warn!(target: "tandem::channels", label = %channel.label(), "file send failed: {err}");
                close_channel(channel.as_ref()).await;
                let _ = updates.send(SessionEvent {
                    peer,
                    update: SessionUpdate::TransferAbandoned {
                        label: channel.label(),
                        reason: err.to_string(),
                    },
                });
            }
        });
    }

    pub(super) async fn on_channel_message(&mut self, id: ChannelId, payload: ChannelPayload) {
        let Some(entry) = self.remote.channels.entries.get_mut(&id) else {
            trace!(target: "tandem::channels", ?id, "message for unknown channel");
            return;
        };
        let channel = entry.channel.clone();
        if let ChannelRole::FileIn(receiver) = &mut entry.role {
            let progress = match payload {
                ChannelPayload::Text(text) => receiver.on_text(&text),
                ChannelPayload::Binary(data) => receiver.on_binary(data),
            };
            self.on_receive_progress(id, channel, progress).await;
            return;
        }

        let text = match payload {
            ChannelPayload::Text(text) => text,
            ChannelPayload::Binary(data) => {
                debug!(
                    target: "tandem::channels",
                    label = %channel.label(),
                    len = data.len(),
                    "ignoring binary frame"
                );
                return;
            }
        };
        match entry.role {
            ChannelRole::Features => match serde_json::from_str::<Map<String, Value>>(&text) {
                Ok(map) => self.apply_remote_features(map),
                Err(err) => warn!(target: "tandem::channels", "bad features frame: {err}"),
            },
            ChannelRole::Chat => self.on_chat_text(&text).await,
            ChannelRole::FileOut { .. } => {
                // The only thing a receiver ever sends back is the ack.
                match serde_json::from_str::<Message>(&text) {
                    Ok(Message::Ack(ack)) => {
                        self.emit(SessionUpdate::Acknowledged(ack));
                        self.remote.channels.entries.remove(&id);
                        close_channel(channel.as_ref()).await;
                    }
                    Ok(other) => {
                        debug!(target: "tandem::channels", ?other, "unexpected frame on file channel")
                    }
                    Err(err) => warn!(target: "tandem::channels", "bad ack on file channel: {err}"),
                }
            }
            ChannelRole::FileIn(_) | ChannelRole::FilterIn | ChannelRole::FilterOut => {}
        }
    }

    async fn on_chat_text(&mut self, text: &str) {
        let message = match serde_json::from_str::<Message>(text) {
            Ok(message) => message,
            Err(err) => {
                warn!(target: "tandem::channels", "bad chat envelope: {err}");
                return;
            }
        };
        if let Some(ack) = message.ack_for(self.stamper.now()) {
            self.send_or_queue(Outgoing::Ack(ack)).await;
        }
        match message {
            Message::Text { text, timestamp } => {
                self.emit(SessionUpdate::ChatReceived { text, timestamp });
            }
            Message::Ack(ack) => self.emit(SessionUpdate::Acknowledged(ack)),
            Message::File { metadata, .. } => {
                debug!(target: "tandem::channels", name = %metadata.name, "file announced on chat channel");
            }
        }
    }

    async fn on_receive_progress(
        &mut self,
        id: ChannelId,
        channel: Arc<dyn DataChannel>,
        progress: Result<ReceiveProgress, TransferError>,
    ) {
        match progress {
            Ok(ReceiveProgress::Pending) => {}
            Ok(ReceiveProgress::Complete(file)) => {
                self.remote.channels.entries.remove(&id);
                let ack = Message::Ack(tandem_proto::Ack {
                    id: file.metadata.timestamp,
                    timestamp: self.stamper.now(),
                });
                debug!(
                    target: "tandem::channels",
                    name = %file.metadata.name,
                    size = file.metadata.size,
                    "file received"
                );
                self.emit(SessionUpdate::FileReceived(file));
                let sent = match serde_json::to_string(&ack) {
                    Ok(text) => channel.send_text(&text).await.is_ok(),
                    Err(_) => false,
                };
                if !sent {
                    if let Message::Ack(ack) = ack {
                        self.send_or_queue(Outgoing::Ack(ack)).await;
                    }
                }
            }
            Err(err) => {
                warn!(target: "tandem::channels", label = %channel.label(), "file transfer failed: {err}");
                self.remote.channels.entries.remove(&id);
                close_channel(channel.as_ref()).await;
                self.emit(SessionUpdate::TransferAbandoned {
                    label: channel.label(),
                    reason: err.to_string(),
                });
            }
        }
    }

    pub(super) fn on_channel_closed(&mut self, id: ChannelId) {
        let set = &mut self.remote.channels;
        if set.features == Some(id) || set.chat == Some(id) {
            debug!(target: "tandem::channels", ?id, "call channel closed");
            return;
        }
        let Some(entry) = set.entries.remove(&id) else {
            return;
        };
        match entry.role {
            ChannelRole::FileIn(_) | ChannelRole::FileOut { .. } => {
                self.emit(SessionUpdate::TransferAbandoned {
                    label: entry.channel.label(),
                    reason: "channel closed before completion".into(),
                });
            }
            ChannelRole::FilterOut => {
                debug!(target: "tandem::channels", label = %entry.channel.label(), "remote closed filter channel");
            }
            _ => {}
        }
    }

    pub(super) async fn expire_transfers(&mut self, now: Instant) {
        let policy = self.policy;
        let expired = self
            .remote
            .channels
            .expired_transfers(now, |started, now| policy.expired(started, now));
        for id in expired {
            let Some(entry) = self.remote.channels.entries.remove(&id) else {
                continue;
            };
            close_channel(entry.channel.as_ref()).await;
            self.emit(SessionUpdate::TransferAbandoned {
                label: entry.channel.label(),
                reason: TransferError::TimedOut.to_string(),
            });
        }
    }

    fn apply_remote_features(&mut self, map: Map<String, Value>) {
        for (key, value) in map {
            let capability = Capability::from_key(&key);
            self.remote.features.insert(key.clone(), value.clone());
            match capability {
                Some(Capability::Audio) => {
                    if let Some(on) = value.as_bool() {
                        self.emit(SessionUpdate::RemoteMic(on));
                    }
                }
                Some(Capability::Video) => {
                    if let Some(on) = value.as_bool() {
                        self.remote.stream.set_attached(MediaKind::Video, on);
                        let attached = self.remote.stream.is_attached(MediaKind::Video);
                        self.emit(SessionUpdate::RemoteVideo {
                            enabled: on,
                            attached,
                        });
                    }
                }
                Some(Capability::BinaryType) => {
                    trace!(target: "tandem::channels", ?value, "remote binary type");
                }
                None => trace!(target: "tandem::channels", %key, "stored unknown feature"),
            }
        }
    }

    fn remote_binary_type(&self) -> Option<BinaryType> {
        self.remote
            .features
            .get(Capability::BinaryType.key())
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }
}

async fn close_channel(channel: &dyn DataChannel) {
    if let Err(err) = channel.close().await {
        debug!(target: "tandem::channels", label = %channel.label(), "channel close failed: {err}");
    }
}
