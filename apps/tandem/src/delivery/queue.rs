use std::collections::VecDeque;
use std::path::PathBuf;

use bytes::Bytes;
use tandem_proto::{Ack, FileMetadata, Message};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileSource {
    Path(PathBuf),
    Bytes(Bytes),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingFile {
    pub metadata: FileMetadata,
    pub source: FileSource,
}

/// An item waiting to go out on the chat channel. Files are announced on
/// their own channel, but share the queue so ordering holds across kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Text { text: String, timestamp: u64 },
    File(OutgoingFile),
    Ack(Ack),
}

impl Outgoing {
    pub fn timestamp(&self) -> u64 {
        match self {
            Outgoing::Text { timestamp, .. } => *timestamp,
            Outgoing::File(file) => file.metadata.timestamp,
            Outgoing::Ack(ack) => ack.timestamp,
        }
    }

    /// The chat envelope for text and acks. Files never travel as a chat
    /// envelope.
    pub fn envelope(&self) -> Option<Message> {
        match self {
            Outgoing::Text { text, timestamp } => Some(Message::Text {
                text: text.clone(),
                timestamp: *timestamp,
            }),
            Outgoing::Ack(ack) => Some(Message::Ack(*ack)),
            Outgoing::File(_) => None,
        }
    }
}

/// FIFO of unsent items. New items go to the back; an item whose send
/// failed mid-drain goes back to the front.
#[derive(Debug, Default)]
pub struct MessageQueue {
    items: VecDeque<Outgoing>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&mut self, item: Outgoing) {
        self.items.push_back(item);
    }

    pub fn push_front(&mut self, item: Outgoing) {
        self.items.push_front(item);
    }

    pub fn pop_front(&mut self) -> Option<Outgoing> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Outgoing> {
        self.items.iter()
    }
}
