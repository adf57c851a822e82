use std::path::PathBuf;

use tandem_proto::{Ack, FileMetadata};

use crate::assist::ChatTurn;

/// Acks arriving later than this after the original send mark the message
/// as delayed.
pub const DELAY_THRESHOLD_MS: u64 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Author {
    Local,
    /// Remote party, identified by relay id in mesh rooms.
    Remote(Option<String>),
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    Received,
    Delayed,
}

impl DeliveryState {
    pub fn classify(ack: &Ack) -> Self {
        if ack.round_trip_ms() > DELAY_THRESHOLD_MS {
            DeliveryState::Delayed
        } else {
            DeliveryState::Received
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEntry {
    pub author: Author,
    pub timestamp: u64,
    pub text: Option<String>,
    pub file: Option<FileMetadata>,
    pub saved_to: Option<PathBuf>,
    pub delivery: DeliveryState,
}

impl ChatEntry {
    fn new(author: Author, timestamp: u64) -> Self {
        Self {
            author,
            timestamp,
            text: None,
            file: None,
            saved_to: None,
            delivery: DeliveryState::Pending,
        }
    }
}

/// The visible conversation. Not persisted.
#[derive(Debug, Default)]
pub struct ChatLog {
    entries: Vec<ChatEntry>,
}

impl ChatLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[ChatEntry] {
        &self.entries
    }

    pub fn append_text(&mut self, author: Author, text: impl Into<String>, timestamp: u64) {
        let mut entry = ChatEntry::new(author, timestamp);
        entry.text = Some(text.into());
        self.entries.push(entry);
    }

    pub fn append_file(
        &mut self,
        author: Author,
        metadata: FileMetadata,
        saved_to: Option<PathBuf>,
    ) {
        let mut entry = ChatEntry::new(author, metadata.timestamp);
        entry.file = Some(metadata);
        entry.saved_to = saved_to;
        self.entries.push(entry);
    }

    /// Applies an ack to the local entry it refers to. The first ack for an
    /// entry wins; unknown ids are ignored.
    pub fn mark_delivered(&mut self, ack: &Ack) -> Option<DeliveryState> {
        let entry = self.entries.iter_mut().find(|e| {
            e.author == Author::Local
                && e.timestamp == ack.id
                && e.delivery == DeliveryState::Pending
        })?;
        entry.delivery = DeliveryState::classify(ack);
        Some(entry.delivery)
    }

    /// Text entries as completion history.
    pub fn chat_history(&self) -> Vec<ChatTurn> {
        self.entries
            .iter()
            .filter_map(|entry| {
                let content = entry.text.clone()?;
                let role = match entry.author {
                    Author::Assistant => "assistant",
                    _ => "user",
                };
                Some(ChatTurn {
                    role: role.to_string(),
                    content,
                })
            })
            .collect()
    }
}
