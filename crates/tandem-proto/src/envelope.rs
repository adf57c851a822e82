use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Describes a file carried on its own transfer channel. Sent once, as the
/// first (text) frame of that channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub kind: String,
    pub name: String,
    pub size: u64,
    pub timestamp: u64,
    #[serde(rename = "type")]
    pub mime: String,
}

impl FileMetadata {
    /// Label of the transfer channel: `<kind>-<name>`.
    pub fn channel_label(&self) -> String {
        format!("{}-{}", self.kind, self.name)
    }
}

/// Acknowledgement envelope. `id` is the timestamp of the acknowledged
/// message, `timestamp` the acknowledging side's clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub id: u64,
    pub timestamp: u64,
}

impl Ack {
    pub fn round_trip_ms(&self) -> u64 {
        self.timestamp.saturating_sub(self.id)
    }
}

/// A chat/control channel envelope. Either content or an acknowledgement,
/// never both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawEnvelope", into = "RawEnvelope")]
pub enum Message {
    Text { text: String, timestamp: u64 },
    File { metadata: FileMetadata, timestamp: u64 },
    Ack(Ack),
}

impl Message {
    pub fn timestamp(&self) -> u64 {
        match self {
            Message::Text { timestamp, .. } | Message::File { timestamp, .. } => *timestamp,
            Message::Ack(ack) => ack.timestamp,
        }
    }

    pub fn ack_for(&self, now: u64) -> Option<Ack> {
        match self {
            Message::Ack(_) => None,
            content => Some(Ack {
                id: content.timestamp(),
                timestamp: now,
            }),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("envelope carries both an acknowledgement id and content")]
    AckWithContent,
    #[error("envelope carries neither content nor an acknowledgement id")]
    Empty,
    #[error("envelope carries both text and file metadata")]
    TextAndFile,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RawEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata: Option<FileMetadata>,
}

impl TryFrom<RawEnvelope> for Message {
    type Error = EnvelopeError;

    fn try_from(raw: RawEnvelope) -> Result<Self, Self::Error> {
        match (raw.id, raw.text, raw.metadata) {
            (Some(id), None, None) => Ok(Message::Ack(Ack {
                id,
                timestamp: raw.timestamp,
            })),
            (Some(_), _, _) => Err(EnvelopeError::AckWithContent),
            (None, Some(_), Some(_)) => Err(EnvelopeError::TextAndFile),
            (None, Some(text), None) => Ok(Message::Text {
                text,
                timestamp: raw.timestamp,
            }),
            (None, None, Some(metadata)) => Ok(Message::File {
                metadata,
                timestamp: raw.timestamp,
            }),
            (None, None, None) => Err(EnvelopeError::Empty),
        }
    }
}

impl From<Message> for RawEnvelope {
    fn from(message: Message) -> Self {
        match message {
            Message::Text { text, timestamp } => RawEnvelope {
                text: Some(text),
                timestamp,
                ..Default::default()
            },
            Message::File {
                metadata,
                timestamp,
            } => RawEnvelope {
                metadata: Some(metadata),
                timestamp,
                ..Default::default()
            },
            Message::Ack(ack) => RawEnvelope {
                id: Some(ack.id),
                timestamp: ack.timestamp,
                ..Default::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test_timeout::timeout]
    fn text_and_ack_wire_shapes() {
        let text = Message::Text {
            text: "hi".into(),
            timestamp: 1_700_000_000_000,
        };
        assert_eq!(
            serde_json::to_value(&text).unwrap(),
            json!({ "text": "hi", "timestamp": 1_700_000_000_000u64 })
        );

        let ack = text.ack_for(1_700_000_000_250).unwrap();
        assert_eq!(
            serde_json::to_value(Message::Ack(ack)).unwrap(),
            json!({ "id": 1_700_000_000_000u64, "timestamp": 1_700_000_000_250u64 })
        );
        assert_eq!(ack.round_trip_ms(), 250);
    }

    #[test_timeout::timeout]
    fn acks_are_never_acknowledged() {
        let ack = Message::Ack(Ack { id: 1, timestamp: 2 });
        assert!(ack.ack_for(3).is_none());
    }

    #[test_timeout::timeout]
    fn rejects_mixed_envelopes() {
        let mixed = json!({ "text": "hi", "timestamp": 5, "id": 4 });
        assert!(serde_json::from_value::<Message>(mixed).is_err());

        let empty = json!({ "timestamp": 5 });
        assert!(serde_json::from_value::<Message>(empty).is_err());
    }

    #[test_timeout::timeout]
    fn metadata_uses_browser_field_names() {
        let metadata = FileMetadata {
            kind: "image".into(),
            name: "cat.png".into(),
            size: 42,
            timestamp: 9,
            mime: "image/png".into(),
        };
        let value = serde_json::to_value(&metadata).unwrap();
        assert_eq!(value["type"], "image/png");
        assert_eq!(metadata.channel_label(), "image-cat.png");
    }
}
