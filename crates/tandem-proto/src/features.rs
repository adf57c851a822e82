use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Binary representation a data channel hands to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryType {
    /// Large opaque blocks, streamed from the source.
    #[serde(rename = "blob")]
    Blob,
    /// Raw byte buffers, fully materialized before slicing.
    #[serde(rename = "arraybuffer")]
    ArrayBuffer,
}

impl Default for BinaryType {
    fn default() -> Self {
        BinaryType::Blob
    }
}

/// Locally enabled capabilities, published over the features channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Features {
    pub audio: bool,
    pub video: bool,
    #[serde(
        default,
        rename = "binaryType",
        skip_serializing_if = "Option::is_none"
    )]
    pub binary_type: Option<BinaryType>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            audio: false,
            video: true,
            binary_type: None,
            extra: Map::new(),
        }
    }
}

impl Features {
    pub fn to_map(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    /// Overwrites the given keys. A known key with a value of the wrong type
    /// is dropped.
    pub fn merge(&mut self, map: Map<String, Value>) {
        for (key, value) in map {
            match key.as_str() {
                "audio" => {
                    if let Value::Bool(on) = value {
                        self.audio = on;
                    }
                }
                "video" => {
                    if let Value::Bool(on) = value {
                        self.video = on;
                    }
                }
                "binaryType" => self.binary_type = serde_json::from_value(value).ok(),
                _ => {
                    self.extra.insert(key, value);
                }
            }
        }
    }

    /// Only the requested keys, for incremental updates.
    pub fn subset(&self, keys: &[&str]) -> Map<String, Value> {
        let mut all = self.to_map();
        keys.iter()
            .filter_map(|key| all.remove(*key).map(|value| (key.to_string(), value)))
            .collect()
    }
}

/// Feature keys with a defined reaction on the receiving side. Anything else
/// is stored but not dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Audio,
    Video,
    BinaryType,
}

impl Capability {
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "audio" => Some(Capability::Audio),
            "video" => Some(Capability::Video),
            "binaryType" => Some(Capability::BinaryType),
            _ => None,
        }
    }

    pub fn key(self) -> &'static str {
        match self {
            Capability::Audio => "audio",
            Capability::Video => "video",
            Capability::BinaryType => "binaryType",
        }
    }
}
