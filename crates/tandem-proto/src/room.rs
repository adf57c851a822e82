use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const PAIR_DIGITS: usize = 7;
const MESH_SEGMENTS: usize = 3;
const MESH_SEGMENT_LEN: usize = 4;

/// Room flavour, decided purely by the shape of the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomKind {
    /// Two-party room, 7-digit numeric token. Signals are broadcast to the
    /// other member.
    Pair,
    /// Multi-party room, `xxxx-xxxx-xxxx` lowercase token. Signals are routed
    /// to an explicit recipient.
    Mesh,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoomIdError {
    #[error("room id is empty")]
    Empty,
    #[error("room id {0:?} is neither a 7-digit code nor three 4-letter segments")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomId {
    token: String,
    kind: RoomKind,
}

impl RoomId {
    pub fn parse(raw: &str) -> Result<Self, RoomIdError> {
        if raw.is_empty() {
            return Err(RoomIdError::Empty);
        }
        let kind = if is_pair_token(raw) {
            RoomKind::Pair
        } else if is_mesh_token(raw) {
            RoomKind::Mesh
        } else {
            return Err(RoomIdError::Malformed(raw.to_string()));
        };
        Ok(Self {
            token: raw.to_string(),
            kind,
        })
    }

    pub fn generate<R: Rng + ?Sized>(kind: RoomKind, rng: &mut R) -> Self {
        let token = match kind {
            RoomKind::Pair => (0..PAIR_DIGITS)
                .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
                .collect(),
            RoomKind::Mesh => (0..MESH_SEGMENTS)
                .map(|_| {
                    (0..MESH_SEGMENT_LEN)
                        .map(|_| char::from(b'a' + rng.gen_range(0..26u8)))
                        .collect::<String>()
                })
                .collect::<Vec<_>>()
                .join("-"),
        };
        Self { token, kind }
    }

    pub fn kind(&self) -> RoomKind {
        self.kind
    }

    pub fn as_str(&self) -> &str {
        &self.token
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.token)
    }
}

impl FromStr for RoomId {
    type Err = RoomIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RoomId {
    type Error = RoomIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RoomId> for String {
    fn from(value: RoomId) -> Self {
        value.token
    }
}

/// Outcome of deriving a room from a location fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomResolution {
    pub room: RoomId,
    /// True when the fragment was unusable and a fresh token was generated;
    /// callers should write `room` back to the fragment.
    pub generated: bool,
}

/// Uses the fragment when it already holds a token of the wanted kind,
/// otherwise generates a new one.
pub fn resolve_fragment<R: Rng + ?Sized>(
    fragment: &str,
    kind: RoomKind,
    rng: &mut R,
) -> RoomResolution {
    let candidate = fragment.trim_start_matches('#');
    match RoomId::parse(candidate) {
        Ok(room) if room.kind() == kind => RoomResolution {
            room,
            generated: false,
        },
        _ => RoomResolution {
            room: RoomId::generate(kind, rng),
            generated: true,
        },
    }
}

fn is_pair_token(raw: &str) -> bool {
    raw.len() == PAIR_DIGITS && raw.bytes().all(|b| b.is_ascii_digit())
}

fn is_mesh_token(raw: &str) -> bool {
    let segments: Vec<&str> = raw.split('-').collect();
    segments.len() == MESH_SEGMENTS
        && segments
            .iter()
            .all(|s| s.len() == MESH_SEGMENT_LEN && s.bytes().all(|b| b.is_ascii_lowercase()))
}
