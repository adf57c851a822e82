//! Wire types shared by the tandem relay and the tandem client.
//! Kept in a dedicated crate so the relay does not pull in the WebRTC stack.

pub mod envelope;
pub mod features;
pub mod relay;
pub mod room;
pub mod signal;

pub use envelope::{Ack, EnvelopeError, FileMetadata, Message};
pub use features::{BinaryType, Capability, Features};
pub use relay::{ClientFrame, RelayFrame};
pub use room::{RoomId, RoomIdError, RoomKind, RoomResolution};
pub use signal::{IceCandidate, SdpKind, SessionDescription, Signal};
