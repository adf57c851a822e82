use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use tandem_proto::{RelayFrame, RoomId, RoomKind};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// What the per-connection writer task receives.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Frame(RelayFrame),
    /// Close the socket; used when a member is evicted.
    Close,
}

pub type MemberTx = mpsc::UnboundedSender<Outbound>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("room {0} has no members")]
    RoomGone(String),
    #[error("multi-party signal without a recipient")]
    MissingRecipient,
    #[error("recipient {0} is not in this room")]
    UnknownRecipient(String),
}

struct Member {
    tx: MemberTx,
    last_seen: Instant,
}

/// Current membership of every live room. Nothing survives the process.
#[derive(Clone)]
pub struct RoomRegistry {
    /// room token -> (member id -> member)
    rooms: Arc<DashMap<String, DashMap<String, Member>>>,
    heartbeat_timeout: Duration,
}

impl RoomRegistry {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            rooms: Arc::new(DashMap::new()),
            heartbeat_timeout,
        }
    }

    /// Registers a new member and returns its id. The joiner is told who was
    /// already present before anyone can route a signal to it; existing
    /// members are told about the joiner afterwards.
    pub fn join(&self, room: &RoomId, tx: MemberTx) -> String {
        let member_id = new_member_id();
        let members = self.rooms.entry(room.as_str().to_string()).or_default();

        let peers: Vec<String> = members.iter().map(|entry| entry.key().clone()).collect();
        let _ = tx.send(Outbound::Frame(RelayFrame::ConnectedPeers {
            assigned_id: member_id.clone(),
            peers: peers.clone(),
        }));

        members.insert(
            member_id.clone(),
            Member {
                tx,
                last_seen: Instant::now(),
            },
        );

        for entry in members.iter() {
            if entry.key() != &member_id {
                let _ = entry.tx.send(Outbound::Frame(RelayFrame::ConnectedPeer {
                    peer_id: member_id.clone(),
                }));
            }
        }

        info!(
            target: "tandem_relay::rooms",
            room = %room,
            member = %member_id,
            existing = peers.len(),
            "member joined"
        );
        member_id
    }

    /// Removes a member and announces it to whoever remains. Returns false
    /// when the member was already gone.
    pub fn leave(&self, room: &RoomId, member_id: &str) -> bool {
        let mut removed = false;
        let mut now_empty = false;

        if let Some(members) = self.rooms.get(room.as_str()) {
            removed = members.remove(member_id).is_some();
            if removed {
                for entry in members.iter() {
                    let _ = entry.tx.send(Outbound::Frame(RelayFrame::DisconnectedPeer {
                        peer_id: member_id.to_string(),
                    }));
                }
            }
            now_empty = members.is_empty();
        }

        if now_empty {
            self.rooms
                .remove_if(room.as_str(), |_, members| members.is_empty());
        }

        if removed {
            info!(target: "tandem_relay::rooms", room = %room, member = %member_id, "member left");
        }
        removed
    }

    pub fn touch(&self, room: &RoomId, member_id: &str) {
        if let Some(members) = self.rooms.get(room.as_str()) {
            if let Some(mut member) = members.get_mut(member_id) {
                member.last_seen = Instant::now();
            }
        }
    }

    /// Forwards an opaque signaling payload. Two-party rooms broadcast to the
    /// other members; multi-party rooms deliver to `recipient` only. Returns
    /// the number of members the frame was handed to.
    pub fn relay_signal(
        &self,
        room: &RoomId,
        sender: &str,
        recipient: Option<&str>,
        payload: Value,
    ) -> Result<usize, RelayError> {
        let members = self
            .rooms
            .get(room.as_str())
            .ok_or_else(|| RelayError::RoomGone(room.to_string()))?;

        let frame = RelayFrame::Signal {
            sender: Some(sender.to_string()),
            payload,
        };

        match room.kind() {
            RoomKind::Pair => {
                let mut delivered = 0;
                for entry in members.iter().filter(|entry| entry.key() != sender) {
                    if entry.tx.send(Outbound::Frame(frame.clone())).is_ok() {
                        delivered += 1;
                    }
                }
                debug!(target: "tandem_relay::rooms", room = %room, sender, delivered, "broadcast signal");
                Ok(delivered)
            }
            RoomKind::Mesh => {
                let recipient = recipient.ok_or(RelayError::MissingRecipient)?;
                let target = members
                    .get(recipient)
                    .filter(|_| recipient != sender)
                    .ok_or_else(|| RelayError::UnknownRecipient(recipient.to_string()))?;
                let delivered = usize::from(target.tx.send(Outbound::Frame(frame)).is_ok());
                debug!(target: "tandem_relay::rooms", room = %room, sender, recipient, "routed signal");
                Ok(delivered)
            }
        }
    }

    pub fn member_count(&self, room: &RoomId) -> usize {
        self.rooms
            .get(room.as_str())
            .map(|members| members.len())
            .unwrap_or(0)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn total_members(&self) -> usize {
        self.rooms.iter().map(|room| room.value().len()).sum()
    }

    /// Evicts every member whose last frame is older than the heartbeat
    /// timeout at `now`. Returns `(room, member)` pairs that were removed.
    pub fn evict_stale(&self, now: Instant) -> Vec<(String, String)> {
        // Collect first so no guard is held while `leave` takes its own.
        let mut stale = Vec::new();
        for room in self.rooms.iter() {
            for member in room.value().iter() {
                if now.saturating_duration_since(member.last_seen) > self.heartbeat_timeout {
                    stale.push((room.key().clone(), member.key().clone(), member.tx.clone()));
                }
            }
        }

        let mut evicted = Vec::with_capacity(stale.len());
        for (token, member_id, tx) in stale {
            let Ok(room) = RoomId::parse(&token) else {
                continue;
            };
            info!(
                target: "tandem_relay::rooms",
                room = %room,
                member = %member_id,
                "evicting member after heartbeat timeout"
            );
            let _ = tx.send(Outbound::Close);
            if self.leave(&room, &member_id) {
                evicted.push((token, member_id));
            }
        }
        evicted
    }

    pub async fn run_heartbeat_monitor(self) {
        let period = (self.heartbeat_timeout / 4).clamp(Duration::from_secs(1), Duration::from_secs(60));
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let evicted = self.evict_stale(Instant::now());
            if !evicted.is_empty() {
                debug!(target: "tandem_relay::rooms", count = evicted.len(), "heartbeat sweep");
            }
        }
    }
}

fn new_member_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn member() -> (MemberTx, mpsc::UnboundedReceiver<Outbound>) {
        mpsc::unbounded_channel()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            out.push(item);
        }
        out
    }

    #[test_timeout::timeout]
    fn join_announces_both_directions() {
        let registry = RoomRegistry::new(Duration::from_secs(600));
        let room = RoomId::parse("1234567").unwrap();

        let (a_tx, mut a_rx) = member();
        let a = registry.join(&room, a_tx);
        assert_eq!(
            drain(&mut a_rx),
            vec![Outbound::Frame(RelayFrame::ConnectedPeers {
                assigned_id: a.clone(),
                peers: vec![],
            })]
        );

        let (b_tx, mut b_rx) = member();
        let b = registry.join(&room, b_tx);
        assert_eq!(
            drain(&mut b_rx),
            vec![Outbound::Frame(RelayFrame::ConnectedPeers {
                assigned_id: b.clone(),
                peers: vec![a.clone()],
            })]
        );
        assert_eq!(
            drain(&mut a_rx),
            vec![Outbound::Frame(RelayFrame::ConnectedPeer { peer_id: b })]
        );
        assert_eq!(registry.member_count(&room), 2);
    }

    #[test_timeout::timeout]
    fn pair_room_broadcasts_to_others_only() {
        let registry = RoomRegistry::new(Duration::from_secs(600));
        let room = RoomId::parse("7654321").unwrap();
        let (a_tx, mut a_rx) = member();
        let (b_tx, mut b_rx) = member();
        let a = registry.join(&room, a_tx);
        let _b = registry.join(&room, b_tx);
        drain(&mut a_rx);
        drain(&mut b_rx);

        let delivered = registry
            .relay_signal(&room, &a, Some("ignored"), json!({"x": 1}))
            .unwrap();
        assert_eq!(delivered, 1);
        assert!(drain(&mut a_rx).is_empty());
        assert_eq!(
            drain(&mut b_rx),
            vec![Outbound::Frame(RelayFrame::Signal {
                sender: Some(a),
                payload: json!({"x": 1}),
            })]
        );
    }

    #[test_timeout::timeout]
    fn mesh_room_routes_by_recipient() {
        let registry = RoomRegistry::new(Duration::from_secs(600));
        let room = RoomId::parse("abcd-efgh-ijkl").unwrap();
        let (a_tx, mut a_rx) = member();
        let (b_tx, mut b_rx) = member();
        let (c_tx, mut c_rx) = member();
        let a = registry.join(&room, a_tx);
        let b = registry.join(&room, b_tx);
        let _c = registry.join(&room, c_tx);
        drain(&mut a_rx);
        drain(&mut b_rx);
        drain(&mut c_rx);

        registry
            .relay_signal(&room, &a, Some(&b), json!("offer"))
            .unwrap();
        assert_eq!(drain(&mut b_rx).len(), 1);
        assert!(drain(&mut c_rx).is_empty());

        assert_eq!(
            registry.relay_signal(&room, &a, None, json!("x")),
            Err(RelayError::MissingRecipient)
        );
        assert_eq!(
            registry.relay_signal(&room, &a, Some("nobody"), json!("x")),
            Err(RelayError::UnknownRecipient("nobody".into()))
        );
    }

    #[test_timeout::timeout]
    fn leave_announces_and_drops_empty_rooms() {
        let registry = RoomRegistry::new(Duration::from_secs(600));
        let room = RoomId::parse("1111111").unwrap();
        let (a_tx, mut a_rx) = member();
        let (b_tx, _b_rx) = member();
        let a = registry.join(&room, a_tx);
        let b = registry.join(&room, b_tx);
        drain(&mut a_rx);

        assert!(registry.leave(&room, &b));
        assert!(!registry.leave(&room, &b));
        assert_eq!(
            drain(&mut a_rx),
            vec![Outbound::Frame(RelayFrame::DisconnectedPeer { peer_id: b })]
        );

        assert!(registry.leave(&room, &a));
        assert_eq!(registry.room_count(), 0);
    }

    #[test_timeout::timeout]
    fn stale_members_are_evicted_and_announced() {
        let registry = RoomRegistry::new(Duration::from_secs(10));
        let room = RoomId::parse("2222222").unwrap();
        let (a_tx, mut a_rx) = member();
        let (b_tx, mut b_rx) = member();
        registry.join(&room, a_tx);
        registry.join(&room, b_tx);
        drain(&mut a_rx);
        drain(&mut b_rx);

        let later = Instant::now() + Duration::from_secs(11);
        let evicted = registry.evict_stale(later);
        assert_eq!(evicted.len(), 2);
        assert!(drain(&mut a_rx).contains(&Outbound::Close));
        assert!(drain(&mut b_rx).contains(&Outbound::Close));
        assert_eq!(registry.member_count(&room), 0);
    }

    #[test_timeout::timeout]
    fn touched_members_survive_sweep() {
        let registry = RoomRegistry::new(Duration::from_secs(10));
        let room = RoomId::parse("3333333").unwrap();
        let (a_tx, _a_rx) = member();
        let a = registry.join(&room, a_tx);
        registry.touch(&room, &a);
        assert!(registry.evict_stale(Instant::now()).is_empty());
        assert_eq!(registry.member_count(&room), 1);
    }
}
