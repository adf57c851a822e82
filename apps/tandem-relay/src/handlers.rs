use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use tandem_proto::{RoomId, RoomKind};

use crate::rooms::RoomRegistry;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthStatus {
    pub status: String,
    pub rooms: usize,
    pub members: usize,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomStatus {
    pub room: String,
    pub kind: RoomKind,
    pub members: usize,
}

/// GET /health
pub async fn health_check(State(registry): State<RoomRegistry>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok".to_string(),
        rooms: registry.room_count(),
        members: registry.total_members(),
    })
}

/// GET /rooms/{room}. Any well-formed token answers, empty rooms report zero
/// members.
pub async fn room_status(
    State(registry): State<RoomRegistry>,
    Path(room): Path<String>,
) -> Result<Json<RoomStatus>, StatusCode> {
    let room = RoomId::parse(&room).map_err(|_| StatusCode::NOT_FOUND)?;
    Ok(Json(RoomStatus {
        members: registry.member_count(&room),
        kind: room.kind(),
        room: room.to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[test_timeout::timeout]
    async fn room_status_reports_membership() {
        let registry = RoomRegistry::new(Duration::from_secs(600));
        let room = RoomId::parse("abcd-efgh-ijkl").unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.join(&room, tx);

        let Json(status) = room_status(State(registry.clone()), Path("abcd-efgh-ijkl".into()))
            .await
            .unwrap();
        assert_eq!(status.kind, RoomKind::Mesh);
        assert_eq!(status.members, 1);

        let Json(health) = health_check(State(registry.clone())).await;
        assert_eq!(health.rooms, 1);
        assert_eq!(health.members, 1);

        let missing = room_status(State(registry), Path("nope".into())).await;
        assert_eq!(missing.unwrap_err(), StatusCode::NOT_FOUND);
    }
}
