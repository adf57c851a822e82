//! Room-scoped signaling relay: forwards opaque setup messages between the
//! members of a room and announces membership changes.

pub mod cli;
pub mod config;
pub mod handlers;
pub mod rooms;
pub mod websocket;

use std::net::SocketAddr;

use axum::{routing::get, Router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    handlers::{health_check, room_status},
    rooms::RoomRegistry,
    websocket::websocket_handler,
};

pub fn app(registry: RoomRegistry) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/rooms/:room", get(room_status))
        .route("/ws/:room", get(websocket_handler))
        .with_state(registry)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Serves the relay on an already bound listener until the process exits.
pub async fn serve(listener: tokio::net::TcpListener, registry: RoomRegistry) -> std::io::Result<()> {
    axum::serve(
        listener,
        app(registry).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}
