use axum::{extract::State, response::Json};
use serde::Serialize;

use crate::websocket::AppState;

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    status: &'static str,
    connections: usize,
    rooms: usize,
    patterns: usize,
}

/// Liveness probe with this node's local counts. Cluster-wide numbers live
/// in the shared store, not here.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok",
        connections: state.bus.connection_count(),
        rooms: state.bus.room_count(),
        patterns: state.resolver.pattern_count(),
    })
}
