use crate::{models::DiagnosticsResponse, AppState};
use axum::{extract::State, http::StatusCode, Json};
use std::sync::Arc;
use tracing::info;

/// Room and connection counters of the relay
pub async fn diagnostics(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<DiagnosticsResponse>) {

    let stats = state.relay.stats();
    let apply_delay_ms = state.session_options.apply_delay.as_millis() as u64;

    info!(
        "Diagnostics: Conn: {}, Rooms: {}, Retained: {}",
        stats.n_conn,
        stats.n_rooms,
        stats.n_retained_rooms
    );

    (
        StatusCode::OK,
        Json(DiagnosticsResponse {
            n_conn: stats.n_conn,
            n_rooms: stats.n_rooms,
            n_retained_rooms: stats.n_retained_rooms,
            apply_delay_ms,
        }),
    )
}
