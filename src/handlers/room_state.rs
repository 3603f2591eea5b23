use crate::{
    colab::reconciler::read_record,
    models::{ErrorResponse, PresenceEntry, RoomStateResponse, CONTENT_MAPPING, PRESENCE_MAPPING},
    AppState,
};
use axum::{extract::{Path, State}, http::StatusCode, Json};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Read-only view of a room's content record and presence
pub async fn room_state(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
) -> Result<(StatusCode, Json<RoomStateResponse>), (StatusCode, Json<ErrorResponse>)> {

    let Some(snapshot) = state.relay.snapshot(&room_id) else {
        info!("Room state requested for unknown room {}", room_id);
        return Err(ErrorResponse::reply(StatusCode::NOT_FOUND, format!("Room '{}' not found", room_id)));
    };

    // A malformed record is reported as no content, like sessions treat it
    let content = match snapshot.mappings.get(CONTENT_MAPPING).map(read_record) {
        Some(Ok(record)) => record,
        Some(Err(e)) => {
            warn!("Room {} holds malformed content: {}", room_id, e);
            None
        }
        None => None,
    };

    let presence: HashMap<String, PresenceEntry> = snapshot
        .mappings
        .get(PRESENCE_MAPPING)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|(id, value)| match serde_json::from_value(value.clone()) {
                    Ok(entry) => Some((id.clone(), entry)),
                    Err(e) => {
                        warn!("Room {} holds malformed presence entry for {}: {}", room_id, id, e);
                        None
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    Ok((StatusCode::OK, Json(RoomStateResponse {
        room_id,
        n_conn: snapshot.n_conn,
        content,
        presence,
    })))
}
