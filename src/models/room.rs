use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use utoipa::ToSchema;

use crate::models::{ContentRecord, PresenceEntry};

/// Read-only view of a room's shared state
#[derive(Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RoomStateResponse {
    pub room_id: String,
    pub n_conn: u32,
    pub content: Option<ContentRecord>,
    pub presence: HashMap<String, PresenceEntry>,
}
