use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Name of the shared mapping holding one entry per participant.
pub const PRESENCE_MAPPING: &str = "presence";

/// Pointer position reported by the host page, in editor coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointerPosition {
    pub x: f64,
    pub y: f64,
}

/// A participant's pointer as stored in the presence mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PresenceEntry {
    pub x: f64,
    pub y: f64,
    pub color: String,
}

impl PresenceEntry {
    pub fn new(position: PointerPosition, color: &str) -> Self {
        Self {
            x: position.x,
            y: position.y,
            color: color.to_string(),
        }
    }
}
