use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::models::{ConnectionStatus, PresenceEntry};

/// Metadata attached by the editor surface to a change notification.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    /// What the change touched, e.g. "selection" or "cursor" for pure
    /// selection moves.
    #[serde(default)]
    pub element: Option<String>,
    /// `false` when the editor asks for the change not to be kept as a
    /// persistent edit.
    #[serde(default)]
    pub record_undo: Option<bool>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChangeMessage {
    /// Serialized document payload as produced by the editor.
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub event: Option<ChangeEvent>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PointerMoveMessage {
    pub x: f64,
    pub y: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LoadMessage {
    pub data: Value,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WelcomeMessage {
    pub participant_id: String,
    pub color: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PresenceMessage {
    pub participants: HashMap<String, PresenceEntry>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StatusMessage {
    pub status: ConnectionStatus,
}

/// Messages received from the host page and the embedded editor.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ReceivedMessage {
    #[serde(rename = "ready")]
    Ready,
    #[serde(rename = "change")]
    Change(ChangeMessage),
    #[serde(rename = "pointer-move")]
    PointerMove(PointerMoveMessage),
    #[serde(rename = "pointer-leave")]
    PointerLeave,
}

/// Messages sent to the host page and the embedded editor.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum SendMessage {
    #[serde(rename = "load")]
    Load(LoadMessage),
    #[serde(rename = "welcome")]
    Welcome(WelcomeMessage),
    #[serde(rename = "presence")]
    Presence(PresenceMessage),
    #[serde(rename = "status")]
    Status(StatusMessage),
}
