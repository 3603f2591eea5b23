use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::colab::participant::ParticipantId;
use crate::models::{PointerPosition, PresenceEntry};
use crate::relay::SharedMapping;

/// Mirrors the local pointer into the shared presence mapping and keeps a
/// local view of every participant's pointer.
pub struct PresenceSynchronizer {
    participant: ParticipantId,
    color: String,
    mapping: Option<Arc<dyn SharedMapping>>,
    connected: bool,
    view: HashMap<ParticipantId, PresenceEntry>,
}

impl PresenceSynchronizer {
    pub fn new(participant: ParticipantId, mapping: Arc<dyn SharedMapping>) -> Self {
        let color = participant.color();
        Self {
            participant,
            color,
            mapping: Some(mapping),
            connected: false,
            view: HashMap::new(),
        }
    }

    pub fn color(&self) -> &str {
        &self.color
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    fn writable(&self) -> Option<&Arc<dyn SharedMapping>> {
        if self.connected {
            self.mapping.as_ref()
        } else {
            None
        }
    }

    /// Publish the local pointer. Returns whether a write was issued.
    pub fn on_pointer_move(&self, position: PointerPosition) -> bool {
        let Some(mapping) = self.writable() else {
            return false;
        };
        let entry = PresenceEntry::new(position, &self.color);
        let value = match serde_json::to_value(&entry) {
            Ok(value) => value,
            Err(e) => {
                error!("Failed to serialize presence for {}: {}", self.participant, e);
                return false;
            }
        };
        if let Err(e) = mapping.set(self.participant.as_str(), value) {
            warn!("Failed to publish presence for {}: {}", self.participant, e);
            return false;
        }
        true
    }

    /// Remove the local pointer. Returns whether a delete was issued.
    pub fn on_pointer_leave(&self) -> bool {
        let Some(mapping) = self.writable() else {
            return false;
        };
        if let Err(e) = mapping.delete(self.participant.as_str()) {
            warn!("Failed to remove presence for {}: {}", self.participant, e);
            return false;
        }
        true
    }

    /// Rebuild the local view from a full snapshot of the presence mapping.
    pub fn on_remote_change(&mut self) -> &HashMap<ParticipantId, PresenceEntry> {
        let Some(mapping) = self.mapping.as_ref() else {
            return &self.view;
        };
        self.view = mapping
            .entries()
            .into_iter()
            .filter_map(|(id, value)| match serde_json::from_value::<PresenceEntry>(value) {
                Ok(entry) => Some((ParticipantId::from(id.as_str()), entry)),
                Err(e) => {
                    warn!("Ignoring malformed presence entry for {}: {}", id, e);
                    None
                }
            })
            .collect();
        debug!("Presence view rebuilt with {} participants", self.view.len());
        &self.view
    }

    /// Best-effort removal of the local entry, then drop the mapping handle.
    pub fn release(&mut self) {
        self.on_pointer_leave();
        self.mapping = None;
        self.connected = false;
        self.view.clear();
    }
}
