use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identity of one connected client, stable for the lifetime of its session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Display color for this participant's pointer. Derived from the id so
    /// every client renders the same participant in the same color.
    pub fn color(&self) -> String {
        let hue = self
            .0
            .bytes()
            .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32))
            % 360;
        format!("hsl({}, 70%, 50%)", hue)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(ParticipantId::generate(), ParticipantId::generate());
    }

    #[test]
    fn test_color_is_stable_per_id() {
        let id = ParticipantId::from("alice");
        assert_eq!(id.color(), ParticipantId::from("alice").color());
        assert!(id.color().starts_with("hsl("));
    }
}
