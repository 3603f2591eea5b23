//! Content reconciliation between the editor and the shared document record.
//!
//! Local edits are published immediately, stamped with the local participant
//! and a timestamp. Observed changes are compared by value against the last
//! content handed to the editor; changed values are applied after a short
//! delay, where a newer observation cancels and replaces the pending apply.
//! The apply re-reads the record when it fires, so a burst collapses into a
//! single apply of whatever the store holds at that moment.
//!
//! Observations are not filtered by origin. A client sees its own writes
//! come back and skips them because the value equals `last_applied`.

use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::colab::participant::ParticipantId;
use crate::colab::session::SessionEvent;
use crate::models::{ChangeMessage, ContentRecord, CONTENT_KEY, ORIGIN_KEY, TIMESTAMP_KEY};
use crate::relay::SharedMapping;

/// Editor `element` values that only describe a selection or caret move.
const SELECTION_ELEMENTS: &[&str] = &["selection", "cursor"];

#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("content payload is not a serialized string")]
    NotSerialized,
    #[error("failed to deserialize content payload: {0}")]
    Deserialize(#[from] serde_json::Error),
}

/// Why a local change is kept out of the shared record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterReason {
    SelectionOnly,
    NotRecorded,
}

/// Classification of a change notification coming from the editor.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalChange {
    Publish(Value),
    Filtered(FilterReason),
    Empty,
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Published { timestamp: i64 },
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserveOutcome {
    /// No usable content in the record (missing or malformed).
    Absent,
    /// Content equals what was last applied.
    Unchanged,
    Scheduled { generation: u64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Applied(Value),
    Unchanged,
    Absent,
    /// Timer was superseded by a newer schedule or cancelled.
    Stale,
}

/// Decode the stored content field into a structured value.
pub fn decode_content(raw: &Value) -> Result<Value, PayloadError> {
    match raw {
        Value::String(serialized) => Ok(serde_json::from_str(serialized)?),
        _ => Err(PayloadError::NotSerialized),
    }
}

/// Assemble a [`ContentRecord`] from the entries of the document mapping.
pub fn read_record(entries: &HashMap<String, Value>) -> Result<Option<ContentRecord>, PayloadError> {
    let Some(raw) = entries.get(CONTENT_KEY) else {
        return Ok(None);
    };
    let data = decode_content(raw)?;
    let timestamp = entries.get(TIMESTAMP_KEY).and_then(Value::as_i64).unwrap_or_default();
    let origin = entries
        .get(ORIGIN_KEY)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Ok(Some(ContentRecord { data, timestamp, origin }))
}

/// Apply the local guards to an editor change, in order: empty payloads are
/// rejected, selection-only and non-recorded edits are filtered, and what
/// remains must deserialize.
pub fn classify_local_change(change: &ChangeMessage) -> LocalChange {
    let payload = match change.data.as_deref().map(str::trim) {
        Some(data) if !data.is_empty() => data,
        _ => return LocalChange::Empty,
    };

    if let Some(event) = &change.event {
        if event
            .element
            .as_deref()
            .is_some_and(|element| SELECTION_ELEMENTS.contains(&element))
        {
            return LocalChange::Filtered(FilterReason::SelectionOnly);
        }
        if event.record_undo == Some(false) {
            return LocalChange::Filtered(FilterReason::NotRecorded);
        }
    }

    match serde_json::from_str(payload) {
        Ok(value) => LocalChange::Publish(value),
        Err(e) => LocalChange::Malformed(e.to_string()),
    }
}

struct PendingApply {
    generation: u64,
    handle: JoinHandle<()>,
}

pub struct ContentReconciler {
    participant: ParticipantId,
    mapping: Arc<dyn SharedMapping>,
    apply_delay: Duration,
    events: UnboundedSender<SessionEvent>,
    last_applied: Option<Value>,
    last_timestamp: i64,
    pending: Option<PendingApply>,
    next_generation: u64,
}

impl ContentReconciler {
    pub fn new(
        participant: ParticipantId,
        mapping: Arc<dyn SharedMapping>,
        apply_delay: Duration,
        events: UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            participant,
            mapping,
            apply_delay,
            events,
            last_applied: None,
            last_timestamp: 0,
            pending: None,
            next_generation: 0,
        }
    }

    pub fn last_applied(&self) -> Option<&Value> {
        self.last_applied.as_ref()
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Write a local edit to the shared record.
    pub fn publish_local(&mut self, data: Value) -> PublishOutcome {
        let serialized = match serde_json::to_string(&data) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to serialize local content for {}: {}", self.participant, e);
                return PublishOutcome::Failed;
            }
        };
        let timestamp = Utc::now().timestamp_millis().max(self.last_timestamp);
        // Once written, a timestamp must never be undercut, even if the
        // remaining writes fail.
        self.last_timestamp = timestamp;

        // Content goes last: observers react to the content key and expect
        // timestamp and origin to be current by then.
        let writes = [
            (TIMESTAMP_KEY, Value::from(timestamp)),
            (ORIGIN_KEY, Value::from(self.participant.as_str())),
            (CONTENT_KEY, Value::String(serialized)),
        ];
        for (index, (key, value)) in writes.into_iter().enumerate() {
            if let Err(e) = self.mapping.set(key, value) {
                if index == 0 {
                    warn!("Failed to publish '{}' for {}: {}", key, self.participant, e);
                } else {
                    error!(
                        "Partial publish for {}: '{}' failed after metadata was written: {}",
                        self.participant, key, e
                    );
                }
                return PublishOutcome::Failed;
            }
        }

        debug!("Published local content from {} at {}", self.participant, timestamp);
        // The editor already shows this value; seeing it come back is a no-op.
        self.last_applied = Some(data);
        PublishOutcome::Published { timestamp }
    }

    /// Read the current content, treating malformed payloads as absent.
    fn current_content(&self) -> Option<Value> {
        let raw = self.mapping.get(CONTENT_KEY)?;
        match decode_content(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Dropping malformed shared content for {}: {}", self.participant, e);
                None
            }
        }
    }

    /// React to a change of the shared content field.
    pub fn on_content_observed(&mut self) -> ObserveOutcome {
        let Some(observed) = self.current_content() else {
            return ObserveOutcome::Absent;
        };
        let origin = self.mapping.get(ORIGIN_KEY);
        if self.last_applied.as_ref() == Some(&observed) {
            debug!("Observed content from {:?} matches last applied, skipping", origin);
            return ObserveOutcome::Unchanged;
        }
        debug!("Observed new content from {:?}, scheduling apply", origin);
        ObserveOutcome::Scheduled {
            generation: self.schedule(),
        }
    }

    fn schedule(&mut self) -> u64 {
        self.cancel_pending();
        self.next_generation += 1;
        let generation = self.next_generation;
        let delay = self.apply_delay;
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(SessionEvent::ApplyDue(generation));
        });
        self.pending = Some(PendingApply { generation, handle });
        generation
    }

    pub fn cancel_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.handle.abort();
        }
    }

    /// Deferred apply fired. Only the most recent schedule is honoured.
    pub fn on_apply_due(&mut self, generation: u64) -> ApplyOutcome {
        match &self.pending {
            Some(pending) if pending.generation == generation => {
                self.pending = None;
            }
            _ => return ApplyOutcome::Stale,
        }
        self.apply_current()
    }

    /// Sync on (re)connect: apply what the store holds without waiting.
    pub fn initial_sync(&mut self) -> ApplyOutcome {
        self.cancel_pending();
        let outcome = self.apply_current();
        if outcome == ApplyOutcome::Absent {
            info!("No shared content yet for {}", self.participant);
        }
        outcome
    }

    fn apply_current(&mut self) -> ApplyOutcome {
        let Some(current) = self.current_content() else {
            return ApplyOutcome::Absent;
        };
        if self.last_applied.as_ref() == Some(&current) {
            return ApplyOutcome::Unchanged;
        }
        self.last_applied = Some(current.clone());
        ApplyOutcome::Applied(current)
    }

    /// Drop all reconciliation state.
    pub fn reset(&mut self) {
        self.cancel_pending();
        self.last_applied = None;
    }
}

impl Drop for ContentReconciler {
    fn drop(&mut self) {
        self.cancel_pending();
    }
}
