use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::colab::reconciler::{classify_local_change, FilterReason, LocalChange};
use crate::models::{ChangeMessage, LoadMessage, ReceivedMessage, SendMessage};

/// Outbound half of the message channel to the host page / editor surface.
/// Carries serialized JSON frames.
pub type EditorSink = UnboundedSender<String>;

/// Translates between document content and the editor's message protocol.
pub struct EditorBridge {
    sink: EditorSink,
    ready: bool,
}

impl EditorBridge {
    pub fn new(sink: EditorSink) -> Self {
        Self { sink, ready: false }
    }

    /// Parse one inbound frame. Malformed frames are logged and dropped.
    pub fn parse_message(raw: &str) -> Option<ReceivedMessage> {
        match serde_json::from_str::<ReceivedMessage>(raw) {
            Ok(msg) => Some(msg),
            Err(e) => {
                warn!("Dropping malformed editor message: {}", e);
                None
            }
        }
    }

    /// Editor signalled readiness. The latest known content is delivered
    /// once; repeated ready signals are ignored.
    pub fn ready(&mut self, latest: Option<&Value>) -> bool {
        if self.ready {
            debug!("Editor already ready, ignoring repeated ready signal");
            return false;
        }
        self.ready = true;
        info!("Editor ready");
        match latest {
            Some(content) => self.send_load(content),
            None => false,
        }
    }

    /// Deliver content to the editor. No-op until the editor is ready.
    pub fn push(&self, content: &Value) -> bool {
        if !self.ready {
            debug!("Editor not ready, holding content until ready");
            return false;
        }
        self.send_load(content)
    }

    fn send_load(&self, content: &Value) -> bool {
        self.send(&SendMessage::Load(LoadMessage { data: content.clone() }))
    }

    /// Serialize and send any outbound message. Never waits on the editor.
    pub fn send(&self, msg: &SendMessage) -> bool {
        let text = match serde_json::to_string(msg) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to serialize outbound message: {}", e);
                return false;
            }
        };
        if self.sink.send(text).is_err() {
            debug!("Editor channel closed, dropping outbound message");
            return false;
        }
        true
    }

    /// Classify an editor change. Only [`LocalChange::Publish`] should reach
    /// the shared record.
    pub fn on_editor_change(&self, change: &ChangeMessage) -> LocalChange {
        let classified = classify_local_change(change);
        match &classified {
            LocalChange::Publish(_) => {}
            LocalChange::Empty => warn!("Rejected editor change without payload"),
            LocalChange::Filtered(FilterReason::SelectionOnly) => {
                debug!("Filtered selection-only editor change")
            }
            LocalChange::Filtered(FilterReason::NotRecorded) => {
                debug!("Filtered editor change marked as not recorded")
            }
            LocalChange::Malformed(e) => warn!("Dropping malformed editor payload: {}", e),
        }
        classified
    }
}
