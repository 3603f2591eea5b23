use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::colab::bridge::{EditorBridge, EditorSink};
use crate::colab::participant::ParticipantId;
use crate::colab::presence::PresenceSynchronizer;
use crate::colab::reconciler::{ApplyOutcome, ContentReconciler, LocalChange, ObserveOutcome};
use crate::models::{
    ConnectionStatus, PointerPosition, PresenceMessage, ReceivedMessage, SendMessage, StatusMessage,
    WelcomeMessage, CONTENT_KEY, CONTENT_MAPPING, PRESENCE_MAPPING,
};
use crate::relay::{Connector, SharedStateClient};

/// Everything a session reacts to. All of it is handled, one event at a
/// time, by the session's own task.
#[derive(Debug)]
pub enum SessionEvent {
    /// Raw frame from the host page or the editor surface.
    Inbound(String),
    PresenceChanged,
    ContentChanged,
    Status(ConnectionStatus),
    /// Deferred apply timer fired for the given generation.
    ApplyDue(u64),
    Stop,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub apply_delay: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            apply_delay: Duration::from_millis(50),
        }
    }
}

struct SessionCore {
    room_id: String,
    participant: ParticipantId,
    client: Arc<dyn SharedStateClient>,
    status: ConnectionStatus,
    presence: PresenceSynchronizer,
    reconciler: ContentReconciler,
    bridge: EditorBridge,
}

impl SessionCore {
    fn handle(&mut self, event: SessionEvent) -> ControlFlow<()> {
        match event {
            SessionEvent::Inbound(raw) => {
                if let Some(msg) = EditorBridge::parse_message(&raw) {
                    self.on_message(msg);
                }
            }
            SessionEvent::PresenceChanged => self.publish_presence_view(),
            SessionEvent::ContentChanged => {
                if let ObserveOutcome::Scheduled { generation } = self.reconciler.on_content_observed() {
                    debug!("Room {}: apply {} scheduled for {}", self.room_id, generation, self.participant);
                }
            }
            SessionEvent::Status(status) => self.on_status(status),
            SessionEvent::ApplyDue(generation) => {
                let outcome = self.reconciler.on_apply_due(generation);
                self.deliver(outcome);
            }
            SessionEvent::Stop => {
                self.teardown();
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn on_message(&mut self, msg: ReceivedMessage) {
        match msg {
            ReceivedMessage::Ready => {
                self.bridge.ready(self.reconciler.last_applied());
            }
            ReceivedMessage::Change(change) => {
                if let LocalChange::Publish(data) = self.bridge.on_editor_change(&change) {
                    self.reconciler.publish_local(data);
                }
            }
            ReceivedMessage::PointerMove(pointer) => {
                self.presence.on_pointer_move(PointerPosition { x: pointer.x, y: pointer.y });
            }
            ReceivedMessage::PointerLeave => {
                self.presence.on_pointer_leave();
            }
        }
    }

    fn on_status(&mut self, status: ConnectionStatus) {
        if status == self.status {
            return;
        }
        let previous = self.status;
        info!("Room {}: {} is {} (was {})", self.room_id, self.participant, status, previous);

        if status == ConnectionStatus::Disconnected {
            // Best effort; the relay cleans up after dropped connections too.
            self.presence.on_pointer_leave();
        }
        self.status = status;
        self.presence.set_connected(status.is_connected());
        self.bridge.send(&SendMessage::Status(StatusMessage { status }));

        if status.is_connected() && !previous.is_connected() {
            let outcome = self.reconciler.initial_sync();
            self.deliver(outcome);
            self.publish_presence_view();
        }
    }

    fn deliver(&mut self, outcome: ApplyOutcome) {
        match outcome {
            ApplyOutcome::Applied(content) => {
                debug!("Room {}: applying shared content to editor of {}", self.room_id, self.participant);
                self.bridge.push(&content);
            }
            ApplyOutcome::Unchanged => debug!("Room {}: content unchanged, nothing to apply", self.room_id),
            ApplyOutcome::Absent => debug!("Room {}: no content to apply", self.room_id),
            ApplyOutcome::Stale => debug!("Room {}: superseded apply ignored", self.room_id),
        }
    }

    fn publish_presence_view(&mut self) {
        let participants = self
            .presence
            .on_remote_change()
            .iter()
            .map(|(id, entry)| (id.to_string(), entry.clone()))
            .collect();
        self.bridge.send(&SendMessage::Presence(PresenceMessage { participants }));
    }

    fn teardown(&mut self) {
        info!("Room {}: stopping session of {}", self.room_id, self.participant);
        self.reconciler.reset();
        // Presence goes before the connection does.
        self.presence.release();
        self.client.disconnect();
    }
}

/// Handle to a running session. Dropping it stops the session.
pub struct Session {
    room_id: String,
    participant: ParticipantId,
    color: String,
    events: UnboundedSender<SessionEvent>,
    task: Option<JoinHandle<()>>,
}

impl Session {
    /// Connect to `room_id`, wire observers and start the event loop.
    /// Frames for the host page and editor are written to `sink`.
    pub fn start(connector: &dyn Connector, room_id: &str, options: SessionOptions, sink: EditorSink) -> Session {
        let participant = ParticipantId::generate();
        info!("Room {}: starting session for {}", room_id, participant);

        let client = connector.connect(room_id);
        let presence_map = client.get_mapping(PRESENCE_MAPPING);
        let content_map = client.get_mapping(CONTENT_MAPPING);
        let (tx, rx) = mpsc::unbounded_channel();

        let presence_tx = tx.clone();
        presence_map.observe(Arc::new(move |_key: &str| {
            let _ = presence_tx.send(SessionEvent::PresenceChanged);
        }));
        let content_tx = tx.clone();
        content_map.observe(Arc::new(move |key: &str| {
            if key == CONTENT_KEY {
                let _ = content_tx.send(SessionEvent::ContentChanged);
            }
        }));
        let status_tx = tx.clone();
        client.on_status(Arc::new(move |status| {
            let _ = status_tx.send(SessionEvent::Status(status));
        }));
        // The connection may have settled before the listener was registered.
        let _ = tx.send(SessionEvent::Status(client.status()));

        let presence = PresenceSynchronizer::new(participant.clone(), presence_map);
        let color = presence.color().to_string();
        let reconciler = ContentReconciler::new(participant.clone(), content_map, options.apply_delay, tx.clone());
        let bridge = EditorBridge::new(sink);
        bridge.send(&SendMessage::Welcome(WelcomeMessage {
            participant_id: participant.to_string(),
            color: color.clone(),
        }));

        let core = SessionCore {
            room_id: room_id.to_string(),
            participant: participant.clone(),
            client,
            status: ConnectionStatus::Connecting,
            presence,
            reconciler,
            bridge,
        };
        let task = tokio::spawn(run(core, rx));

        Session {
            room_id: room_id.to_string(),
            participant,
            color,
            events: tx,
            task: Some(task),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    pub fn color(&self) -> &str {
        &self.color
    }

    /// Sender feeding this session's event loop, for tasks that forward
    /// socket frames.
    pub fn events(&self) -> UnboundedSender<SessionEvent> {
        self.events.clone()
    }

    pub fn send(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            warn!("Room {}: session of {} is no longer running", self.room_id, self.participant);
        }
    }

    pub fn inbound(&self, raw: impl Into<String>) {
        self.send(SessionEvent::Inbound(raw.into()));
    }

    /// Stop the session and wait until presence is removed and the
    /// connection released.
    pub async fn stop(mut self) {
        let _ = self.events.send(SessionEvent::Stop);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Room {}: session task of {} failed: {}", self.room_id, self.participant, e);
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.task.is_some() {
            let _ = self.events.send(SessionEvent::Stop);
        }
    }
}

async fn run(mut core: SessionCore, mut events: UnboundedReceiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        if core.handle(event).is_break() {
            break;
        }
    }
    debug!("Room {}: session loop of {} ended", core.room_id, core.participant);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LoadMessage, ORIGIN_KEY};
    use crate::relay::{MemoryClient, MemoryRelay};
    use serde_json::{json, Value};
    use std::sync::Mutex;

    /// Keeps a handle on every client so tests can drive their status.
    struct RecordingConnector {
        relay: MemoryRelay,
        clients: Mutex<Vec<Arc<MemoryClient>>>,
    }

    impl RecordingConnector {
        fn new(ephemeral: &[&str]) -> Self {
            Self {
                relay: MemoryRelay::new(Duration::from_secs(60), ephemeral),
                clients: Mutex::new(Vec::new()),
            }
        }

        fn client(&self, index: usize) -> Arc<MemoryClient> {
            self.clients.lock().unwrap()[index].clone()
        }
    }

    impl Connector for RecordingConnector {
        fn connect(&self, room_id: &str) -> Arc<dyn SharedStateClient> {
            let client = self.relay.connect_client(room_id);
            self.clients.lock().unwrap().push(client.clone());
            client
        }
    }

    struct Participant {
        session: Session,
        frames: UnboundedReceiver<String>,
    }

    impl Participant {
        fn join(connector: &RecordingConnector, room: &str) -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            let session = Session::start(connector, room, SessionOptions::default(), tx);
            Self { session, frames: rx }
        }

        fn drain(&mut self) -> Vec<SendMessage> {
            let mut out = Vec::new();
            while let Ok(frame) = self.frames.try_recv() {
                out.push(serde_json::from_str(&frame).unwrap());
            }
            out
        }

        fn loads(&mut self) -> Vec<Value> {
            self.drain()
                .into_iter()
                .filter_map(|msg| match msg {
                    SendMessage::Load(LoadMessage { data }) => Some(data),
                    _ => None,
                })
                .collect()
        }

        fn edit(&self, data: &Value) {
            let frame = json!({"type": "change", "data": data.to_string(), "event": {"element": "shape", "recordUndo": true}});
            self.session.inbound(frame.to_string());
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_joiner_sees_no_content_then_receives_edit_and_pointer() {
        let connector = RecordingConnector::new(&[PRESENCE_MAPPING]);
        let mut a = Participant::join(&connector, "abc123");
        settle().await;
        let mut b = Participant::join(&connector, "abc123");
        settle().await;

        a.session.inbound(r#"{"type":"ready"}"#);
        b.session.inbound(r#"{"type":"ready"}"#);
        settle().await;
        assert!(b.loads().is_empty());

        a.edit(&json!("X"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(b.loads(), vec![json!("X")]);
        assert!(a.loads().is_empty());

        a.session.inbound(r#"{"type":"pointer-move","x":10,"y":20}"#);
        settle().await;
        let presence = b
            .drain()
            .into_iter()
            .filter_map(|msg| match msg {
                SendMessage::Presence(p) => Some(p),
                _ => None,
            })
            .last()
            .unwrap();
        let entry = &presence.participants[a.session.participant().as_str()];
        assert_eq!((entry.x, entry.y), (10.0, 20.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_near_simultaneous_edits_converge_on_last_writer() {
        let connector = RecordingConnector::new(&[PRESENCE_MAPPING]);
        let mut a = Participant::join(&connector, "abc123");
        let mut b = Participant::join(&connector, "abc123");
        settle().await;
        a.session.inbound(r#"{"type":"ready"}"#);
        b.session.inbound(r#"{"type":"ready"}"#);
        settle().await;
        a.drain();
        b.drain();

        a.edit(&json!({"by": "a"}));
        tokio::time::sleep(Duration::from_millis(5)).await;
        b.edit(&json!({"by": "b"}));
        settle().await;

        assert_eq!(a.loads(), vec![json!({"by": "b"})]);
        assert!(b.loads().is_empty());

        let content = connector.client(0).get_mapping(CONTENT_MAPPING);
        assert_eq!(content.get(CONTENT_KEY), Some(json!(json!({"by": "b"}).to_string())));
        assert_eq!(content.get(ORIGIN_KEY), Some(json!(b.session.participant().as_str())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_filtered_changes_never_reach_shared_record() {
        let connector = RecordingConnector::new(&[PRESENCE_MAPPING]);
        let a = Participant::join(&connector, "abc123");
        settle().await;

        a.session.inbound(r#"{"type":"change","data":"{\"sel\":1}","event":{"element":"selection"}}"#);
        a.session.inbound(r#"{"type":"change","data":"{\"tmp\":1}","event":{"recordUndo":false}}"#);
        a.session.inbound(r#"{"type":"change"}"#);
        a.session.inbound("garbage");
        settle().await;

        let content = connector.client(0).get_mapping(CONTENT_MAPPING);
        assert!(content.entries().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_after_initial_sync_delivers_existing_content() {
        let connector = RecordingConnector::new(&[PRESENCE_MAPPING]);
        let a = Participant::join(&connector, "abc123");
        settle().await;
        a.edit(&json!({"doc": "existing"}));
        settle().await;

        let mut b = Participant::join(&connector, "abc123");
        settle().await;
        assert!(b.loads().is_empty());

        b.session.inbound(r#"{"type":"ready"}"#);
        settle().await;
        assert_eq!(b.loads(), vec![json!({"doc": "existing"})]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_syncs_content_missed_while_offline() {
        let connector = RecordingConnector::new(&[PRESENCE_MAPPING]);
        let a = Participant::join(&connector, "abc123");
        let mut b = Participant::join(&connector, "abc123");
        settle().await;
        b.session.inbound(r#"{"type":"ready"}"#);
        settle().await;
        b.drain();

        let b_client = connector.client(1);
        b_client.set_status(ConnectionStatus::Disconnected);
        a.edit(&json!("while-away"));
        settle().await;
        assert!(b.loads().is_empty());

        b_client.set_status(ConnectionStatus::Connected);
        settle().await;
        assert_eq!(b.loads(), vec![json!("while-away")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pointer_frames_drive_presence() {
        let connector = RecordingConnector::new(&[PRESENCE_MAPPING]);
        let a = Participant::join(&connector, "abc123");
        settle().await;
        let presence = connector.client(0).get_mapping(PRESENCE_MAPPING);
        let id = a.session.participant().as_str().to_string();

        a.session.inbound(r#"{"type":"pointer-move","x":3,"y":4}"#);
        settle().await;
        let entry = presence.get(&id).unwrap();
        assert_eq!((entry["x"].clone(), entry["y"].clone()), (json!(3.0), json!(4.0)));

        a.session.inbound(r#"{"type":"pointer-leave"}"#);
        settle().await;
        assert!(presence.get(&id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_removes_presence_before_disconnecting() {
        // No relay-side cleanup: removal must come from the session itself.
        let connector = RecordingConnector::new(&[]);
        let a = Participant::join(&connector, "abc123");
        let b = Participant::join(&connector, "abc123");
        settle().await;

        a.session.inbound(r#"{"type":"pointer-move","x":1,"y":2}"#);
        settle().await;
        let presence = connector.client(1).get_mapping(PRESENCE_MAPPING);
        assert!(presence.get(a.session.participant().as_str()).is_some());

        let a_id = a.session.participant().clone();
        a.session.stop().await;

        assert!(presence.get(a_id.as_str()).is_none());
        assert_eq!(connector.client(0).status(), ConnectionStatus::Disconnected);
        drop(b);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sessions_do_not_share_reconciliation_state() {
        let connector = RecordingConnector::new(&[PRESENCE_MAPPING]);
        let a = Participant::join(&connector, "room-one");
        let mut b = Participant::join(&connector, "room-two");
        settle().await;
        b.session.inbound(r#"{"type":"ready"}"#);
        a.edit(&json!("only-in-one"));
        settle().await;

        assert!(b.loads().is_empty());
        assert_eq!(a.session.room_id(), "room-one");
    }
}
