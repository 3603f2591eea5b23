//! In-process relay.
//!
//! Rooms live as long as a connection holds them, and are retained for a
//! configurable idle period after the last participant leaves so that a
//! reload finds the previous content. Mappings registered as ephemeral are
//! cleaned up by the relay when the connection that wrote an entry drops.

use moka::sync::Cache;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tracing::{debug, info};

use super::{Connector, ObserveCallback, RelayError, SharedMapping, SharedStateClient, StatusCallback};
use crate::models::ConnectionStatus;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Counters reported by the diagnostics endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub n_rooms: u32,
    pub n_conn: u32,
    pub n_retained_rooms: u32,
}

/// Point-in-time copy of a room's mappings.
#[derive(Debug, Clone)]
pub struct RoomSnapshot {
    pub n_conn: u32,
    pub mappings: HashMap<String, HashMap<String, Value>>,
}

struct Member {
    id: u64,
    status: Mutex<ConnectionStatus>,
    observers: Mutex<Vec<(String, ObserveCallback)>>,
    status_callbacks: Mutex<Vec<StatusCallback>>,
}

#[derive(Default)]
struct RoomData {
    mappings: HashMap<String, HashMap<String, Value>>,
    // (mapping, key) -> member id, for ephemeral mappings only
    writers: HashMap<(String, String), u64>,
}

struct Room {
    id: String,
    data: Mutex<RoomData>,
    members: Mutex<Vec<Arc<Member>>>,
}

impl Room {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            data: Mutex::new(RoomData::default()),
            members: Mutex::new(Vec::new()),
        }
    }

    /// Call every connected member's observers registered on `mapping`.
    fn notify(&self, mapping: &str, key: &str) {
        let callbacks: Vec<ObserveCallback> = {
            let members = lock(&self.members);
            members
                .iter()
                .filter(|m| lock(&m.status).is_connected())
                .flat_map(|m| {
                    lock(&m.observers)
                        .iter()
                        .filter(|(name, _)| name == mapping)
                        .map(|(_, cb)| cb.clone())
                        .collect::<Vec<_>>()
                })
                .collect()
        };
        for callback in callbacks {
            callback(key);
        }
    }

    /// Remove ephemeral entries written by `member_id` and notify observers.
    fn drop_ephemeral(&self, member_id: u64) {
        let removed: Vec<(String, String)> = {
            let mut data = lock(&self.data);
            let owned: Vec<(String, String)> = data
                .writers
                .iter()
                .filter(|(_, id)| **id == member_id)
                .map(|(k, _)| k.clone())
                .collect();
            for (mapping, key) in &owned {
                data.writers.remove(&(mapping.clone(), key.clone()));
                if let Some(entries) = data.mappings.get_mut(mapping) {
                    entries.remove(key);
                }
            }
            owned
        };
        for (mapping, key) in removed {
            debug!("Relay dropped ephemeral '{}/{}' in room {}", mapping, key, self.id);
            self.notify(&mapping, &key);
        }
    }
}

struct RelayShared {
    rooms: Mutex<HashMap<String, Weak<Room>>>,
    retained: Cache<String, Arc<Room>>,
    ephemeral: HashSet<String>,
    next_member: AtomicU64,
}

/// Relay keeping every room in process memory.
#[derive(Clone)]
pub struct MemoryRelay {
    shared: Arc<RelayShared>,
}

impl MemoryRelay {
    /// Create a relay. Entries of the `ephemeral` mappings are removed when
    /// their writer disconnects; empty rooms are kept for `retention`.
    pub fn new(retention: Duration, ephemeral: &[&str]) -> Self {
        Self {
            shared: Arc::new(RelayShared {
                rooms: Mutex::new(HashMap::new()),
                retained: Cache::builder()
                    .max_capacity(10_000)
                    .time_to_idle(retention)
                    .build(),
                ephemeral: ephemeral.iter().map(|s| s.to_string()).collect(),
                next_member: AtomicU64::new(1),
            }),
        }
    }

    fn room(&self, room_id: &str) -> Arc<Room> {
        let mut rooms = lock(&self.shared.rooms);
        rooms.retain(|_, room| room.strong_count() > 0);
        // A room being joined is live again, not retained.
        let retained = self.shared.retained.remove(room_id);
        if let Some(room) = rooms.get(room_id).and_then(Weak::upgrade) {
            return room;
        }
        let room = match retained {
            Some(room) => {
                info!("Reopening retained room {}", room_id);
                room
            }
            None => {
                info!("Creating room {}", room_id);
                Arc::new(Room::new(room_id))
            }
        };
        rooms.insert(room_id.to_string(), Arc::downgrade(&room));
        room
    }

    fn live_room(&self, room_id: &str) -> Option<Arc<Room>> {
        let live = lock(&self.shared.rooms).get(room_id).and_then(Weak::upgrade);
        live.or_else(|| self.shared.retained.get(room_id))
    }

    /// Open a connection to `room_id`. The connection reports `connecting`
    /// and switches to `connected` on the next scheduler turn.
    pub fn connect_client(&self, room_id: &str) -> Arc<MemoryClient> {
        let room = self.room(room_id);
        let member = Arc::new(Member {
            id: self.shared.next_member.fetch_add(1, Ordering::Relaxed),
            status: Mutex::new(ConnectionStatus::Connecting),
            observers: Mutex::new(Vec::new()),
            status_callbacks: Mutex::new(Vec::new()),
        });
        lock(&room.members).push(member.clone());

        let client = Arc::new(MemoryClient {
            member,
            room,
            relay: self.shared.clone(),
        });

        let pending = client.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            if pending.status() == ConnectionStatus::Connecting {
                pending.set_status(ConnectionStatus::Connected);
            }
        });
        client
    }

    /// Copy of a room's state, or `None` if the room is neither live nor retained.
    pub fn snapshot(&self, room_id: &str) -> Option<RoomSnapshot> {
        let room = self.live_room(room_id)?;
        let n_conn = lock(&room.members).len() as u32;
        let mappings = lock(&room.data).mappings.clone();
        Some(RoomSnapshot { n_conn, mappings })
    }

    pub fn stats(&self) -> RelayStats {
        let live: Vec<Arc<Room>> = lock(&self.shared.rooms)
            .values()
            .filter_map(Weak::upgrade)
            .filter(|room| !lock(&room.members).is_empty())
            .collect();
        let n_conn = live.iter().map(|r| lock(&r.members).len() as u32).sum();
        self.shared.retained.run_pending_tasks();
        RelayStats {
            n_rooms: live.len() as u32,
            n_conn,
            n_retained_rooms: self.shared.retained.entry_count() as u32,
        }
    }
}

impl Connector for MemoryRelay {
    fn connect(&self, room_id: &str) -> Arc<dyn SharedStateClient> {
        self.connect_client(room_id)
    }
}

/// A single participant's connection to a room of the [`MemoryRelay`].
pub struct MemoryClient {
    member: Arc<Member>,
    room: Arc<Room>,
    relay: Arc<RelayShared>,
}

impl MemoryClient {
    pub fn room_id(&self) -> &str {
        &self.room.id
    }

    /// Force a status transition, e.g. to simulate a dropped relay link.
    /// Going offline lets the relay clean up the ephemeral entries this
    /// connection wrote.
    pub fn set_status(&self, status: ConnectionStatus) {
        {
            let mut current = lock(&self.member.status);
            if *current == status {
                return;
            }
            *current = status;
        }
        debug!("Connection {} in room {} is now {}", self.member.id, self.room.id, status);
        if status == ConnectionStatus::Disconnected {
            self.room.drop_ephemeral(self.member.id);
        }
        let callbacks: Vec<StatusCallback> = lock(&self.member.status_callbacks).clone();
        for callback in callbacks {
            callback(status);
        }
    }
}

impl SharedStateClient for MemoryClient {
    fn get_mapping(&self, name: &str) -> Arc<dyn SharedMapping> {
        Arc::new(MemoryMapping {
            name: name.to_string(),
            ephemeral: self.relay.ephemeral.contains(name),
            member: self.member.clone(),
            room: self.room.clone(),
        })
    }

    fn on_status(&self, callback: StatusCallback) {
        lock(&self.member.status_callbacks).push(callback);
    }

    fn status(&self) -> ConnectionStatus {
        *lock(&self.member.status)
    }

    fn disconnect(&self) {
        self.set_status(ConnectionStatus::Disconnected);
        lock(&self.member.observers).clear();
        lock(&self.member.status_callbacks).clear();

        let remaining = {
            let mut members = lock(&self.room.members);
            members.retain(|m| m.id != self.member.id);
            members.len()
        };
        if remaining == 0 {
            info!("Room {} is empty, retaining its state", self.room.id);
            self.relay.retained.insert(self.room.id.clone(), self.room.clone());
        }
    }
}

struct MemoryMapping {
    name: String,
    ephemeral: bool,
    member: Arc<Member>,
    room: Arc<Room>,
}

impl MemoryMapping {
    fn ensure_connected(&self) -> Result<(), RelayError> {
        if lock(&self.member.status).is_connected() {
            Ok(())
        } else {
            Err(RelayError::Offline(self.room.id.clone()))
        }
    }
}

impl SharedMapping for MemoryMapping {
    fn get(&self, key: &str) -> Option<Value> {
        lock(&self.room.data)
            .mappings
            .get(&self.name)
            .and_then(|entries| entries.get(key))
            .cloned()
    }

    fn set(&self, key: &str, value: Value) -> Result<(), RelayError> {
        self.ensure_connected()?;
        {
            let mut data = lock(&self.room.data);
            data.mappings
                .entry(self.name.clone())
                .or_default()
                .insert(key.to_string(), value);
            if self.ephemeral {
                data.writers.insert((self.name.clone(), key.to_string()), self.member.id);
            }
        }
        self.room.notify(&self.name, key);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), RelayError> {
        self.ensure_connected()?;
        let existed = {
            let mut data = lock(&self.room.data);
            data.writers.remove(&(self.name.clone(), key.to_string()));
            data.mappings
                .get_mut(&self.name)
                .and_then(|entries| entries.remove(key))
                .is_some()
        };
        if existed {
            self.room.notify(&self.name, key);
        }
        Ok(())
    }

    fn entries(&self) -> HashMap<String, Value> {
        lock(&self.room.data)
            .mappings
            .get(&self.name)
            .cloned()
            .unwrap_or_default()
    }

    fn observe(&self, callback: ObserveCallback) {
        lock(&self.member.observers).push((self.name.clone(), callback));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn relay() -> MemoryRelay {
        MemoryRelay::new(Duration::from_secs(60), &["presence"])
    }

    async fn connected(relay: &MemoryRelay, room: &str) -> Arc<MemoryClient> {
        let client = relay.connect_client(room);
        client.set_status(ConnectionStatus::Connected);
        client
    }

    #[tokio::test]
    async fn test_connection_becomes_connected() {
        let relay = relay();
        let client = relay.connect_client("abc123");
        assert_eq!(client.status(), ConnectionStatus::Connecting);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        client.on_status(Arc::new(move |status: ConnectionStatus| lock(&sink).push(status)));

        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        assert_eq!(client.status(), ConnectionStatus::Connected);
        assert_eq!(*lock(&seen), vec![ConnectionStatus::Connected]);
    }

    #[tokio::test]
    async fn test_observers_see_own_and_remote_writes() {
        let relay = relay();
        let a = connected(&relay, "abc123").await;
        let b = connected(&relay, "abc123").await;

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let doc_a = a.get_mapping("document");
        doc_a.observe(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        doc_a.set("content", json!("one")).unwrap();
        b.get_mapping("document").set("content", json!("two")).unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(doc_a.get("content"), Some(json!("two")));
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let relay = relay();
        let a = connected(&relay, "room-a").await;
        let b = connected(&relay, "room-b").await;

        a.get_mapping("document").set("content", json!("x")).unwrap();
        assert_eq!(b.get_mapping("document").get("content"), None);
    }

    #[tokio::test]
    async fn test_offline_writes_fail() {
        let relay = relay();
        let client = relay.connect_client("abc123");
        let err = client.get_mapping("document").set("content", json!("x")).unwrap_err();
        assert_eq!(err, RelayError::Offline("abc123".to_string()));
    }

    #[tokio::test]
    async fn test_disconnect_cleans_ephemeral_entries_only() {
        let relay = relay();
        let a = connected(&relay, "abc123").await;
        let b = connected(&relay, "abc123").await;

        a.get_mapping("presence").set("a", json!({"x": 1.0, "y": 2.0, "color": "red"})).unwrap();
        a.get_mapping("document").set("content", json!("keep")).unwrap();

        let notified = Arc::new(AtomicUsize::new(0));
        let counter = notified.clone();
        b.get_mapping("presence").observe(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        a.disconnect();

        assert!(b.get_mapping("presence").entries().is_empty());
        assert_eq!(b.get_mapping("document").get("content"), Some(json!("keep")));
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_room_is_retained() {
        let relay = relay();
        let a = connected(&relay, "abc123").await;
        a.get_mapping("document").set("content", json!("persisted")).unwrap();
        a.disconnect();
        drop(a);

        let snapshot = relay.snapshot("abc123").unwrap();
        assert_eq!(snapshot.n_conn, 0);

        let b = connected(&relay, "abc123").await;
        assert_eq!(b.get_mapping("document").get("content"), Some(json!("persisted")));
    }

    #[tokio::test]
    async fn test_reopened_room_is_no_longer_counted_as_retained() {
        let relay = relay();
        let a = connected(&relay, "abc123").await;
        a.disconnect();
        drop(a);

        let stats = relay.stats();
        assert_eq!((stats.n_rooms, stats.n_retained_rooms), (0, 1));

        let _b = connected(&relay, "abc123").await;
        let stats = relay.stats();
        assert_eq!((stats.n_rooms, stats.n_retained_rooms), (1, 0));
        assert_eq!(stats.n_conn, 1);
    }

    #[tokio::test]
    async fn test_stats_count_rooms_and_connections() {
        let relay = relay();
        let _a = connected(&relay, "one").await;
        let _b = connected(&relay, "one").await;
        let _c = connected(&relay, "two").await;

        let stats = relay.stats();
        assert_eq!(stats.n_rooms, 2);
        assert_eq!(stats.n_conn, 3);
        assert!(relay.snapshot("unknown").is_none());
    }
}
