//! Shared-state client interface.
//!
//! The reconciliation core only ever talks to the replicated key/value store
//! through these traits. A connection is scoped to one room; inside a room,
//! named mappings hold JSON values and notify observers on every write,
//! including writes made by the observing connection itself.

pub mod memory;

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::models::ConnectionStatus;

pub use memory::{MemoryClient, MemoryRelay};

/// Invoked after a mapping changed. Receives the changed key.
pub type ObserveCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Invoked whenever the connection status changes.
pub type StatusCallback = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// The connection is not currently connected to the relay.
    #[error("connection to room '{0}' is offline")]
    Offline(String),
}

/// One named, observable key/value mapping inside a room.
pub trait SharedMapping: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&self, key: &str, value: Value) -> Result<(), RelayError>;
    fn delete(&self, key: &str) -> Result<(), RelayError>;
    /// Snapshot of every entry currently in the mapping.
    fn entries(&self) -> HashMap<String, Value>;
    fn observe(&self, callback: ObserveCallback);
}

/// A connection to one room of the relay.
pub trait SharedStateClient: Send + Sync {
    fn get_mapping(&self, name: &str) -> Arc<dyn SharedMapping>;
    fn on_status(&self, callback: StatusCallback);
    fn status(&self) -> ConnectionStatus;
    fn disconnect(&self);
}

/// Opens connections scoped to a room identifier.
pub trait Connector: Send + Sync {
    fn connect(&self, room_id: &str) -> Arc<dyn SharedStateClient>;
}
