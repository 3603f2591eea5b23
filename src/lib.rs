pub mod models;
pub mod handlers;
pub mod routes;
pub mod docs;
pub mod config;
pub mod colab;
pub mod relay;
pub mod websocket;

use colab::SessionOptions;
use config::Config;
use models::PRESENCE_MAPPING;
use relay::MemoryRelay;

/// State shared by every request and socket
pub struct AppState {
    pub relay: MemoryRelay,
    pub session_options: SessionOptions,
}

impl AppState {
    pub fn new(config: &Config) -> Self {
        Self {
            relay: MemoryRelay::new(config.room_retention(), &[PRESENCE_MAPPING]),
            session_options: config.session_options(),
        }
    }
}
