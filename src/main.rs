use colabri_live::config::Config;
use colabri_live::routes::create_app;
use colabri_live::AppState;
use std::panic;
use std::sync::Arc;
use tracing::{info, error, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[tokio::main(flavor = "current_thread")]
async fn main() {

    // Set panic hook for better error messages
    panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
    }));

    // Load configuration
    let (config, load_error) = match Config::load() {
        Ok(config) => (config, None),
        Err(e) => (Config::default(), Some(e)),
    };

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            // Fall back to the configured level for our app
            config.log_filter().into()
        }))
        .init();

    info!("Starting server...");

    match load_error {
        None => info!("✅ Configuration loaded successfully"),
        Some(e) => {
            error!("❌ Failed to load configuration: {}", e);
            warn!("Using default configuration");
        }
    }
    if config.is_development() {
        info!("Running in development mode: {:?}", config);
    }

    let state = Arc::new(AppState::new(&config));
    info!(
        "Relay ready (apply delay {} ms, room retention {} s)",
        config.apply_delay_ms, config.room_retention_secs
    );

    let app_routes = create_app(state, &config);

    // Start the HTTP/WebSocket server
    let listener = match tokio::net::TcpListener::bind(config.server_address()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", config.server_address(), e);
            return;
        }
    };

    info!("🚀 Server running on http://{}", config.server_address());
    info!("📡 Rooms available at ws://{}/rooms/{{room_id}}/ws", config.server_address());
    info!("📚 Swagger UI available at http://{}/swagger", config.server_address());

    if let Err(e) = axum::serve(listener, app_routes).await {
        error!("Server error: {}", e);
    }
}
