pub mod handlers;
pub mod state;

use crate::collab::Collaborators;
use crate::config::Config;
use axum::Router;
use axum::routing::{any, get};
use state::AppState;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

/// Build the router with inert collaborators (tests, headless use).
pub async fn build_router(config: Config) -> Router {
    let state = AppState::new(config).expect("invalid configuration");
    build_router_with(state)
}

/// Build the router around an existing state (embedding applications
/// inject their collaborators through [`AppState::with_collaborators`]).
pub fn build_router_with(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::health::health_check))
        .route("/health", get(handlers::health::health_check))
        .route(
            handlers::sentinel::STOP_PLAYLIST_PATH,
            get(handlers::sentinel::stop_playlist),
        )
        .route(
            handlers::sentinel::NEXT_PLAYLIST_PATH,
            get(handlers::sentinel::next_playlist),
        )
        .route(
            handlers::sentinel::EMPTY_TS_PATH,
            get(handlers::sentinel::empty_segment),
        )
        .route("/{*target}", any(handlers::proxy::proxy_any))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the Axum HTTP server
pub async fn start(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("127.0.0.1:{}", config.port);

    if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new().install() {
        warn!("Prometheus exporter not installed: {}", e);
    }

    let state = AppState::with_collaborators(config, Collaborators::inert())?;
    let app = build_router_with(state);

    let listener = match tokio::net::TcpListener::bind(addr.as_str()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to address {}: {}", addr, e);
            return Err(e.into());
        }
    };

    info!("Proxy listening on http://{}", addr);

    if let Err(e) = axum::serve(listener, app).await {
        error!("Server error: {}", e);
        return Err(e.into());
    }

    Ok(())
}
