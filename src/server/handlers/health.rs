use crate::server::state::AppState;
use axum::Json;
use axum::extract::State;
use axum::response::IntoResponse;
use serde_json::json;

pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let active = state.session.snapshot().is_some();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "active_sessions": if active { 1 } else { 0 },
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}
