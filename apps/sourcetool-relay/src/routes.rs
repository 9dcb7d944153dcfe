use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::metrics;
use crate::state::AppState;
use crate::ws::ws_handler;

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    uptime_secs: u64,
    instance_id: String,
    hosts: usize,
    clients: usize,
}

async fn health() -> &'static str {
    "ok"
}

async fn ready(State(state): State<AppState>) -> Json<ReadyResponse> {
    let registry = state.router().registry();
    Json(ReadyResponse {
        status: "ok",
        uptime_secs: state.uptime_secs(),
        instance_id: state.instance_id().to_string(),
        hosts: registry.host_count(),
        clients: registry.client_count(),
    })
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .route("/readyz", get(ready))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather(),
    )
}
