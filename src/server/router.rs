//! Route table and handlers.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::instrument;

use crate::gateway;

use super::ServeState;

pub fn router(state: ServeState) -> Router {
    Router::new()
        .route("/api/watch", post(watch_handler))
        .route("/healthz", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[instrument(name = "pagewatch.watch", skip_all)]
async fn watch_handler(
    State(state): State<ServeState>,
    Json(payload): Json<Value>,
) -> Response {
    let response = match gateway::parse_task_input(&payload) {
        Ok(input) => gateway::respond(state.orchestrator.run(input).await),
        Err(err) => gateway::error_response(&err),
    };
    let status =
        StatusCode::from_u16(response.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        response.body,
    )
        .into_response()
}

async fn health_handler(State(state): State<ServeState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "durableStore": state.orchestrator.storage().is_durable(),
    }))
}
