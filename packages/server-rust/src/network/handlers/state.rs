//! `POST /_stratus/state/{service}/reset`.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use super::AppState;

/// Clears a service back to a usable, empty condition.
///
/// A service in the error state returns to `available` so the next request
/// retries activation; a running service drops its emulated state. Responds
/// 404 for undeclared services.
pub async fn reset_handler(State(state): State<AppState>, Path(service): Path<String>) -> Response {
    let registry = state.gateway.registry();

    let lifecycle = match registry.reset(&service) {
        Ok(lifecycle) => lifecycle,
        Err(e) => {
            return (StatusCode::NOT_FOUND, Json(json!({ "error": e.to_string() }))).into_response();
        }
    };

    match registry.reset_state(&service).await {
        Ok(state_reset) => Json(json!({
            "service": service,
            "state": lifecycle,
            "state_reset": state_reset,
        }))
        .into_response(),
        Err(e) => {
            tracing::error!(service = %service, error = %e, "state reset failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": e.to_string() }))).into_response()
        }
    }
}
