//! Health, liveness and readiness endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;

use super::AppState;
use crate::network::HealthState;

/// Listener state plus the lifecycle of every declared service.
///
/// Always 200; the body says whether the gateway is actually serving.
pub async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let services = state.gateway.registry().statuses();

    Json(json!({
        "state": state.shutdown.health_state().as_str(),
        "in_flight": state.shutdown.in_flight_count(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "services": services,
    }))
}

/// Always 200 while the process answers at all.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// 200 once serving, 503 while starting or draining.
pub async fn readiness_handler(State(state): State<AppState>) -> StatusCode {
    if state.shutdown.health_state() == HealthState::Ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::handlers::tests::app_state;

    #[tokio::test]
    async fn health_lists_declared_services() {
        let state = app_state();
        state.shutdown.set_ready();

        let json = health_handler(State(state)).await.0;

        assert_eq!(json["state"], "ready");
        assert_eq!(json["in_flight"], 0);
        assert!(json["uptime_secs"].is_number());
        let services = json["services"].as_array().unwrap();
        let sqs = services.iter().find(|s| s["service"] == "sqs").unwrap();
        assert_eq!(sqs["state"], "available");
        assert_eq!(sqs["provider"], "default");
        assert!(services.iter().any(|s| s["service"] == "dynamodb"));
    }

    #[tokio::test]
    async fn health_counts_in_flight_requests() {
        let state = app_state();
        let _guard = state.shutdown.in_flight_guard();

        let json = health_handler(State(state)).await.0;
        assert_eq!(json["state"], "starting");
        assert_eq!(json["in_flight"], 1);
    }

    #[tokio::test]
    async fn readiness_follows_listener_state() {
        let state = app_state();
        assert_eq!(readiness_handler(State(state.clone())).await, StatusCode::SERVICE_UNAVAILABLE);

        state.shutdown.set_ready();
        assert_eq!(readiness_handler(State(state.clone())).await, StatusCode::OK);

        state.shutdown.begin_drain();
        assert_eq!(readiness_handler(State(state)).await, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn liveness_is_unconditional() {
        assert_eq!(liveness_handler().await, StatusCode::OK);
    }
}
