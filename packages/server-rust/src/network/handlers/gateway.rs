//! Catch-all handler feeding HTTP requests into the gateway chain.

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use uuid::Uuid;

use super::AppState;
use crate::codec::EncodedResponse;
use crate::gateway::RequestContext;
use crate::network::middleware::REQUEST_ID_HEADER;

/// Buffers the request, runs the gateway chain and writes its response.
///
/// The request id set at the edge becomes the gateway request id, so the
/// `x-request-id` header and the protocol request-id headers agree.
pub async fn gateway_handler(State(state): State<AppState>, request: Request) -> Response {
    let _in_flight = state.shutdown.in_flight_guard();
    let (parts, body) = request.into_parts();

    let body = match to_bytes(body, state.config.max_body_bytes).await {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!(error = %e, path = %parts.uri.path(), "failed to read request body");
            return (StatusCode::BAD_REQUEST, "unreadable request body").into_response();
        }
    };

    let request_id = parts
        .headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map_or_else(|| Uuid::new_v4().to_string(), str::to_string);

    let mut ctx = RequestContext::new(
        request_id,
        parts.method,
        parts.uri.path(),
        parts.uri.query().unwrap_or_default(),
        parts.headers,
        body,
    );
    state.gateway.handle(&mut ctx).await.into_response()
}

impl IntoResponse for EncodedResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}
