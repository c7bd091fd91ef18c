//! Transport-level middleware applied to every HTTP request.
//!
//! Layers are listed outermost first: the first layer sees the request
//! first and the response last.

use axum::body::Body;
use axum::http::header::HeaderName;
use axum::http::StatusCode;
use tower::layer::util::{Identity, Stack};
use tower::ServiceBuilder;
use tower_http::classify::{ServerErrorsAsFailures, SharedClassifier};
use tower_http::limit::{RequestBodyLimitLayer, ResponseBody};
use tower_http::map_response_body::MapResponseBodyLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use super::config::NetworkConfig;

/// Header carrying the request id assigned at the edge.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

type HttpLayers = Stack<
    PropagateRequestIdLayer,
    Stack<
        RequestBodyLimitLayer,
        Stack<
            MapResponseBodyLayer<BodyAdapter>,
            Stack<
                TimeoutLayer,
                Stack<
                    TraceLayer<SharedClassifier<ServerErrorsAsFailures>>,
                    Stack<SetRequestIdLayer<MakeRequestUuid>, Identity>,
                >,
            >,
        >,
    >,
>;

/// Re-boxes the body-limit response body so `Timeout` (which needs a
/// `Default` body) can sit outside it.
type BodyAdapter = fn(ResponseBody<Body>) -> Body;

/// Builds the HTTP middleware stack.
///
/// 1. `SetRequestId` -- UUID v4 `x-request-id` unless the client sent one
/// 2. `Trace` -- request/response spans
/// 3. `Timeout` -- 408 after `request_timeout`
/// 4. `RequestBodyLimit` -- 413 above `max_body_bytes`
/// 5. `PropagateRequestId` -- echoes `x-request-id` on the response
///
/// Protocol-level concerns (CORS, error rendering) live in the gateway chain.
#[must_use]
pub fn build_http_layers(config: &NetworkConfig) -> HttpLayers {
    let request_id = HeaderName::from_static(REQUEST_ID_HEADER);

    ServiceBuilder::new()
        .layer(SetRequestIdLayer::new(request_id.clone(), MakeRequestUuid))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            config.request_timeout,
        ))
        .layer(MapResponseBodyLayer::new(Body::new as BodyAdapter))
        .layer(RequestBodyLimitLayer::new(config.max_body_bytes))
        .layer(PropagateRequestIdLayer::new(request_id))
        .into_inner()
}
