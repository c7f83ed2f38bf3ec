//! HTTP middleware stack.
//!
//! Layers run outer to inner: the first layer listed sees the request first
//! and the response last.

use axum::extract::Request;
use axum::http::header::HeaderName;
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::Router;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use super::config::NetworkConfig;

/// Correlation header sent by the caller and echoed on every response.
pub const CORRELATION_HEADER: &str = "x-ms-correlation-request-id";
/// Response header carrying the same id as the correlation header.
pub const REQUEST_ID_HEADER: &str = "x-ms-request-id";
/// Subscription the caller acts for. Logged only.
pub const SUBSCRIPTION_HEADER: &str = "subscriptionid";

/// Wraps `router` in the HTTP middleware stack.
///
/// 1. `SetRequestId` -- generates a UUID correlation id when the caller sent none
/// 2. `Tracing` -- one span per request
/// 3. `PropagateRequestId` -- echoes the correlation id on the response
/// 4. `echo_request_id` -- copies it into `x-ms-request-id`
/// 5. `Timeout` -- bounds request processing
///
/// Responses produced inside the stack, such as extractor rejections and
/// timeouts, still carry both headers.
pub fn with_http_layers(router: Router, config: &NetworkConfig) -> Router {
    let correlation = HeaderName::from_static(CORRELATION_HEADER);

    router.layer(
        ServiceBuilder::new()
            .layer(SetRequestIdLayer::new(correlation.clone(), MakeRequestUuid))
            .layer(TraceLayer::new_for_http())
            .layer(PropagateRequestIdLayer::new(correlation))
            .layer(middleware::from_fn(echo_request_id))
            .layer(TimeoutLayer::with_status_code(
                StatusCode::REQUEST_TIMEOUT,
                config.request_timeout,
            )),
    )
}

async fn echo_request_id(request: Request, next: Next) -> Response {
    let id = request.headers().get(CORRELATION_HEADER).cloned();
    let mut response = next.run(request).await;
    if let Some(id) = id {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), id);
    }
    response
}
