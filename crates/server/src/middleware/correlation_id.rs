//! Request correlation for relay traffic.
//!
//! Every inbound request gets an `x-request-id` (kept when the gateway already sent one) that
//! is echoed on the response and recorded on the request's tracing span together with the
//! relay protocol, so log lines from the proxy, signer and publish path can be joined.

use axum::http::{header, header::HeaderValue, HeaderName, Request};
use std::sync::Arc;
use tower_http::{
    classify::{ServerErrorsAsFailures, SharedClassifier},
    request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    trace::{DefaultOnResponse, TraceLayer},
};
use tracing::{Level, Span};
use uuid::Uuid;

pub static X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

#[derive(Clone, Debug)]
pub struct CorrelationId(pub Arc<str>);

impl CorrelationId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn generate() -> Self {
        Self(Arc::from(Uuid::new_v4().to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The id carried by `request`, if the request id layer already ran.
    pub fn from_request<B>(request: &Request<B>) -> Option<Self> {
        request
            .extensions()
            .get::<RequestId>()
            .and_then(|id| id.header_value().to_str().ok())
            .map(Self::new)
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Default)]
pub struct UuidRequestIdGenerator;

impl MakeRequestId for UuidRequestIdGenerator {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        let id = Uuid::new_v4().to_string();
        Some(RequestId::new(HeaderValue::from_str(&id).ok()?))
    }
}

/// `(set, propagate)` request id layers. Apply `propagate` first so it wraps the handler:
/// `router.layer(propagate).layer(set)`.
pub fn create_request_id_layers() -> (SetRequestIdLayer<UuidRequestIdGenerator>, PropagateRequestIdLayer)
{
    (
        SetRequestIdLayer::new(X_REQUEST_ID.clone(), UuidRequestIdGenerator),
        PropagateRequestIdLayer::new(X_REQUEST_ID.clone()),
    )
}

/// Protocol label for a relay request, from its upgrade and content-type headers.
#[must_use]
pub fn relay_protocol<B>(request: &Request<B>) -> &'static str {
    let headers = request.headers();
    let is_upgrade = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    if is_upgrade {
        return "websocket";
    }
    let content_type =
        headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()).unwrap_or_default();
    if content_type.starts_with("application/grpc-web") {
        "grpc_web"
    } else if content_type.starts_with("application/grpc") {
        "grpc"
    } else {
        "http"
    }
}

fn make_relay_span<B>(request: &Request<B>) -> Span {
    let request_id = CorrelationId::from_request(request);
    tracing::info_span!(
        "relay",
        request_id = %request_id.as_ref().map_or("-", CorrelationId::as_str),
        protocol = relay_protocol(request),
        method = %request.method(),
        path = %request.uri().path(),
    )
}

/// Trace layer that opens one span per request carrying its correlation id and protocol.
/// Must run inside the set-request-id layer.
pub fn relay_trace_layer(
) -> TraceLayer<SharedClassifier<ServerErrorsAsFailures>, fn(&Request<axum::body::Body>) -> Span> {
    TraceLayer::new_for_http()
        .make_span_with(make_relay_span::<axum::body::Body> as fn(&Request<axum::body::Body>) -> Span)
        .on_response(DefaultOnResponse::new().level(Level::DEBUG))
}
