//! Relay ingress: every protocol a gateway can use to reach this relayer.
//!
//! All traffic arrives on one listener and is dispatched by shape:
//!
//! ```text
//! Request
//!    │
//!    ├── /health, /healthz, /ready ──► block height probe
//!    ├── Upgrade: websocket ─────────► WebSocket bridge
//!    ├── application/grpc-web* ──────► gRPC-Web SendRelay
//!    ├── application/grpc* ──────────► gRPC SendRelay
//!    └── anything else ──────────────► HTTP relay
//! ```
//!
//! Every path shares [`RelayProxy`]: supplier checks, backend selection, health gating,
//! validation, metering, signing, and the [`PublishQueue`] that feeds billing.

pub mod engine;
pub mod errors;
pub mod grpc;
pub mod http;
pub mod publish_queue;
pub mod websocket;

pub use engine::{AdmittedRelay, RelayProxy, SUPPLIER_ADDRESS_HEADER};
pub use errors::{error_response, ProxyError};
pub use publish_queue::{PublishQueue, PublishTask};

use axum::{
    body::{to_bytes, Body},
    extract::{ws::WebSocketUpgrade, FromRequestParts, Request, State},
    http::header,
    response::{IntoResponse, Response},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

/// Paths answered with the relayer's liveness and current block height.
pub const HEALTH_PATHS: [&str; 3] = ["/health", "/healthz", "/ready"];

/// Router that serves relays on every path.
pub fn router(proxy: Arc<RelayProxy>) -> Router {
    Router::new().fallback(dispatch).with_state(proxy)
}

async fn dispatch(State(proxy): State<Arc<RelayProxy>>, request: Request) -> Response {
    let path = request.uri().path().to_string();

    if HEALTH_PATHS.contains(&path.as_str()) {
        return Json(json!({
            "status": "healthy",
            "block_height": proxy.current_block_height(),
        }))
        .into_response();
    }

    let (mut parts, body) = request.into_parts();

    if is_websocket_upgrade(&parts.headers) {
        return match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
            Ok(upgrade) => websocket::handle_websocket(proxy, upgrade, parts.headers, &path).await,
            Err(rejection) => rejection.into_response(),
        };
    }

    let body = match read_body(&proxy, body).await {
        Ok(body) => body,
        Err(e) => return e.into_response(),
    };

    if grpc::is_grpc_request(&parts.headers) {
        debug!(path, "dispatching gRPC request");
        return grpc::handle_grpc(proxy, &path, parts.headers, body).await;
    }

    http::handle_http_relay(proxy, parts.headers, body).await
}

fn is_websocket_upgrade(headers: &axum::http::HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// Reads the body up to the default size cap.
async fn read_body(proxy: &RelayProxy, body: Body) -> Result<bytes::Bytes, ProxyError> {
    let limit = usize::try_from(proxy.config().default_max_body_size_bytes).unwrap_or(usize::MAX);
    to_bytes(body, limit).await.map_err(|e| {
        let too_large = std::error::Error::source(&e)
            .is_some_and(|s| s.is::<http_body_util::LengthLimitError>());
        let error = if too_large {
            ProxyError::BodyTooLarge
        } else {
            debug!(error = %e, "failed to read request body");
            ProxyError::InvalidRelayRequest
        };
        proxy.metrics().record_relay_rejected("unknown", &error);
        error
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chain::BlockHeightState,
        config::{BackendConfig, RelayerConfig, ServiceConfig},
        metrics::MetricsCollector,
        relay::{RelayProcessor, ResponseSigner},
        store::MemoryStore,
        transport::{PublisherConfig, StreamPublisher},
        upstream::HealthChecker,
    };
    use axum::http::{Request as HttpRequest, StatusCode};
    use http_body_util::BodyExt;
    use std::collections::HashMap;
    use tower::ServiceExt;

    fn test_proxy(max_body: u64) -> Arc<RelayProxy> {
        let mut config = RelayerConfig::default();
        config.default_max_body_size_bytes = max_body;
        let mut backends = HashMap::new();
        backends.insert(
            "rest".to_string(),
            BackendConfig { url: "http://127.0.0.1:1".to_string(), ..Default::default() },
        );
        config.services.insert("anvil".to_string(), ServiceConfig { backends, ..Default::default() });

        let metrics = Arc::new(MetricsCollector::new().unwrap());
        let signer = Arc::new(ResponseSigner::from_hex_keys(&HashMap::new()).unwrap());
        let processor = Arc::new(RelayProcessor::new(Some(Arc::clone(&signer)), Arc::clone(&metrics)));
        let publisher = Arc::new(StreamPublisher::new(
            Arc::new(MemoryStore::new()),
            PublisherConfig::default(),
            Arc::clone(&metrics),
        ));
        let queue = Arc::new(PublishQueue::new(processor, publisher, Arc::clone(&metrics)));
        let health = Arc::new(HealthChecker::new(Arc::clone(&metrics)).unwrap());
        let height = BlockHeightState::new();
        height.update(42, None);

        Arc::new(
            RelayProxy::new(Arc::new(config), signer, health, height, queue, metrics).unwrap(),
        )
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_paths_report_block_height() {
        for path in HEALTH_PATHS {
            let app = router(test_proxy(1024));
            let response = app
                .oneshot(HttpRequest::builder().uri(path).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let body = body_json(response).await;
            assert_eq!(body["status"], "healthy");
            assert_eq!(body["block_height"], 42);
        }
    }

    #[tokio::test]
    async fn test_raw_json_is_rejected() {
        let app = router(test_proxy(1024));
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"jsonrpc":"2.0","method":"eth_blockNumber","id":1}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().starts_with("invalid relay request"));
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let app = router(test_proxy(8));
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/")
                    .body(Body::from(vec![0u8; 64]))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_unknown_grpc_method_is_unimplemented() {
        let app = router(test_proxy(1024));
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/pocket.service.RelayService/Other")
                    .header(header::CONTENT_TYPE, "application/grpc")
                    .body(Body::from(grpc::encode_frame(b"")))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["grpc-status"], "12");
    }

    #[tokio::test]
    async fn test_grpc_garbage_is_invalid_argument() {
        let app = router(test_proxy(1024));
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri(grpc::SEND_RELAY_PATH)
                    .header(header::CONTENT_TYPE, "application/grpc-web+proto")
                    .body(Body::from(grpc::encode_frame(b"not a relay")))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.headers()["grpc-status"], "3");
    }
}
