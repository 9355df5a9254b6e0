//! WebSocket bridge between a gateway connection and a service's `websocket` backend.
//!
//! Gateway frames that decode as relay requests go through the same admission as HTTP relays
//! (supplier, health, validation, metering); an admitted relay's HTTP body is forwarded to the
//! backend and a rejected one is answered on the gateway leg. Anything else is forwarded
//! verbatim. The next backend frame after an admitted relay is signed as its response and
//! billed. Backend frames with no pending relay are passed through unsigned.

use super::{
    engine::{AdmittedRelay, RelayProxy},
    errors::ProxyError,
};
use crate::{
    types::{rpc_type, RelayRequest, WireMessage},
    upstream::{connect_backend, http_client::RPC_TYPE_HEADER, BackendWebSocket, UpstreamError},
};
use axum::{
    extract::ws::{Message as GatewayMessage, WebSocket, WebSocketUpgrade},
    http::{HeaderMap, HeaderValue},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::{sync::Arc, time::Duration};
use tokio_tungstenite::tungstenite::Message as BackendMessage;
use tracing::{debug, info, warn};

/// Interval between keep-alive pings on both legs.
pub const PING_INTERVAL: Duration = Duration::from_secs(27);

pub const SERVICE_ID_HEADER: &str = "Pocket-Service-Id";

/// Service named by `Pocket-Service-Id`, else `X-Forwarded-Host`, else the first path segment.
#[must_use]
pub fn extract_service_id(headers: &HeaderMap, path: &str) -> Option<String> {
    let header = |name: &str| {
        headers.get(name).and_then(|v| v.to_str().ok()).filter(|v| !v.is_empty()).map(str::to_string)
    };
    header(SERVICE_ID_HEADER).or_else(|| header("X-Forwarded-Host")).or_else(|| {
        path.trim_start_matches('/').split('/').next().filter(|s| !s.is_empty()).map(str::to_string)
    })
}

/// Upgrades the connection and bridges it to the service's WebSocket backend.
pub async fn handle_websocket(
    proxy: Arc<RelayProxy>,
    upgrade: WebSocketUpgrade,
    headers: HeaderMap,
    path: &str,
) -> Response {
    let Some(service_id) = extract_service_id(&headers, path) else {
        return ProxyError::MissingServiceId.into_response();
    };
    let Some(service) = proxy.config().services.get(&service_id) else {
        return ProxyError::UnknownService(service_id).into_response();
    };
    let Some(backend) = service.backends.get(rpc_type::WEBSOCKET).cloned() else {
        return proxy.backend_unavailable(&service_id, UpstreamError::NoBackend(service_id.clone())).into_response();
    };

    let timeout = proxy.config().service_timeout(&service_id);
    let backend_ws = match connect_backend(&service_id, &backend, timeout).await {
        Ok(ws) => ws,
        Err(e) => return proxy.backend_unavailable(&service_id, e).into_response(),
    };

    let mut admit_headers = headers;
    admit_headers.insert(RPC_TYPE_HEADER, HeaderValue::from_static(rpc_type::WEBSOCKET));

    upgrade.on_upgrade(move |gateway| async move {
        let bridge = Bridge { proxy, service_id, admit_headers, pending: None };
        bridge.run(gateway, backend_ws).await;
    })
}

/// Where a frame goes after the bridge has looked at it.
enum Route {
    Backend(BackendMessage),
    Gateway(GatewayMessage),
}

struct Bridge {
    proxy: Arc<RelayProxy>,
    service_id: String,
    /// Upgrade request headers, pinned to the `websocket` backend.
    admit_headers: HeaderMap,
    /// Admitted relay waiting for the backend's next frame.
    pending: Option<AdmittedRelay>,
}

impl Bridge {
    async fn run(mut self, gateway: WebSocket, backend: BackendWebSocket) {
        let metrics = Arc::clone(self.proxy.metrics());
        metrics.record_websocket_connection(&self.service_id, true);
        info!(service_id = %self.service_id, "websocket bridge started");

        let (mut gateway_tx, mut gateway_rx) = gateway.split();
        let (mut backend_tx, mut backend_rx) = backend.split();
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.tick().await;
        let mut relays = 0u64;

        loop {
            tokio::select! {
                msg = gateway_rx.next() => {
                    let Some(Ok(msg)) = msg else { break };
                    let route = match msg {
                        GatewayMessage::Text(text) => Some(self.from_gateway(Bytes::from(text.as_str().to_owned()), true).await),
                        GatewayMessage::Binary(data) => Some(self.from_gateway(data, false).await),
                        GatewayMessage::Ping(data) => Some(Route::Backend(BackendMessage::Ping(data))),
                        GatewayMessage::Pong(_) => None,
                        GatewayMessage::Close(_) => break,
                    };
                    let sent = match route {
                        Some(Route::Backend(outbound)) => backend_tx.send(outbound).await.map_err(|e| e.to_string()),
                        Some(Route::Gateway(reply)) => gateway_tx.send(reply).await.map_err(|e| e.to_string()),
                        None => Ok(()),
                    };
                    if let Err(e) = sent {
                        warn!(service_id = %self.service_id, error = %e, "failed to forward gateway frame");
                        break;
                    }
                }
                msg = backend_rx.next() => {
                    let Some(Ok(msg)) = msg else { break };
                    let outbound = match msg {
                        BackendMessage::Text(text) => Some(self.from_backend(Bytes::from(text.as_str().to_owned()), true, &mut relays).await),
                        BackendMessage::Binary(data) => Some(self.from_backend(data, false, &mut relays).await),
                        BackendMessage::Ping(data) => Some(GatewayMessage::Ping(data)),
                        BackendMessage::Close(_) => break,
                        BackendMessage::Pong(_) | BackendMessage::Frame(_) => None,
                    };
                    if let Some(outbound) = outbound {
                        if let Err(e) = gateway_tx.send(outbound).await {
                            warn!(service_id = %self.service_id, error = %e, "failed to forward to gateway");
                            break;
                        }
                    }
                }
                _ = ping.tick() => {
                    if gateway_tx.send(GatewayMessage::Ping(Bytes::new())).await.is_err() ||
                        backend_tx.send(BackendMessage::Ping(Bytes::new())).await.is_err()
                    {
                        debug!(service_id = %self.service_id, "failed to send ping");
                        break;
                    }
                }
            }
        }

        if let Some(unanswered) = self.pending.take() {
            self.proxy.release(&unanswered).await;
        }
        let _ = gateway_tx.send(GatewayMessage::Close(None)).await;
        let _ = backend_tx.send(BackendMessage::Close(None)).await;
        metrics.record_websocket_connection(&self.service_id, false);
        info!(service_id = %self.service_id, relays_emitted = relays, "websocket bridge closed");
    }

    /// Admits a relay frame and forwards its HTTP body. Rejected relays are answered on the
    /// gateway leg and never reach the backend.
    async fn from_gateway(&mut self, data: Bytes, text: bool) -> Route {
        let Ok(request) = RelayRequest::decode(&data) else {
            return Route::Backend(raw_backend_message(data, text));
        };

        if request.service_id() != self.service_id {
            let e = ProxyError::ValidationFailed(format!(
                "relay for service {} sent on a {} connection",
                request.service_id(),
                self.service_id
            ));
            self.proxy.metrics().record_relay_rejected(&self.service_id, &e);
            return Route::Gateway(self.rejection(&request, &e));
        }

        let relay = match self.proxy.admit(&self.admit_headers, data, "websocket").await {
            Ok(relay) => relay,
            Err(e) => {
                debug!(service_id = %self.service_id, error = %e, "websocket relay rejected");
                return Route::Gateway(self.rejection(&request, &e));
            }
        };

        let body = Bytes::from(relay.payload.body.clone());
        if let Some(unanswered) = self.pending.replace(relay) {
            self.proxy.release(&unanswered).await;
        }
        Route::Backend(raw_backend_message(body, true))
    }

    /// Signed error relay response when the relay names a supplier we hold a key for, else a
    /// JSON error frame.
    fn rejection(&self, request: &RelayRequest, e: &ProxyError) -> GatewayMessage {
        let supplier = request.meta.supplier_operator_address.as_str();
        let message = e.to_string();
        if let Some(header) = request.session_header().filter(|_| self.proxy.signer().has_signer(supplier)) {
            match self.proxy.signer().build_error_relay_response(
                header,
                supplier,
                u32::from(e.status_code().as_u16()),
                &message,
            ) {
                Ok((_, encoded)) => return GatewayMessage::Binary(Bytes::from(encoded)),
                Err(sign_err) => {
                    warn!(service_id = %self.service_id, error = %sign_err, "failed to sign websocket rejection");
                }
            }
        }
        GatewayMessage::Text(serde_json::json!({ "error": message }).to_string().into())
    }

    async fn from_backend(&mut self, data: Bytes, text: bool, relays: &mut u64) -> GatewayMessage {
        let Some(relay) = self.pending.take() else {
            return raw_gateway_message(data, text);
        };

        let signed = self.proxy.signer().build_and_sign_relay_response_from_body(
            &relay.request,
            &data,
            &HeaderMap::new(),
            200,
        );
        match signed {
            Ok((response, encoded)) => {
                *relays += 1;
                self.proxy.complete(relay, response.payload);
                GatewayMessage::Binary(Bytes::from(encoded))
            }
            Err(e) => {
                warn!(service_id = %self.service_id, error = %e, "failed to sign websocket response");
                self.proxy.release(&relay).await;
                raw_gateway_message(data, text)
            }
        }
    }
}

fn raw_backend_message(data: Bytes, text: bool) -> BackendMessage {
    match (text, String::from_utf8(data.to_vec())) {
        (true, Ok(s)) => BackendMessage::Text(s.into()),
        _ => BackendMessage::Binary(data),
    }
}

fn raw_gateway_message(data: Bytes, text: bool) -> GatewayMessage {
    match (text, String::from_utf8(data.to_vec())) {
        (true, Ok(s)) => GatewayMessage::Text(s.into()),
        _ => GatewayMessage::Binary(data),
    }
}
