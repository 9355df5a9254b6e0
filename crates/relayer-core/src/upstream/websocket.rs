//! Backend WebSocket dialing.

use super::{errors::UpstreamError, http_client::authorization_value};
use crate::config::BackendConfig;
use http::{header, HeaderName, HeaderValue};
use std::time::Duration;
use tokio_tungstenite::{
    tungstenite::client::IntoClientRequest, MaybeTlsStream, WebSocketStream,
};
use tracing::{error, info};

pub type BackendWebSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Maps an `http(s)` backend URL onto its `ws(s)` equivalent. `ws(s)` URLs pass through.
///
/// # Errors
///
/// Returns [`UpstreamError::InvalidRequest`] for any other scheme.
pub fn backend_ws_url(backend_url: &str) -> Result<String, UpstreamError> {
    let ws_url = if let Some(rest) = backend_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = backend_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        backend_url.to_string()
    };

    if !ws_url.starts_with("ws://") && !ws_url.starts_with("wss://") {
        return Err(UpstreamError::InvalidRequest(format!(
            "Invalid WebSocket URL format: {backend_url}"
        )));
    }
    Ok(ws_url)
}

/// Opens a WebSocket to `backend`, applying its configured headers and credentials.
///
/// # Errors
///
/// Returns [`UpstreamError::Timeout`] if the handshake does not finish within `timeout`,
/// otherwise [`UpstreamError::WebSocket`] describing the failure.
pub async fn connect_backend(
    service_id: &str,
    backend: &BackendConfig,
    timeout: Duration,
) -> Result<BackendWebSocket, UpstreamError> {
    let ws_url = backend_ws_url(&backend.url)?;
    let mut request = ws_url
        .as_str()
        .into_client_request()
        .map_err(|e| UpstreamError::InvalidRequest(format!("invalid WebSocket request: {e}")))?;

    for (name, value) in &backend.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| UpstreamError::InvalidRequest(format!("invalid configured header: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| UpstreamError::InvalidRequest(format!("invalid configured header: {e}")))?;
        request.headers_mut().insert(name, value);
    }
    if let Some(credential) = backend.authentication.as_ref().and_then(authorization_value) {
        let value = HeaderValue::from_str(&credential)
            .map_err(|e| UpstreamError::InvalidRequest(format!("invalid credentials: {e}")))?;
        request.headers_mut().insert(header::AUTHORIZATION, value);
    }

    let connect = tokio_tungstenite::connect_async(request);
    match tokio::time::timeout(timeout, connect).await {
        Ok(Ok((stream, response))) => {
            info!(service_id, status = response.status().as_u16(), "backend websocket connected");
            Ok(stream)
        }
        Ok(Err(e)) => {
            error!(service_id, error = %e, "backend websocket connection failed");
            Err(UpstreamError::WebSocket(format!("WebSocket connection failed: {e}")))
        }
        Err(_) => Err(UpstreamError::Timeout),
    }
}
