//! Forwarding relay payloads to backends.
//!
//! The relay payload carries an HTTP request (method, URL, headers, body) addressed to the
//! service in the abstract. [`BackendClient`] re-targets it at the configured backend:
//!
//! - scheme and host come from the backend URL
//! - the backend URL's path is prepended to the request path
//! - the backend URL's query parameters are merged into the request's
//! - configured headers override payload headers, then Basic or Bearer auth is applied
//!
//! Redirects are returned to the caller, never followed.

use super::errors::UpstreamError;
use crate::{
    config::{BackendAuth, BackendConfig, ServiceConfig},
    types::{HttpRequestPayload, DEFAULT_RPC_TYPE},
};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use reqwest::{Client, ClientBuilder};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};
use url::Url;

/// Content types forwarded chunk-by-chunk instead of buffered.
pub const STREAMING_CONTENT_TYPES: [&str; 2] = ["text/event-stream", "application/x-ndjson"];

/// Longest line a streaming response may carry.
pub const MAX_STREAM_LINE_BYTES: usize = 256 * 1024;

/// Cap on a buffered backend response.
pub const MAX_RESPONSE_BYTES: u64 = 64 * 1024 * 1024;

/// Header naming the backend RPC type a relay targets.
pub const RPC_TYPE_HEADER: &str = "Rpc-Type";

/// Picks the backend for `rpc_type`, falling back to `rest`, then to any configured backend.
#[must_use]
pub fn select_backend<'a>(
    service: &'a ServiceConfig,
    rpc_type: &str,
) -> Option<(&'a str, &'a BackendConfig)> {
    service
        .backends
        .get_key_value(rpc_type)
        .or_else(|| service.backends.get_key_value(DEFAULT_RPC_TYPE))
        .or_else(|| {
            // Deterministic pick among the rest.
            service.backends.iter().min_by(|a, b| a.0.cmp(b.0))
        })
        .map(|(k, v)| (k.as_str(), v))
}

/// Re-targets `request_url` at `backend_url`.
///
/// # Errors
///
/// Returns [`UpstreamError::InvalidRequest`] if either URL fails to parse.
pub fn rewrite_url(backend_url: &str, request_url: &str) -> Result<Url, UpstreamError> {
    let backend = Url::parse(backend_url)
        .map_err(|e| UpstreamError::InvalidRequest(format!("failed to parse backend URL: {e}")))?;

    // Payload URLs may be absolute or just a path.
    let request_url = if request_url.is_empty() { "/" } else { request_url };
    let mut target = Url::parse(request_url)
        .or_else(|_| backend.join(request_url))
        .map_err(|e| UpstreamError::InvalidRequest(format!("failed to parse request URL: {e}")))?;

    target
        .set_scheme(backend.scheme())
        .map_err(|()| UpstreamError::InvalidRequest("incompatible backend scheme".to_string()))?;
    target
        .set_host(backend.host_str())
        .map_err(|e| UpstreamError::InvalidRequest(format!("invalid backend host: {e}")))?;
    target
        .set_port(backend.port())
        .map_err(|()| UpstreamError::InvalidRequest("invalid backend port".to_string()))?;

    let backend_path = backend.path().trim_end_matches('/');
    if !backend_path.is_empty() {
        // A bare `/` request targets the backend URL as configured.
        let path = match target.path() {
            "" | "/" => backend.path().to_string(),
            request_path => format!("{backend_path}{request_path}"),
        };
        target.set_path(&path);
    }

    let backend_query: Vec<(String, String)> =
        backend.query_pairs().map(|(k, v)| (k.into_owned(), v.into_owned())).collect();
    if !backend_query.is_empty() {
        let mut pairs: Vec<(String, String)> =
            target.query_pairs().map(|(k, v)| (k.into_owned(), v.into_owned())).collect();
        pairs.extend(backend_query);
        target.query_pairs_mut().clear().extend_pairs(pairs);
    }

    Ok(target)
}

/// Whether a response `Content-Type` indicates a streaming format. Parameters are ignored.
#[must_use]
pub fn is_streaming_content_type(content_type: &str) -> bool {
    let media_type = content_type.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
    STREAMING_CONTENT_TYPES.contains(&media_type.as_str())
}

/// Backend response, either fully read or still streaming.
#[derive(Debug)]
pub enum BackendResponse {
    Buffered { status: StatusCode, headers: HeaderMap, body: Bytes },
    Streaming { status: StatusCode, headers: HeaderMap, response: reqwest::Response },
}

impl BackendResponse {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Buffered { status, .. } | Self::Streaming { status, .. } => *status,
        }
    }
}

/// Outcome of a streamed response once the backend reaches EOF.
pub type StreamCompletion = oneshot::Receiver<Result<Vec<u8>, UpstreamError>>;

/// Splits a streaming backend response into lines for the client while accumulating it.
///
/// Each line is forwarded with a trailing `\n` as soon as it is complete. The returned
/// receiver resolves to the full body after EOF, or to an error if the backend stream failed
/// or the client went away.
pub fn tee_lines(
    response: reqwest::Response,
) -> (impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static, StreamCompletion) {
    let (line_tx, line_rx) = mpsc::channel::<Bytes>(16);
    let (done_tx, done_rx) = oneshot::channel();

    tokio::spawn(async move {
        let result = forward_lines(response, &line_tx).await;
        let _ = done_tx.send(result);
    });

    let lines = futures::stream::unfold(line_rx, |mut rx| async move {
        rx.recv().await.map(|line| (Ok(line), rx))
    });
    (lines, done_rx)
}

async fn forward_lines(
    response: reqwest::Response,
    line_tx: &mpsc::Sender<Bytes>,
) -> Result<Vec<u8>, UpstreamError> {
    let mut body = response.bytes_stream();
    let mut full = Vec::new();
    let mut pending: Vec<u8> = Vec::new();

    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(UpstreamError::from_reqwest)?;
        pending.extend_from_slice(&chunk);

        while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = pending.drain(..=pos).collect();
            emit_line(line, &mut full, line_tx).await?;
        }
        if pending.len() > MAX_STREAM_LINE_BYTES {
            return Err(UpstreamError::InvalidResponse("stream line too long".to_string()));
        }
    }

    if !pending.is_empty() {
        pending.push(b'\n');
        emit_line(pending, &mut full, line_tx).await?;
    }
    Ok(full)
}

async fn emit_line(
    line: Vec<u8>,
    full: &mut Vec<u8>,
    line_tx: &mpsc::Sender<Bytes>,
) -> Result<(), UpstreamError> {
    full.extend_from_slice(&line);
    line_tx
        .send(Bytes::from(line))
        .await
        .map_err(|_| UpstreamError::ConnectionFailed("client disconnected mid-stream".to_string()))
}

/// HTTP client for backend calls.
pub struct BackendClient {
    client: Client,
}

impl BackendClient {
    /// # Errors
    ///
    /// Returns an error if the underlying reqwest client fails to build.
    pub fn new() -> Result<Self, UpstreamError> {
        let client = ClientBuilder::new()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(20)
            .connect_timeout(Duration::from_secs(5))
            .use_rustls_tls()
            .redirect(reqwest::redirect::Policy::none())
            .tcp_nodelay(true)
            .build()
            .map_err(|e| {
                error!(error = %e, "failed to build backend http client");
                UpstreamError::ConnectionFailed(format!("HTTP client build failed: {e}"))
            })?;
        Ok(Self { client })
    }

    /// Sends the payload's request to `backend`.
    ///
    /// Non-streaming responses are read in full; streaming responses are returned unread.
    ///
    /// # Errors
    ///
    /// Returns an [`UpstreamError`] if the request cannot be built, the backend is unreachable,
    /// or the timeout elapses before the response headers (or full body) arrive.
    pub async fn forward(
        &self,
        backend: &BackendConfig,
        payload: &HttpRequestPayload,
        timeout: Duration,
    ) -> Result<BackendResponse, UpstreamError> {
        let url = rewrite_url(&backend.url, &payload.url)?;
        let method_str = if payload.method.is_empty() { "GET" } else { payload.method.as_str() };
        let method = Method::from_bytes(method_str.as_bytes())
            .map_err(|e| UpstreamError::InvalidRequest(format!("invalid method: {e}")))?;

        let headers = build_headers(payload, backend)?;
        debug!(method = %method, url = %url, body_size = payload.body.len(), "forwarding relay to backend");

        let send = self
            .client
            .request(method, url)
            .headers(headers)
            .body(payload.body.clone())
            .send();

        let response = tokio::time::timeout(timeout, send)
            .await
            .map_err(|_| UpstreamError::Timeout)?
            .map_err(UpstreamError::from_reqwest)?;

        let status = response.status();
        let headers = response.headers().clone();
        let streaming = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(is_streaming_content_type);

        if streaming {
            return Ok(BackendResponse::Streaming { status, headers, response });
        }

        let body = read_capped(response, MAX_RESPONSE_BYTES, timeout).await?;
        Ok(BackendResponse::Buffered { status, headers, body })
    }

    /// Like [`forward`](Self::forward) but always reads the full body, streaming or not.
    ///
    /// # Errors
    ///
    /// Same as [`forward`](Self::forward).
    pub async fn forward_buffered(
        &self,
        backend: &BackendConfig,
        payload: &HttpRequestPayload,
        timeout: Duration,
    ) -> Result<(StatusCode, HeaderMap, Bytes), UpstreamError> {
        match self.forward(backend, payload, timeout).await? {
            BackendResponse::Buffered { status, headers, body } => Ok((status, headers, body)),
            BackendResponse::Streaming { status, headers, response } => {
                let body = read_capped(response, MAX_RESPONSE_BYTES, timeout).await?;
                Ok((status, headers, body))
            }
        }
    }
}

/// Reads a whole response body, failing once it exceeds `limit` bytes whether or not the
/// backend declared a `Content-Length`.
async fn read_capped(
    mut response: reqwest::Response,
    limit: u64,
    timeout: Duration,
) -> Result<Bytes, UpstreamError> {
    if let Some(len) = response.content_length() {
        if len > limit {
            return Err(UpstreamError::ResponseTooLarge(len));
        }
    }

    let read = async {
        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| UpstreamError::InvalidResponse(format!("failed to read response: {e}")))?
        {
            let total = (body.len() + chunk.len()) as u64;
            if total > limit {
                return Err(UpstreamError::ResponseTooLarge(total));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(Bytes::from(body))
    };
    tokio::time::timeout(timeout, read).await.map_err(|_| UpstreamError::Timeout)?
}

/// `Authorization` value for a backend: Basic when both username and password are set, else
/// Bearer.
pub(crate) fn authorization_value(auth: &BackendAuth) -> Option<String> {
    match (&auth.username, &auth.password, &auth.bearer_token) {
        (Some(user), Some(pass), _) if !user.is_empty() && !pass.is_empty() => {
            use base64::Engine as _;
            let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
            Some(format!("Basic {encoded}"))
        }
        (_, _, Some(token)) if !token.is_empty() => Some(format!("Bearer {token}")),
        _ => None,
    }
}

fn build_headers(
    payload: &HttpRequestPayload,
    backend: &BackendConfig,
) -> Result<HeaderMap, UpstreamError> {
    let mut headers = HeaderMap::new();
    for (name, values) in &payload.headers {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        // Hop-by-hop and length headers are recomputed by the client.
        if name == header::HOST || name == header::CONTENT_LENGTH || name == header::CONNECTION {
            continue;
        }
        for value in values {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.append(name.clone(), value);
            }
        }
    }

    for (name, value) in &backend.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| UpstreamError::InvalidRequest(format!("invalid configured header: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| UpstreamError::InvalidRequest(format!("invalid configured header: {e}")))?;
        headers.insert(name, value);
    }

    if let Some(credential) = backend.authentication.as_ref().and_then(authorization_value) {
        let value = HeaderValue::from_str(&credential)
            .map_err(|e| UpstreamError::InvalidRequest(format!("invalid credentials: {e}")))?;
        headers.insert(header::AUTHORIZATION, value);
    }

    Ok(headers)
}
