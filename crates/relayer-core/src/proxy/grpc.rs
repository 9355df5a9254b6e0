//! gRPC and binary gRPC-Web ingress for the relay service.
//!
//! Only `/pocket.service.RelayService/SendRelay` is served. Messages use the standard
//! length-prefixed framing: one flag byte (compression, unsupported here) and a big-endian
//! `u32` length. Native gRPC carries the status in HTTP/2 trailers; gRPC-Web appends it to the
//! body as a trailer frame.

use super::{engine::RelayProxy, errors::ProxyError};
use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::Response,
};
use bytes::{BufMut, Bytes, BytesMut};
use http_body::Frame;
use http_body_util::StreamBody;
use std::{convert::Infallible, sync::Arc};
use tracing::{debug, error, warn};

pub const SEND_RELAY_PATH: &str = "/pocket.service.RelayService/SendRelay";

const FRAME_HEADER_LEN: usize = 5;
const TRAILER_FRAME_FLAG: u8 = 0x80;

/// gRPC status codes used by the relay service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrpcCode {
    Ok = 0,
    InvalidArgument = 3,
    NotFound = 5,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
}

impl GrpcCode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::InvalidArgument => "invalid_argument",
            Self::NotFound => "not_found",
            Self::PermissionDenied => "permission_denied",
            Self::ResourceExhausted => "resource_exhausted",
            Self::FailedPrecondition => "failed_precondition",
            Self::Unimplemented => "unimplemented",
            Self::Internal => "internal",
            Self::Unavailable => "unavailable",
        }
    }
}

impl From<&ProxyError> for GrpcCode {
    fn from(error: &ProxyError) -> Self {
        match error {
            ProxyError::InvalidRelayRequest | ProxyError::MissingServiceId => Self::InvalidArgument,
            ProxyError::UnknownService(_) => Self::NotFound,
            ProxyError::ValidationFailed(_) => Self::PermissionDenied,
            ProxyError::BodyTooLarge | ProxyError::ServiceBodyTooLarge | ProxyError::OverServiced => {
                Self::ResourceExhausted
            }
            ProxyError::SupplierNotRegistered(_) |
            ProxyError::SupplierInactive { .. } |
            ProxyError::SupplierNoServices(_) |
            ProxyError::SupplierWrongService { .. } |
            ProxyError::BackendUnhealthy |
            ProxyError::Backend(_) => Self::Unavailable,
            ProxyError::Signing(_) | ProxyError::Internal(_) => Self::Internal,
        }
    }
}

/// Whether `headers` carry a gRPC or gRPC-Web content type.
#[must_use]
pub fn is_grpc_request(headers: &HeaderMap) -> bool {
    content_type(headers).starts_with("application/grpc")
}

#[must_use]
pub fn is_grpc_web_request(headers: &HeaderMap) -> bool {
    content_type(headers).starts_with("application/grpc-web")
}

fn content_type(headers: &HeaderMap) -> &str {
    headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()).unwrap_or_default()
}

/// Prefixes `message` with an uncompressed data frame header.
#[must_use]
pub fn encode_frame(message: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + message.len());
    buf.put_u8(0);
    buf.put_u32(u32::try_from(message.len()).unwrap_or(u32::MAX));
    buf.put_slice(message);
    buf.freeze()
}

/// Extracts the single message from a framed request body.
///
/// # Errors
///
/// Returns a status and message for truncated, compressed or multi-message bodies.
pub fn decode_frame(body: &[u8]) -> Result<&[u8], (GrpcCode, String)> {
    if body.len() < FRAME_HEADER_LEN {
        return Err((GrpcCode::InvalidArgument, "truncated gRPC frame".to_string()));
    }
    if body[0] != 0 {
        return Err((GrpcCode::Unimplemented, "compressed gRPC messages are not supported".to_string()));
    }
    let len = u32::from_be_bytes([body[1], body[2], body[3], body[4]]) as usize;
    let message = &body[FRAME_HEADER_LEN..];
    if message.len() != len {
        return Err((
            GrpcCode::InvalidArgument,
            format!("gRPC frame length mismatch: header says {len}, got {}", message.len()),
        ));
    }
    Ok(message)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flavor {
    Native,
    Web,
}

/// Serves one gRPC (or gRPC-Web) call.
pub async fn handle_grpc(
    proxy: Arc<RelayProxy>,
    path: &str,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let flavor = if is_grpc_web_request(&headers) { Flavor::Web } else { Flavor::Native };
    let metrics = Arc::clone(proxy.metrics());

    if content_type(&headers).starts_with("application/grpc-web-text") {
        metrics.record_grpc_request(path, GrpcCode::Unimplemented.as_str());
        return status_response(flavor, GrpcCode::Unimplemented, "grpc-web-text is not supported");
    }
    if path != SEND_RELAY_PATH {
        metrics.record_grpc_request(path, GrpcCode::Unimplemented.as_str());
        return status_response(flavor, GrpcCode::Unimplemented, &format!("unknown method {path}"));
    }

    let (code, response) = send_relay(&proxy, flavor, &headers, &body).await;
    metrics.record_grpc_request(path, code.as_str());
    response
}

async fn send_relay(
    proxy: &Arc<RelayProxy>,
    flavor: Flavor,
    headers: &HeaderMap,
    body: &[u8],
) -> (GrpcCode, Response) {
    let message = match decode_frame(body) {
        Ok(message) => Bytes::copy_from_slice(message),
        Err((code, msg)) => return (code, status_response(flavor, code, &msg)),
    };

    let protocol = match flavor {
        Flavor::Native => "grpc",
        Flavor::Web => "grpc_web",
    };
    let relay = match proxy.admit(headers, message, protocol).await {
        Ok(relay) => relay,
        Err(e) => {
            let code = GrpcCode::from(&e);
            return (code, status_response(flavor, code, &e.to_string()));
        }
    };

    let supplier = relay.request.meta.supplier_operator_address.clone();
    if supplier.is_empty() {
        proxy.release(&relay).await;
        let msg = "missing supplier operator address";
        return (GrpcCode::InvalidArgument, status_response(flavor, GrpcCode::InvalidArgument, msg));
    }
    if !proxy.signer().has_signer(&supplier) {
        proxy.release(&relay).await;
        let msg = format!("no signer for supplier {supplier}");
        return (GrpcCode::FailedPrecondition, status_response(flavor, GrpcCode::FailedPrecondition, &msg));
    }

    let timeout = proxy.config().service_timeout(&relay.service_id);
    let signed = match proxy.client().forward_buffered(&relay.backend, &relay.payload, timeout).await {
        Ok((status, response_headers, response_body)) => proxy
            .signer()
            .build_and_sign_relay_response_from_body(
                &relay.request,
                &response_body,
                &response_headers,
                status.as_u16(),
            ),
        Err(e) => {
            warn!(service_id = %relay.service_id, error = %e, "backend failed for gRPC relay, returning signed error");
            proxy.metrics().record_backend_error(&relay.service_id, &e);
            match relay.request.session_header() {
                Some(session_header) => proxy.signer().build_error_relay_response(
                    session_header,
                    &supplier,
                    500,
                    &format!("backend error: {e}"),
                ),
                None => {
                    let msg = "missing session header in RelayRequest";
                    return (GrpcCode::InvalidArgument, status_response(flavor, GrpcCode::InvalidArgument, msg));
                }
            }
        }
    };

    let (response, encoded) = match signed {
        Ok(signed) => signed,
        Err(e) => {
            error!(service_id = %relay.service_id, error = %e, "failed to build/sign gRPC relay response");
            proxy.release(&relay).await;
            let msg = format!("failed to build/sign response: {e}");
            return (GrpcCode::Internal, status_response(flavor, GrpcCode::Internal, &msg));
        }
    };

    debug!(service_id = %relay.service_id, response_size = encoded.len(), "gRPC relay completed");
    proxy.complete(relay, response.payload);
    (GrpcCode::Ok, message_response(flavor, &encoded))
}

fn response_content_type(flavor: Flavor) -> HeaderValue {
    match flavor {
        Flavor::Native => HeaderValue::from_static("application/grpc"),
        Flavor::Web => HeaderValue::from_static("application/grpc-web+proto"),
    }
}

fn status_trailers(code: GrpcCode, message: &str) -> HeaderMap {
    let mut trailers = HeaderMap::new();
    trailers.insert("grpc-status", HeaderValue::from(code as u16));
    if let Ok(value) = HeaderValue::from_str(&percent_encode(message)) {
        trailers.insert("grpc-message", value);
    }
    trailers
}

/// gRPC messages are percent-encoded; only printable ASCII other than `%` passes through.
fn percent_encode(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    for b in message.bytes() {
        if (0x20..=0x7e).contains(&b) && b != b'%' {
            out.push(char::from(b));
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

fn encode_trailer_frame(trailers: &HeaderMap) -> Bytes {
    let mut block = Vec::new();
    for (name, value) in trailers {
        block.extend_from_slice(name.as_str().as_bytes());
        block.push(b':');
        block.extend_from_slice(value.as_bytes());
        block.extend_from_slice(b"\r\n");
    }
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + block.len());
    buf.put_u8(TRAILER_FRAME_FLAG);
    buf.put_u32(u32::try_from(block.len()).unwrap_or(u32::MAX));
    buf.put_slice(&block);
    buf.freeze()
}

/// Trailers-only response carrying a status and no message.
fn status_response(flavor: Flavor, code: GrpcCode, message: &str) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    response.headers_mut().insert(header::CONTENT_TYPE, response_content_type(flavor));
    response.headers_mut().extend(status_trailers(code, message));
    response
}

fn message_response(flavor: Flavor, message: &[u8]) -> Response {
    let data = encode_frame(message);
    let trailers = status_trailers(GrpcCode::Ok, "");

    let body = match flavor {
        Flavor::Native => {
            let frames: Vec<Result<Frame<Bytes>, Infallible>> =
                vec![Ok(Frame::data(data)), Ok(Frame::trailers(trailers))];
            Body::new(StreamBody::new(futures::stream::iter(frames)))
        }
        Flavor::Web => {
            let mut buf = BytesMut::from(&data[..]);
            buf.put_slice(&encode_trailer_frame(&trailers));
            Body::from(buf.freeze())
        }
    };

    let mut response = Response::new(body);
    response.headers_mut().insert(header::CONTENT_TYPE, response_content_type(flavor));
    response
}
