//! HTTP relays: one encoded relay request in, one signed relay response (or a raw stream) out.

use super::{engine::RelayProxy, errors::ProxyError};
use crate::{
    relay::signer::header_map_to_payload,
    types::{HttpResponsePayload, WireMessage},
    upstream::{tee_lines, BackendResponse},
};
use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, error, warn};

pub const RELAY_RESPONSE_CONTENT_TYPE: &str = "application/x-protobuf";

/// Serves one HTTP relay end to end.
pub async fn handle_http_relay(proxy: Arc<RelayProxy>, headers: HeaderMap, body: Bytes) -> Response {
    match serve(&proxy, &headers, body).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn serve(
    proxy: &Arc<RelayProxy>,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, ProxyError> {
    let relay = proxy.admit(headers, body, "http").await?;
    let timeout = proxy.config().service_timeout(&relay.service_id);

    let backend_response = match proxy.client().forward(&relay.backend, &relay.payload, timeout).await
    {
        Ok(response) => response,
        Err(e) => return Err(proxy.backend_failed(&relay, e).await),
    };

    match backend_response {
        BackendResponse::Buffered { status, headers, body } => {
            let signed = proxy.signer().build_and_sign_relay_response_from_body(
                &relay.request,
                &body,
                &headers,
                status.as_u16(),
            );
            let (response, encoded) = match signed {
                Ok(signed) => signed,
                Err(e) => {
                    error!(service_id = %relay.service_id, error = %e, "failed to sign relay response");
                    proxy.release(&relay).await;
                    let e = ProxyError::Signing(e.to_string());
                    proxy.metrics().record_relay_rejected(&relay.service_id, &e);
                    return Err(e);
                }
            };
            debug!(service_id = %relay.service_id, response_size = encoded.len(), "sent signed relay response");

            proxy.complete(relay, response.payload);
            Ok((
                StatusCode::OK,
                [(header::CONTENT_TYPE, RELAY_RESPONSE_CONTENT_TYPE)],
                encoded,
            )
                .into_response())
        }
        BackendResponse::Streaming { status, headers, response } => {
            proxy.metrics().record_streaming_response(&relay.service_id);

            let (lines, done) = tee_lines(response);
            let mut client_response = Response::new(Body::from_stream(lines));
            *client_response.status_mut() = status;
            for (name, value) in &headers {
                if name != header::CONTENT_LENGTH && name != header::TRANSFER_ENCODING {
                    client_response.headers_mut().append(name.clone(), value.clone());
                }
            }
            client_response.headers_mut().insert(header::CONNECTION, HeaderValue::from_static("close"));

            let proxy = Arc::clone(proxy);
            tokio::spawn(async move {
                match done.await {
                    Ok(Ok(full_body)) => {
                        let payload = HttpResponsePayload {
                            status_code: u32::from(status.as_u16()),
                            headers: header_map_to_payload(&headers),
                            body: full_body,
                        };
                        match payload.encode() {
                            Ok(encoded) => proxy.complete(relay, encoded),
                            Err(e) => {
                                warn!(service_id = %relay.service_id, error = %e, "failed to encode streamed response");
                                proxy.release(&relay).await;
                            }
                        }
                    }
                    Ok(Err(e)) => {
                        warn!(service_id = %relay.service_id, error = %e, "streaming relay aborted, not billed");
                        proxy.metrics().record_backend_error(&relay.service_id, &e);
                        proxy.release(&relay).await;
                    }
                    Err(_) => proxy.release(&relay).await,
                }
            });

            Ok(client_response)
        }
    }
}
