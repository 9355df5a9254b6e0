use crate::upstream::errors::UpstreamError;
use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};

/// Relay rejections and failures, as reported to the caller.
///
/// Every variant renders as `{"error": "<message>"}` with the status from
/// [`status_code`](Self::status_code).
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("request body too large")]
    BodyTooLarge,

    #[error("request body too large for service")]
    ServiceBodyTooLarge,

    #[error("invalid relay request: body must be a valid RelayRequest protobuf")]
    InvalidRelayRequest,

    #[error("missing service ID in relay request")]
    MissingServiceId,

    #[error("unknown service: {0}")]
    UnknownService(String),

    #[error("supplier {0} not registered with any miner")]
    SupplierNotRegistered(String),

    #[error("supplier {supplier} is {status}")]
    SupplierInactive { supplier: String, status: String },

    #[error("supplier {0} has no services registered")]
    SupplierNoServices(String),

    #[error("supplier {supplier} not staked for service {service_id} (staked for: [{}])", .staked.join(" "))]
    SupplierWrongService { supplier: String, service_id: String, staked: Vec<String> },

    #[error("backend unhealthy")]
    BackendUnhealthy,

    /// Eager validation rejected the relay; carries the validator's message.
    #[error("{0}")]
    ValidationFailed(String),

    #[error("relay exceeds application stake allowance")]
    OverServiced,

    /// The backend call failed before any response bytes were sent.
    #[error("backend error")]
    Backend(#[source] UpstreamError),

    #[error("failed to sign response")]
    Signing(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BodyTooLarge | Self::ServiceBodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::InvalidRelayRequest | Self::MissingServiceId => StatusCode::BAD_REQUEST,
            Self::UnknownService(_) => StatusCode::NOT_FOUND,
            Self::SupplierNotRegistered(_) |
            Self::SupplierInactive { .. } |
            Self::SupplierNoServices(_) |
            Self::SupplierWrongService { .. } |
            Self::BackendUnhealthy => StatusCode::SERVICE_UNAVAILABLE,
            Self::ValidationFailed(_) => StatusCode::FORBIDDEN,
            Self::OverServiced => StatusCode::TOO_MANY_REQUESTS,
            Self::Backend(_) => StatusCode::BAD_GATEWAY,
            Self::Signing(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// `{"error": message}` with `Content-Type: application/json`.
#[must_use]
pub fn error_response(status: StatusCode, message: &str) -> Response {
    let body = serde_json::json!({ "error": message }).to_string();
    (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        error_response(self.status_code(), &self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[test]
    fn test_messages() {
        assert_eq!(
            ProxyError::SupplierWrongService {
                supplier: "pokt1s".into(),
                service_id: "anvil".into(),
                staked: vec!["eth".into(), "sol".into()],
            }
            .to_string(),
            "supplier pokt1s not staked for service anvil (staked for: [eth sol])"
        );
        assert_eq!(
            ProxyError::SupplierInactive { supplier: "pokt1s".into(), status: "unstaking".into() }
                .to_string(),
            "supplier pokt1s is unstaking"
        );
        assert_eq!(ProxyError::Backend(UpstreamError::Timeout).to_string(), "backend error");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(ProxyError::BodyTooLarge.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(ProxyError::InvalidRelayRequest.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ProxyError::UnknownService("x".into()).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ProxyError::BackendUnhealthy.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ProxyError::ValidationFailed("bad".into()).status_code(), StatusCode::FORBIDDEN);
        assert_eq!(ProxyError::OverServiced.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            ProxyError::Backend(UpstreamError::Timeout).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyError::Signing("no key".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_json_body() {
        let response = ProxyError::MissingServiceId.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "missing service ID in relay request");
    }
}
