use thiserror::Error;

/// Errors from calls to a service's backend.
///
/// A non-2xx status from the backend is not an error; it is proxied back to the caller.
#[derive(Error, Debug)]
pub enum UpstreamError {
    /// No backend is configured for the service (for any RPC type).
    #[error("no backend configured for service {0}")]
    NoBackend(String),

    /// Request exceeded the service's timeout.
    #[error("Request timeout")]
    Timeout,

    /// Failed to establish a connection to the backend.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Network-level error from the underlying HTTP client.
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The relay payload could not be turned into a backend request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The backend response could not be read.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Backend response exceeded the buffering limit.
    #[error("Response too large: {0} bytes")]
    ResponseTooLarge(u64),

    #[error("WebSocket error: {0}")]
    WebSocket(String),
}

impl UpstreamError {
    /// Classifies a `reqwest` failure, keeping timeouts and connect errors distinct.
    #[must_use]
    pub fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_connect() {
            Self::ConnectionFailed(e.to_string())
        } else {
            Self::Network(e)
        }
    }

    /// Returns `true` if the backend itself is likely at fault.
    ///
    /// Used by the health checker; request-shaped errors do not count against a backend.
    #[must_use]
    pub fn is_backend_fault(&self) -> bool {
        matches!(
            self,
            Self::Timeout |
                Self::ConnectionFailed(_) |
                Self::Network(_) |
                Self::InvalidResponse(_) |
                Self::WebSocket(_)
        )
    }
}
