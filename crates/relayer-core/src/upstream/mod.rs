//! Service backends.
//!
//! Each configured service maps RPC types (`json_rpc`, `rest`, `websocket`, `grpc`, ...) to a
//! backend URL. This module forwards relay payloads to those backends and tracks their health:
//!
//! - [`http_client`]: URL rewriting, header/auth application, buffered and streaming responses
//! - [`websocket`]: backend WebSocket dialing for the bridge
//! - [`health`]: per-backend probe loops with threshold-based status transitions
//!
//! A backend is identified as `{service_id}/{rpc_type}` (see [`health::backend_id`]).

pub mod errors;
pub mod health;
pub mod http_client;
pub mod websocket;

pub use errors::UpstreamError;
pub use health::{backend_id, BackendHealth, HealthChecker, HealthStatus};
pub use http_client::{
    is_streaming_content_type, rewrite_url, select_backend, tee_lines, BackendClient,
    BackendResponse,
};
pub use websocket::{connect_backend, BackendWebSocket};
