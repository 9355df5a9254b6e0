//! Mock infrastructure for relayer integration tests.
//!
//! - [`MockChain`]: in-memory chain implementing every query trait, with query counters
//! - [`MockWebSocketBackend`]: echoing WebSocket backend
//! - [`TestRelayer`]: a fully wired relayer on a memory substrate, driven through its router
//!
//! HTTP backends are plain mockito servers; see [`service`] for wiring one into a config.
//!
//! ```ignore
//! let mut backend = mockito::Server::new_async().await;
//! let relayer = TestRelayer::builder()
//!     .with_service(SERVICE_ID, service("json_rpc", &backend.url(), "eager"))
//!     .build()
//!     .await;
//! let response = relayer.post(relayer.relay(SERVICE_ID, &json_rpc_payload("eth_blockNumber"))).await;
//! ```

pub mod chain_mock;
pub mod test_helpers;
pub mod websocket_mock;

pub use chain_mock::{test_shared_params, MockChain};
pub use test_helpers::*;
pub use websocket_mock::MockWebSocketBackend;
