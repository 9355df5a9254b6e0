//! Integration tests for the HA relayer.
//!
//! Every test runs a fully wired [`relayer_core::runtime::RelayerRuntime`] in-process, on the
//! in-memory substrate and a mock chain, with mockito or a local WebSocket server standing in
//! for service backends:
//!
//! - `relay_flow_tests`: HTTP relay admission, validation modes, metering and billing
//! - `grpc_tests`: `SendRelay` over native gRPC and binary gRPC-Web
//! - `websocket_tests`: the gateway to backend WebSocket bridge
//! - `transport_tests`: mined relay hand-off through per-supplier streams
//! - `cache_tests`: cross-instance cache sharing and single-flight population
//! - `health_tests`: backend health thresholds gating relays
//! - `runtime_tests`: background task wiring, block height following and shutdown
//! - `mock_infrastructure`: reusable chain, backend and relayer harnesses
//!
//! ```bash
//! cargo test --package tests
//! ```

#[cfg(test)]
mod relay_flow_tests;

#[cfg(test)]
mod grpc_tests;

#[cfg(test)]
mod websocket_tests;

#[cfg(test)]
mod transport_tests;

#[cfg(test)]
mod cache_tests;

#[cfg(test)]
mod health_tests;
#[cfg(test)]
mod runtime_tests;

/// Mock infrastructure for testing
pub mod mock_infrastructure;
