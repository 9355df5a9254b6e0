//! # Relayer Core
//!
//! Core library for the high-availability relayer: the supplier-side service that receives
//! signed relay requests from gateways, forwards them to backend blockchain nodes, signs the
//! responses and hands billable relays to the settlement pipeline.
//!
//! - **[`proxy`]**: relay ingress over HTTP (including streamed responses), WebSocket and
//!   gRPC/gRPC-Web, sharing one admission pipeline.
//!
//! - **[`relay`]**: request validation, the async session validation pool, per-session stake
//!   metering, response signing and relay mining.
//!
//! - **[`cache`]**: fleet-wide caches for shared parameters, sessions and supplier state
//!   (local map, shared store, chain), plus block height fan-out.
//!
//! - **[`transport`]**: per-supplier streams carrying mined relays to consumers.
//!
//! - **[`upstream`]**: backend HTTP and WebSocket clients and backend health checks.
//!
//! - **[`store`]**: the shared key-value, pub/sub and stream substrate (Redis or in-process).
//!
//! - **[`chain`]**: chain query traits and the REST client that implements them.
//!
//! - **[`metrics`]**: Prometheus metrics collection.
//!
//! - **[`runtime`]**: component wiring and lifecycle.
//!
//! ## Relay Flow
//!
//! ```text
//! Gateway
//!    │ RelayRequest
//!    ▼
//! ┌──────────────┐   supplier / service / backend health / eager validation / meter
//! │  RelayProxy  │ ─── rejected ──► HTTP status + {"error": ...}
//! └──────┬───────┘
//!        │ admitted
//!        ▼
//! ┌──────────────┐
//! │   Backend    │ ─── failed ──► 502, meter charge returned
//! └──────┬───────┘
//!        │
//!        ▼
//! ┌──────────────┐
//! │   Signer     │ ──► signed RelayResponse (or raw stream) to gateway
//! └──────┬───────┘
//!        │ (optimistic services validate here)
//!        ▼
//! ┌──────────────┐     ┌────────────────┐     ┌──────────────────┐
//! │ PublishQueue │ ──► │ RelayProcessor │ ──► │ supplier stream  │
//! └──────────────┘     │ (difficulty)   │     └──────────────────┘
//!                      └────────────────┘
//! ```

pub mod cache;
pub mod chain;
pub mod config;
pub mod metrics;
pub mod proxy;
pub mod relay;
pub mod runtime;
pub mod store;
pub mod transport;
pub mod types;
pub mod upstream;
