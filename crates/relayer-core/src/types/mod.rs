//! Core type definitions shared across the relayer.
//!
//! # Type Categories
//!
//! ## Relay Wire Envelope
//! - [`RelayRequest`], [`RelayResponse`], [`Relay`]: signed request/response envelopes
//! - [`HttpRequestPayload`], [`HttpResponsePayload`]: HTTP semantics carried inside the payload
//! - [`WireMessage`]: compact binary codec shared by every envelope type
//!
//! ## Chain Facts
//! - [`SharedParams`], [`SessionParams`]: protocol parameters and session geometry helpers
//! - [`Session`], [`Application`], [`RelayMiningDifficulty`]: query results cached by the
//!   cache layer and consumed by validation and metering
//!
//! Chain facts are serialized as JSON when stored in the shared cache so that any
//! instance (or operator tooling) can read them back.

mod chain;
mod relay;

pub use chain::{
    session_end_height, session_start_height, Application, BlockInfo, RelayMiningDifficulty,
    Session, SessionParams, SharedParams,
};
pub use relay::{
    HttpRequestPayload, HttpResponsePayload, Relay, RelayHash, RelayMinerError, RelayRequest,
    RelayRequestMetadata, RelayResponse, RelayResponseMetadata, SessionHeader, WireError,
    WireMessage, MAX_WIRE_MESSAGE_BYTES,
};

/// Backend RPC type used when a relay does not declare one.
pub const DEFAULT_RPC_TYPE: &str = "rest";

/// Well-known backend RPC types.
pub mod rpc_type {
    pub const JSON_RPC: &str = "json_rpc";
    pub const REST: &str = "rest";
    pub const WEBSOCKET: &str = "websocket";
    pub const GRPC: &str = "grpc";
    pub const COMET_BFT: &str = "comet_bft";
}
