//! Chain collaborators.
//!
//! The relayer never implements chain logic itself; it reads a handful of facts through
//! narrow query traits:
//!
//! ```text
//! ┌──────────────────────┐   get_params            ┌─────────────────┐
//! │ SharedParamCache     │────────────────────────►│ SharedQueryClient│
//! ├──────────────────────┤   get_session/params    ├─────────────────┤
//! │ SessionCache         │────────────────────────►│SessionQueryClient│
//! ├──────────────────────┤   get_application       ├─────────────────┤
//! │ RelayMeter           │────────────────────────►│ ApplicationQuery │
//! ├──────────────────────┤   get_public_key        ├─────────────────┤
//! │ RingVerifier         │────────────────────────►│ AccountQuery     │
//! ├──────────────────────┤   latest_block          ├─────────────────┤
//! │ BlockWatcher         │────────────────────────►│ BlockQueryClient │
//! ├──────────────────────┤   difficulty/CUs        ├─────────────────┤
//! │ Difficulty provider  │────────────────────────►│ ServiceQuery     │
//! └──────────────────────┘                         └─────────────────┘
//! ```
//!
//! [`RestChainClient`] implements every trait against a node's REST gateway. Tests supply
//! in-memory doubles.
//!
//! [`BlockHeightState`] is the process-local view of the latest observed height, shared by
//! the block subscriber, the proxy (arrival height pinning) and the relay meter.

pub mod rest;
pub mod state;

pub use rest::RestChainClient;
pub use state::BlockHeightState;

use crate::types::{Application, BlockInfo, RelayMiningDifficulty, Session, SessionParams, SharedParams};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ChainError {
    #[error("chain query failed: {0}")]
    Query(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid chain response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait SharedQueryClient: Send + Sync {
    async fn get_params(&self) -> Result<SharedParams, ChainError>;
}

#[async_trait]
pub trait SessionQueryClient: Send + Sync {
    async fn get_session(
        &self,
        app_address: &str,
        service_id: &str,
        height: u64,
    ) -> Result<Session, ChainError>;

    async fn get_params(&self) -> Result<SessionParams, ChainError>;
}

#[async_trait]
pub trait ApplicationQueryClient: Send + Sync {
    async fn get_application(&self, address: &str) -> Result<Application, ChainError>;
}

#[async_trait]
pub trait AccountQueryClient: Send + Sync {
    /// SEC1-encoded secp256k1 public key of an account.
    async fn get_public_key(&self, address: &str) -> Result<Vec<u8>, ChainError>;
}

#[async_trait]
pub trait BlockQueryClient: Send + Sync {
    async fn latest_block(&self) -> Result<BlockInfo, ChainError>;
}

#[async_trait]
pub trait ServiceQueryClient: Send + Sync {
    async fn get_relay_mining_difficulty(
        &self,
        service_id: &str,
    ) -> Result<RelayMiningDifficulty, ChainError>;

    async fn get_compute_units_per_relay(&self, service_id: &str) -> Result<u64, ChainError>;
}
