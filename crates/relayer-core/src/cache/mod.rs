//! Multi-tier caching of on-chain facts shared by every relayer instance.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────────────────────────────────────────────────────────┐
//!  │ L1  process-local DashMap            (per instance)          │
//!  └──────────────┬───────────────────────────────────────────────┘
//!                 │ miss
//!  ┌──────────────▼───────────────────────────────────────────────┐
//!  │ L2  shared KV (JSON values, TTL)     (all instances)         │
//!  └──────────────┬───────────────────────────────────────────────┘
//!                 │ miss
//!  ┌──────────────▼───────────────────────────────────────────────┐
//!  │ L3  chain query, guarded by a SETNX population lock          │
//!  │     won  → query, write L2, release lock                     │
//!  │     lost → wait 100ms, retry L2 once, else query uncached    │
//!  └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! L1 entries carry the same TTL as their L2 copy and are swept once per block by each cache's
//! listener task.
//!
//! Invalidation clears L1 and L2 on the invalidating instance and publishes the key on a
//! pub/sub channel; every instance's subscriber drops its own L1 entry.
//!
//! | Cache | L2 key | Invalidation channel |
//! |-------|--------|----------------------|
//! | [`SharedParamCache`] | `{p}:params:shared:{h}` | `{ps}:invalidate:params` |
//! | [`SessionCache`] | `{p}:session:{app}:{svc}:{h}` | `{ps}:invalidate:session` |
//! | [`SupplierCache`] | `{supplier_prefix}:{operator}` | none, explicit lifecycle |
//! | [`BlockHeightSubscriber`] | none | `{ps}:block` (fan-out, not invalidation) |
//!
//! The lookup traits ([`SharedParamsLookup`], [`SessionLookup`], [`SupplierLookup`]) are the
//! seams the relay pipeline depends on, so tests can substitute fixed answers.

pub mod block_subscriber;
mod local;
mod read_through;
pub mod session;
pub mod shared_params;
pub mod supplier;

pub use block_subscriber::{BlockEvent, BlockHeightSubscriber, BlockHeightWatcher};
pub use session::{SessionCache, SessionValidationResult};
pub use shared_params::SharedParamCache;
pub use supplier::{SupplierCache, SupplierState};

use crate::{
    chain::ChainError,
    config::RelayerConfig,
    store::{KvStore, PubSub, StoreError},
    types::{Session, SharedParams},
};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Substrate capabilities the cache layer needs.
pub trait CacheBackend: KvStore + PubSub {}

impl<T: KvStore + PubSub + ?Sized> CacheBackend for T {}

#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("cache is closed")]
    Closed,

    #[error("cache substrate error: {0}")]
    Store(#[from] StoreError),

    #[error("chain query failed: {0}")]
    Chain(#[from] ChainError),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("{0}")]
    InvalidArgument(String),
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Key prefixes and timing shared by all caches.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub cache_prefix: String,
    pub pubsub_prefix: String,
    pub block_time: Duration,
    pub ttl_blocks: u64,
    pub extra_grace_blocks: u64,
    pub lock_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_prefix: "ha:cache".to_string(),
            pubsub_prefix: "ha:events".to_string(),
            block_time: Duration::from_secs(6),
            ttl_blocks: 1,
            extra_grace_blocks: 2,
            lock_timeout: Duration::from_secs(5),
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub fn from_relayer_config(config: &RelayerConfig) -> Self {
        Self {
            cache_prefix: config.redis.cache_prefix(),
            pubsub_prefix: config.redis.pubsub_prefix(),
            block_time: config.block_time(),
            ttl_blocks: config.cache.ttl_blocks.max(1),
            extra_grace_blocks: config.grace_period_extra_blocks,
            lock_timeout: Duration::from_secs(config.cache.lock_timeout_seconds.max(1)),
        }
    }

    #[must_use]
    pub fn block_time_secs(&self) -> u64 {
        self.block_time.as_secs().max(1)
    }

    pub(crate) fn shared_params_key(&self, height: u64) -> String {
        format!("{}:params:shared:{height}", self.cache_prefix)
    }

    pub(crate) fn shared_params_lock_key(&self, height: u64) -> String {
        format!("{}:lock:params:shared:{height}", self.cache_prefix)
    }

    pub(crate) fn session_key(&self, app: &str, service_id: &str, height: u64) -> String {
        format!("{}:session:{app}:{service_id}:{height}", self.cache_prefix)
    }

    pub(crate) fn session_lock_key(&self, app: &str, service_id: &str, height: u64) -> String {
        format!("{}:lock:session:{app}:{service_id}:{height}", self.cache_prefix)
    }

    pub(crate) fn session_validation_key(&self, app: &str, service_id: &str, height: u64) -> String {
        format!("{}:session:validation:{app}:{service_id}:{height}", self.cache_prefix)
    }

    pub(crate) fn session_rewardable_key(&self, session_id: &str) -> String {
        format!("{}:session:rewardable:{session_id}", self.cache_prefix)
    }

    pub(crate) fn block_watcher_lease_key(&self) -> String {
        format!("{}:lock:block_watcher", self.cache_prefix)
    }

    pub(crate) fn block_channel(&self) -> String {
        format!("{}:block", self.pubsub_prefix)
    }

    pub(crate) fn params_invalidation_channel(&self) -> String {
        format!("{}:invalidate:params", self.pubsub_prefix)
    }

    pub(crate) fn session_invalidation_channel(&self) -> String {
        format!("{}:invalidate:session", self.pubsub_prefix)
    }

    pub(crate) fn rewardable_channel(&self) -> String {
        format!("{}:session:rewardable", self.pubsub_prefix)
    }
}

#[async_trait]
pub trait SharedParamsLookup: Send + Sync {
    async fn get_shared_params(&self, height: u64) -> Result<SharedParams, CacheError>;
}

#[async_trait]
pub trait SessionLookup: Send + Sync {
    async fn get_session(
        &self,
        app_address: &str,
        service_id: &str,
        height: u64,
    ) -> Result<Session, CacheError>;
}

#[async_trait]
pub trait SupplierLookup: Send + Sync {
    /// `Ok(None)` when the supplier has no recorded state.
    async fn get_state(&self, operator_address: &str) -> Result<Option<SupplierState>, CacheError>;
}
