//! Shared substrate: key/value with TTLs, pub/sub channels and append-only streams with
//! consumer groups.
//!
//! Every relayer instance talks to the same substrate. The cache layer uses the KV and
//! pub/sub halves; the transport layer uses streams.
//!
//! | Trait | Operations |
//! |-------|-----------|
//! | [`KvStore`] | `get`, `set`, `set_nx`, `del`, `keys` |
//! | [`PubSub`] | `publish`, `subscribe` |
//! | [`StreamStore`] | `xadd`, `xadd_batch`, `create_group`, `read_group`, `auto_claim`, `ack`, `pending_count`, `len` |
//!
//! [`RedisStore`] is the production implementation. [`MemoryStore`] implements the same
//! semantics in-process (including pending-entry lists and idle reclaim) for tests and
//! single-instance development.

pub mod memory;
pub mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::{collections::HashMap, time::Duration};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("command failed: {0}")]
    Command(String),

    #[error("unexpected reply: {0}")]
    Reply(String),

    #[error("consumer group already exists")]
    GroupExists,

    #[error("no such stream or consumer group: {0}")]
    NoGroup(String),
}

/// Stream of pub/sub payloads for one channel. Ends when the subscription is dropped or the
/// connection is lost.
pub type Subscription = BoxStream<'static, String>;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Sets `key`, expiring after `ttl` when given.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Sets `key` only if absent. Returns `true` if the key was set.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;

    async fn del(&self, key: &str) -> Result<(), StoreError>;

    /// Keys matching a glob pattern (`*` wildcard only).
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError>;
}

#[async_trait]
pub trait PubSub: Send + Sync {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError>;

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError>;
}

/// Stream length cap applied on append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTrim {
    /// `MAXLEN ~ n`: the substrate may keep slightly more than `n` entries.
    Approx(u64),
    /// `MAXLEN = n`.
    Exact(u64),
}

/// One entry to append in a batch.
#[derive(Debug, Clone)]
pub struct StreamAppend {
    pub stream: String,
    pub fields: Vec<(String, String)>,
}

/// One entry read from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRecord {
    pub id: String,
    pub fields: HashMap<String, String>,
}

/// Result of an auto-claim scan.
#[derive(Debug, Clone, Default)]
pub struct AutoClaim {
    /// Cursor for the next scan; `0-0` when the pending list was fully scanned.
    pub next_start: String,
    pub claimed: Vec<StreamRecord>,
}

#[async_trait]
pub trait StreamStore: Send + Sync {
    /// Appends one entry and returns its ID.
    async fn xadd(
        &self,
        stream: &str,
        fields: &[(String, String)],
        trim: Option<StreamTrim>,
    ) -> Result<String, StoreError>;

    /// Appends all entries in one round trip, returning IDs in input order.
    async fn xadd_batch(
        &self,
        entries: &[StreamAppend],
        trim: Option<StreamTrim>,
    ) -> Result<Vec<String>, StoreError>;

    /// Creates `group` at `start_id`, creating the stream if needed.
    ///
    /// Returns [`StoreError::GroupExists`] if the group is already present.
    async fn create_group(&self, stream: &str, group: &str, start_id: &str)
        -> Result<(), StoreError>;

    /// Reads never-delivered entries (`>`) for `consumer`, waiting up to `block` when empty.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamRecord>, StoreError>;

    /// Transfers entries pending longer than `min_idle` to `consumer`.
    async fn auto_claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        start: &str,
        count: usize,
    ) -> Result<AutoClaim, StoreError>;

    /// Acknowledges entries; returns how many were pending.
    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, StoreError>;

    /// Number of delivered but unacknowledged entries in `group`.
    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64, StoreError>;

    async fn len(&self, stream: &str) -> Result<u64, StoreError>;
}

/// Glob match supporting `*` only, the subset used for key scans.
pub(crate) fn glob_match(pattern: &str, candidate: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == candidate;
    }

    let mut rest = candidate;
    for (i, part) in parts.iter().enumerate() {
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else if let Some(pos) = rest.find(part) {
            rest = &rest[pos + part.len()..];
        } else {
            return false;
        }
    }
    true
}
