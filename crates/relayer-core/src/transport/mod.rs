//! Reliable hand-off of mined relays from relayer instances to the consumer pool.
//!
//! Each supplier has its own stream, `{stream_prefix}:{supplier_operator_address}`. Relayers
//! append JSON-encoded [`MinedRelayMessage`]s under the `data` field; consumers read through a
//! consumer group, acknowledge what they processed and periodically reclaim entries left
//! pending by consumers that died mid-batch. Delivery is at-least-once; deduplication by relay
//! hash happens downstream.

pub mod consumer;
pub mod publisher;

pub use consumer::{ConsumerConfig, StreamConsumer};
pub use publisher::{PublisherConfig, StreamPublisher};

use crate::store::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stream field carrying the encoded message.
pub const DATA_FIELD: &str = "data";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is closed")]
    Closed,

    #[error("invalid transport configuration: {0}")]
    InvalidConfig(String),

    #[error("stream substrate error: {0}")]
    Store(#[from] StoreError),

    #[error("failed to encode message: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid stream message: {0}")]
    InvalidMessage(String),
}

/// `{prefix}:{supplier_operator_address}`
#[must_use]
pub fn stream_name(prefix: &str, supplier_operator_address: &str) -> String {
    format!("{prefix}:{supplier_operator_address}")
}

/// A billable relay, as handed to the settlement pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinedRelayMessage {
    #[serde(with = "base64_bytes")]
    pub relay_hash: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub relay_bytes: Vec<u8>,
    pub compute_units_per_relay: u64,
    pub session_id: String,
    pub session_start_height: u64,
    pub session_end_height: u64,
    pub supplier_operator_address: String,
    pub service_id: String,
    pub application_address: String,
    pub arrival_block_height: u64,
    #[serde(default)]
    pub published_at_unix_nano: i64,
}

impl MinedRelayMessage {
    #[must_use]
    pub fn published_at(&self) -> Option<DateTime<Utc>> {
        (self.published_at_unix_nano > 0).then(|| Utc.timestamp_nanos(self.published_at_unix_nano))
    }

    #[must_use]
    pub fn relay_hash_hex(&self) -> String {
        hex::encode(&self.relay_hash)
    }
}

/// A delivered message and the substrate ID used to acknowledge it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    pub id: String,
    pub message: MinedRelayMessage,
}

/// Sink for mined relays.
#[async_trait]
pub trait MinedRelayPublisher: Send + Sync {
    /// Appends one message and returns its stream ID.
    async fn publish(&self, message: MinedRelayMessage) -> Result<String, TransportError>;

    /// Appends all messages in one round trip, returning IDs in input order.
    async fn publish_batch(
        &self,
        messages: Vec<MinedRelayMessage>,
    ) -> Result<Vec<String>, TransportError>;
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
