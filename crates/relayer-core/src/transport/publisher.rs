use super::{stream_name, MinedRelayMessage, MinedRelayPublisher, TransportError, DATA_FIELD};
use crate::{
    metrics::MetricsCollector,
    store::{StreamAppend, StreamStore, StreamTrim},
};
use async_trait::async_trait;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub stream_prefix: String,
    /// Stream length cap; 0 disables trimming.
    pub max_len: u64,
    /// Trim with `MAXLEN ~` instead of an exact cap.
    pub approx_max_len: bool,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self { stream_prefix: "ha:relays".to_string(), max_len: 100_000, approx_max_len: true }
    }
}

impl PublisherConfig {
    fn trim(&self) -> Option<StreamTrim> {
        match (self.max_len, self.approx_max_len) {
            (0, _) => None,
            (n, true) => Some(StreamTrim::Approx(n)),
            (n, false) => Some(StreamTrim::Exact(n)),
        }
    }
}

/// Appends mined relays to per-supplier streams.
pub struct StreamPublisher {
    store: Arc<dyn StreamStore>,
    config: PublisherConfig,
    metrics: Arc<MetricsCollector>,
    closed: AtomicBool,
}

impl StreamPublisher {
    pub fn new(
        store: Arc<dyn StreamStore>,
        config: PublisherConfig,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self { store, config, metrics, closed: AtomicBool::new(false) }
    }

    fn encode(&self, mut message: MinedRelayMessage) -> Result<StreamAppend, TransportError> {
        if message.supplier_operator_address.is_empty() {
            return Err(TransportError::InvalidMessage(
                "supplier_operator_address is required".to_string(),
            ));
        }
        if message.published_at_unix_nano == 0 {
            message.published_at_unix_nano =
                chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        }

        Ok(StreamAppend {
            stream: stream_name(&self.config.stream_prefix, &message.supplier_operator_address),
            fields: vec![(DATA_FIELD.to_string(), serde_json::to_string(&message)?)],
        })
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!("stream publisher closed");
        }
    }
}

#[async_trait]
impl MinedRelayPublisher for StreamPublisher {
    async fn publish(&self, message: MinedRelayMessage) -> Result<String, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        let service_id = message.service_id.clone();
        let entry = self.encode(message)?;
        let id = self.store.xadd(&entry.stream, &entry.fields, self.config.trim()).await?;

        self.metrics.record_relay_published(&service_id);
        debug!(stream = %entry.stream, id, "published mined relay");
        Ok(id)
    }

    async fn publish_batch(
        &self,
        messages: Vec<MinedRelayMessage>,
    ) -> Result<Vec<String>, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if messages.is_empty() {
            return Ok(Vec::new());
        }

        let service_ids: Vec<String> = messages.iter().map(|m| m.service_id.clone()).collect();
        let entries = messages
            .into_iter()
            .map(|m| self.encode(m))
            .collect::<Result<Vec<_>, _>>()?;

        let ids = self.store.xadd_batch(&entries, self.config.trim()).await?;
        for service_id in &service_ids {
            self.metrics.record_relay_published(service_id);
        }

        debug!(count = ids.len(), "published mined relay batch");
        Ok(ids)
    }
}
