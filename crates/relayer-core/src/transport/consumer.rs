use super::{stream_name, MinedRelayMessage, StreamMessage, TransportError, DATA_FIELD};
use crate::{
    metrics::MetricsCollector,
    store::{StoreError, StreamRecord, StreamStore},
};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

const READ_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub stream_prefix: String,
    pub supplier_operator_address: String,
    pub consumer_group: String,
    pub consumer_name: String,
    pub batch_size: usize,
    /// How long a read waits on an empty stream.
    pub block_timeout: Duration,
    /// Pending entries idle longer than this are reclaimed from their consumer.
    pub claim_idle_timeout: Duration,
}

impl ConsumerConfig {
    #[must_use]
    pub fn new(
        stream_prefix: impl Into<String>,
        supplier_operator_address: impl Into<String>,
        consumer_group: impl Into<String>,
        consumer_name: impl Into<String>,
    ) -> Self {
        Self {
            stream_prefix: stream_prefix.into(),
            supplier_operator_address: supplier_operator_address.into(),
            consumer_group: consumer_group.into(),
            consumer_name: consumer_name.into(),
            batch_size: 100,
            block_timeout: Duration::from_secs(5),
            claim_idle_timeout: Duration::from_secs(30),
        }
    }

    fn validate(&self) -> Result<(), TransportError> {
        let required = [
            (&self.stream_prefix, "stream prefix"),
            (&self.supplier_operator_address, "supplier operator address"),
            (&self.consumer_group, "consumer group"),
            (&self.consumer_name, "consumer name"),
        ];
        for (value, name) in required {
            if value.is_empty() {
                return Err(TransportError::InvalidConfig(format!("{name} is required")));
            }
        }
        if self.batch_size == 0 {
            return Err(TransportError::InvalidConfig("batch size must be positive".to_string()));
        }
        if self.claim_idle_timeout.is_zero() {
            return Err(TransportError::InvalidConfig(
                "claim idle timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Consumer-group reader for one supplier stream.
///
/// [`consume`](Self::consume) runs two loops feeding one bounded channel: a blocking read of
/// never-delivered entries, and a periodic reclaim of entries left pending longer than
/// `claim_idle_timeout`. Entries without a decodable `data` field are acknowledged and skipped.
pub struct StreamConsumer {
    store: Arc<dyn StreamStore>,
    config: ConsumerConfig,
    stream: String,
    metrics: Arc<MetricsCollector>,
    closed: AtomicBool,
    stop_tx: broadcast::Sender<()>,
}

impl StreamConsumer {
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidConfig`] when a required field is missing.
    pub fn new(
        store: Arc<dyn StreamStore>,
        config: ConsumerConfig,
        metrics: Arc<MetricsCollector>,
    ) -> Result<Self, TransportError> {
        config.validate()?;
        let stream = stream_name(&config.stream_prefix, &config.supplier_operator_address);
        let (stop_tx, _) = broadcast::channel(1);
        Ok(Self { store, config, stream, metrics, closed: AtomicBool::new(false), stop_tx })
    }

    #[must_use]
    pub fn stream(&self) -> &str {
        &self.stream
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    async fn ensure_group(&self) -> Result<(), TransportError> {
        match self.store.create_group(&self.stream, &self.config.consumer_group, "0").await {
            Ok(()) | Err(StoreError::GroupExists) => {
                info!(stream = %self.stream, group = %self.config.consumer_group, "consumer group ready");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn parse(record: &StreamRecord) -> Result<StreamMessage, TransportError> {
        let data = record
            .fields
            .get(DATA_FIELD)
            .ok_or_else(|| TransportError::InvalidMessage("message missing 'data' field".to_string()))?;
        let message: MinedRelayMessage = serde_json::from_str(data)
            .map_err(|e| TransportError::InvalidMessage(e.to_string()))?;
        Ok(StreamMessage { id: record.id.clone(), message })
    }

    /// Decodes and forwards records. Returns `false` once the receiver is gone.
    async fn dispatch(&self, records: Vec<StreamRecord>, tx: &mpsc::Sender<StreamMessage>) -> bool {
        for record in records {
            match Self::parse(&record) {
                Ok(msg) => {
                    if tx.send(msg).await.is_err() {
                        return false;
                    }
                }
                Err(e) => {
                    error!(stream = %self.stream, id = %record.id, error = %e, "skipping poison message");
                    self.metrics.record_stream_poison(&self.stream);
                    if let Err(e) =
                        self.store.ack(&self.stream, &self.config.consumer_group, &[record.id]).await
                    {
                        warn!(stream = %self.stream, error = %e, "failed to ack poison message");
                    }
                }
            }
        }
        true
    }

    async fn read_loop(
        self: Arc<Self>,
        tx: mpsc::Sender<StreamMessage>,
        mut shutdown_rx: broadcast::Receiver<()>,
        mut stop_rx: broadcast::Receiver<()>,
    ) {
        loop {
            let read = tokio::select! {
                biased;

                _ = shutdown_rx.recv() => break,
                _ = stop_rx.recv() => break,

                read = self.store.read_group(
                    &self.stream,
                    &self.config.consumer_group,
                    &self.config.consumer_name,
                    self.config.batch_size,
                    self.config.block_timeout,
                ) => read,
            };

            match read {
                Ok(records) if records.is_empty() => {}
                Ok(records) => {
                    self.metrics.record_stream_read(&self.stream, records.len());
                    if !self.dispatch(records, &tx).await {
                        break;
                    }
                }
                Err(e) => {
                    error!(stream = %self.stream, error = %e, "error reading from stream");
                    tokio::time::sleep(READ_ERROR_BACKOFF).await;
                }
            }
        }
        info!(stream = %self.stream, "consume loop stopped");
    }

    async fn claim_loop(
        self: Arc<Self>,
        tx: mpsc::Sender<StreamMessage>,
        mut shutdown_rx: broadcast::Receiver<()>,
        mut stop_rx: broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(self.config.claim_idle_timeout / 2);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => break,
                _ = stop_rx.recv() => break,

                _ = ticker.tick() => {
                    if !self.claim_idle(&tx).await {
                        break;
                    }
                }
            }
        }
        debug!(stream = %self.stream, "claim loop stopped");
    }

    async fn claim_idle(&self, tx: &mpsc::Sender<StreamMessage>) -> bool {
        let claim = match self
            .store
            .auto_claim(
                &self.stream,
                &self.config.consumer_group,
                &self.config.consumer_name,
                self.config.claim_idle_timeout,
                "0-0",
                self.config.batch_size,
            )
            .await
        {
            Ok(claim) => claim,
            Err(e) => {
                debug!(stream = %self.stream, error = %e, "error claiming idle messages");
                return true;
            }
        };

        if claim.claimed.is_empty() {
            return true;
        }

        self.metrics.record_stream_claimed(&self.stream, claim.claimed.len());
        debug!(stream = %self.stream, count = claim.claimed.len(), "claimed idle messages");
        self.dispatch(claim.claimed, tx).await
    }

    /// Joins the consumer group (creating stream and group at offset zero if needed) and
    /// starts delivering messages.
    ///
    /// The channel closes when `shutdown_rx` fires or [`close`](Self::close) is called.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] or the error from group creation.
    pub async fn consume(
        self: &Arc<Self>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<mpsc::Receiver<StreamMessage>, TransportError> {
        self.ensure_open()?;
        self.ensure_group().await?;

        let (tx, rx) = mpsc::channel(self.config.batch_size * 2);

        tokio::spawn(Arc::clone(self).read_loop(
            tx.clone(),
            shutdown_rx.resubscribe(),
            self.stop_tx.subscribe(),
        ));
        tokio::spawn(Arc::clone(self).claim_loop(tx, shutdown_rx, self.stop_tx.subscribe()));

        Ok(rx)
    }

    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] or the substrate error.
    pub async fn ack(&self, id: &str) -> Result<(), TransportError> {
        self.ack_batch(&[id.to_string()]).await
    }

    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] or the substrate error.
    pub async fn ack_batch(&self, ids: &[String]) -> Result<(), TransportError> {
        self.ensure_open()?;
        if ids.is_empty() {
            return Ok(());
        }

        let acked = self.store.ack(&self.stream, &self.config.consumer_group, ids).await?;
        self.metrics.record_stream_acked(&self.stream, acked);
        Ok(())
    }

    /// Delivered but unacknowledged entries in the group.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] or the substrate error.
    pub async fn pending(&self) -> Result<u64, TransportError> {
        self.ensure_open()?;
        Ok(self.store.pending_count(&self.stream, &self.config.consumer_group).await?)
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.stop_tx.send(());
            info!(stream = %self.stream, "stream consumer closed");
        }
    }
}
