//! Block height fan-out.
//!
//! One [`BlockHeightWatcher`] across the fleet (elected through a lease key) polls the chain
//! and publishes a [`BlockEvent`] for every new height. Every instance runs a
//! [`BlockHeightSubscriber`] that folds events into its local [`BlockHeightState`] and forwards
//! them to in-process subscribers over bounded channels. A full channel drops the event for
//! that subscriber only.

use super::{CacheBackend, CacheConfig, CacheError};
use crate::{
    chain::{BlockHeightState, BlockQueryClient},
    metrics::MetricsCollector,
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

/// Buffered events per in-process subscriber.
pub const SUBSCRIBER_CAPACITY: usize = 10;

const WATCHER_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEvent {
    pub height: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl BlockEvent {
    #[must_use]
    pub fn new(height: u64, hash: Option<String>) -> Self {
        Self { height, hash, timestamp: None }
    }
}

pub struct BlockHeightSubscriber {
    config: CacheConfig,
    store: Arc<dyn CacheBackend>,
    block_client: Option<Arc<dyn BlockQueryClient>>,
    state: BlockHeightState,
    metrics: Arc<MetricsCollector>,
    subscribers: Mutex<Vec<mpsc::Sender<BlockEvent>>>,
    closed: AtomicBool,
}

impl BlockHeightSubscriber {
    pub fn new(
        config: CacheConfig,
        store: Arc<dyn CacheBackend>,
        block_client: Option<Arc<dyn BlockQueryClient>>,
        state: BlockHeightState,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            config,
            store,
            block_client,
            state,
            metrics,
            subscribers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn current_height(&self) -> u64 {
        self.state.current_height()
    }

    #[must_use]
    pub fn state(&self) -> &BlockHeightState {
        &self.state
    }

    /// New receiver for block events. Dropping it unsubscribes.
    pub fn subscribe(&self) -> mpsc::Receiver<BlockEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        self.subscribers.lock().push(tx);
        rx
    }

    /// Publishes `event` to every instance, stamping the timestamp when absent.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Closed`] or the substrate publish error.
    pub async fn publish(&self, mut event: BlockEvent) -> Result<(), CacheError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::Closed);
        }

        event.timestamp.get_or_insert_with(Utc::now);
        let payload = serde_json::to_string(&event)?;
        self.store.publish(&self.config.block_channel(), &payload).await?;

        self.metrics.record_block_event_published();
        debug!(height = event.height, "published block event");
        Ok(())
    }

    fn handle_event(&self, event: BlockEvent) {
        if self.state.update(event.height, event.hash.clone()) {
            self.metrics.record_block_height(event.height);
        }

        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(height = event.height, "subscriber channel full, dropping event");
                self.metrics.record_block_event_dropped();
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Seeds the local height from the chain and listens for block events until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscriber is closed or the channel subscription fails.
    pub async fn start(
        self: &Arc<Self>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<JoinHandle<()>, CacheError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::Closed);
        }

        if let Some(client) = &self.block_client {
            match client.latest_block().await {
                Ok(block) => {
                    self.state.update(block.height, block.hash);
                    self.metrics.record_block_height(block.height);
                }
                Err(e) => warn!(error = %e, "failed to seed initial block height"),
            }
        }

        let mut events = self.store.subscribe(&self.config.block_channel()).await?;
        let subscriber = Arc::clone(self);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.recv() => break,

                    msg = events.next() => {
                        let Some(payload) = msg else {
                            warn!("block event subscription ended");
                            break;
                        };
                        match serde_json::from_str::<BlockEvent>(&payload) {
                            Ok(event) => subscriber.handle_event(event),
                            Err(e) => warn!(payload, error = %e, "invalid block event"),
                        }
                    }
                }
            }
            debug!("block subscriber stopped");
        });

        info!(initial_height = self.current_height(), "block subscriber started");
        Ok(handle)
    }

    /// Stops accepting publishes and closes every subscriber channel.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.subscribers.lock().clear();
            info!("block subscriber closed");
        }
    }
}

/// Polls the chain tip and publishes block events while holding the watcher lease.
pub struct BlockHeightWatcher {
    client: Arc<dyn BlockQueryClient>,
    subscriber: Arc<BlockHeightSubscriber>,
    instance_id: String,
    poll_interval: Duration,
}

impl BlockHeightWatcher {
    pub fn new(
        client: Arc<dyn BlockQueryClient>,
        subscriber: Arc<BlockHeightSubscriber>,
        instance_id: impl Into<String>,
    ) -> Self {
        Self { client, subscriber, instance_id: instance_id.into(), poll_interval: WATCHER_POLL_INTERVAL }
    }

    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn lease_ttl(&self) -> Duration {
        self.poll_interval * 3
    }

    /// Acquires or renews the fleet-wide watcher lease.
    async fn hold_lease(&self) -> bool {
        let store = &self.subscriber.store;
        let key = self.subscriber.config.block_watcher_lease_key();

        match store.set_nx(&key, &self.instance_id, self.lease_ttl()).await {
            Ok(true) => {
                info!(instance = %self.instance_id, "acquired block watcher lease");
                true
            }
            Ok(false) => match store.get(&key).await {
                Ok(Some(owner)) if owner == self.instance_id => {
                    if let Err(e) = store.set(&key, &self.instance_id, Some(self.lease_ttl())).await {
                        warn!(error = %e, "failed to renew block watcher lease");
                    }
                    true
                }
                Ok(_) => false,
                Err(e) => {
                    warn!(error = %e, "failed to read block watcher lease");
                    false
                }
            },
            Err(e) => {
                warn!(error = %e, "failed to acquire block watcher lease");
                false
            }
        }
    }

    /// Publishes every height in `(last, current]`; only the newest carries a hash.
    async fn publish_range(&self, last: u64, current: u64, hash: Option<String>) {
        for height in (last + 1)..=current {
            let event = BlockEvent {
                height,
                hash: if height == current { hash.clone() } else { None },
                timestamp: Some(Utc::now()),
            };
            if let Err(e) = self.subscriber.publish(event).await {
                error!(height, error = %e, "failed to publish block event");
            }
        }
    }

    pub fn start(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut last_height = self.subscriber.current_height();
            let mut ticker = tokio::time::interval(self.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            info!(instance = %self.instance_id, "block height watcher started");
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.recv() => break,

                    _ = ticker.tick() => {
                        if !self.hold_lease().await {
                            continue;
                        }

                        let block = match self.client.latest_block().await {
                            Ok(block) => block,
                            Err(e) => {
                                warn!(error = %e, "failed to poll latest block");
                                continue;
                            }
                        };

                        // Another instance may have published while this one was not leader.
                        last_height = last_height.max(self.subscriber.current_height());
                        if last_height == 0 {
                            last_height = block.height.saturating_sub(1);
                        }
                        if block.height > last_height {
                            self.publish_range(last_height, block.height, block.hash).await;
                            last_height = block.height;
                        }
                    }
                }
            }
            info!("block height watcher stopped");
        })
    }
}
