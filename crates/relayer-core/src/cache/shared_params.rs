use super::{
    local::LocalMap, read_through::ReadThrough, CacheBackend, CacheConfig, CacheError,
    SharedParamsLookup,
};
use crate::{chain::SharedQueryClient, metrics::MetricsCollector, types::SharedParams};
use async_trait::async_trait;
use futures::StreamExt;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, info, warn};

const CACHE_NAME: &str = "shared_params";

/// Shared protocol parameters keyed by block height.
pub struct SharedParamCache {
    config: CacheConfig,
    store: Arc<dyn CacheBackend>,
    client: Arc<dyn SharedQueryClient>,
    metrics: Arc<MetricsCollector>,
    local: LocalMap<u64, SharedParams>,
    closed: AtomicBool,
}

impl SharedParamCache {
    pub fn new(
        config: CacheConfig,
        store: Arc<dyn CacheBackend>,
        client: Arc<dyn SharedQueryClient>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self { config, store, client, metrics, local: LocalMap::new(), closed: AtomicBool::new(false) }
    }

    /// Lifetime of an entry in either tier.
    fn ttl(&self) -> Duration {
        self.config.block_time * u32::try_from(self.config.ttl_blocks).unwrap_or(u32::MAX)
    }

    fn ensure_open(&self) -> Result<(), CacheError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::Closed);
        }
        Ok(())
    }

    /// Clears the entry for `height` on this instance and in L2, then tells every other
    /// instance to drop its L1 copy.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Closed`] after [`close`](Self::close), or the substrate error if
    /// the L2 delete fails.
    pub async fn invalidate(&self, height: u64) -> Result<(), CacheError> {
        self.ensure_open()?;

        self.local.remove(&height);
        self.store.del(&self.config.shared_params_key(height)).await?;

        if let Err(e) =
            self.store.publish(&self.config.params_invalidation_channel(), &height.to_string()).await
        {
            warn!(height, error = %e, "failed to publish params invalidation");
        }

        self.metrics.record_cache_invalidation(CACHE_NAME, "local");
        debug!(height, "invalidated shared params");
        Ok(())
    }

    /// Drops L1 entries past their TTL.
    pub fn evict_expired(&self) {
        let evicted = self.local.evict_expired();
        if evicted > 0 {
            debug!(evicted, "evicted expired shared params");
        }
    }

    /// Subscribes to cross-instance invalidations until `shutdown_rx` fires, sweeping expired
    /// L1 entries once per block.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache is closed or the subscription cannot be opened.
    pub async fn start(
        self: &Arc<Self>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<JoinHandle<()>, CacheError> {
        self.ensure_open()?;

        let mut messages = self.store.subscribe(&self.config.params_invalidation_channel()).await?;
        let mut sweep = tokio::time::interval(self.config.block_time.max(Duration::from_secs(1)));
        let cache = Arc::clone(self);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.recv() => break,

                    msg = messages.next() => {
                        let Some(payload) = msg else {
                            warn!("params invalidation subscription ended");
                            break;
                        };
                        match payload.trim().parse::<u64>() {
                            Ok(height) => {
                                cache.local.remove(&height);
                                cache.metrics.record_cache_invalidation(CACHE_NAME, "pubsub");
                            }
                            Err(e) => warn!(payload, error = %e, "invalid params invalidation payload"),
                        }
                    }

                    _ = sweep.tick() => cache.evict_expired(),
                }
            }
            debug!("shared params invalidation listener stopped");
        });

        info!("shared params cache started");
        Ok(handle)
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.local.clear();
            info!("shared params cache closed");
        }
    }
}

#[async_trait]
impl SharedParamsLookup for SharedParamCache {
    async fn get_shared_params(&self, height: u64) -> Result<SharedParams, CacheError> {
        self.ensure_open()?;

        if let Some(params) = self.local.get(&height) {
            self.metrics.record_cache_hit(CACHE_NAME, "l1");
            return Ok(params);
        }
        self.metrics.record_cache_miss(CACHE_NAME, "l1");

        let ttl = self.ttl();
        let reader = ReadThrough {
            store: self.store.as_ref(),
            metrics: &self.metrics,
            cache: CACHE_NAME,
            lock_timeout: self.config.lock_timeout,
        };

        let params = reader
            .get(
                &self.config.shared_params_key(height),
                &self.config.shared_params_lock_key(height),
                || async {
                    let params = self.client.get_params().await?;
                    Ok::<_, CacheError>((params, ttl))
                },
            )
            .await?;

        self.local.insert(height, params.clone(), ttl);
        Ok(params)
    }
}
