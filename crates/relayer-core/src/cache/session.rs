//! Session cache, validation-result cache and session rewardability markers.
//!
//! Sessions are immutable once fetched, so an L2 entry lives until the session stops being
//! servable: `(end + grace + extra_grace - current) * block_time + 10s`. Validation results are
//! kept for one block. Rewardability is a negative marker: absence means rewardable.

use super::{
    local::LocalMap, read_through::ReadThrough, CacheBackend, CacheConfig, CacheError,
    SessionLookup, SharedParamsLookup,
};
use crate::{
    chain::{BlockHeightState, SessionQueryClient},
    metrics::MetricsCollector,
    types::{Session, SharedParams},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, info, warn};

const CACHE_NAME: &str = "session";
const VALIDATION_CACHE_NAME: &str = "session_validation";
const SESSION_TTL_BUFFER_SECS: u64 = 10;
const NON_REWARDABLE_VALUE: &str = "false";

/// Outcome of a previous relay validation for one (application, service, height).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionValidationResult {
    pub app_address: String,
    pub service_id: String,
    pub block_height: u64,
    pub session_id: String,
    pub session_end_height: u64,
    pub is_valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub validated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionInvalidation {
    app_address: String,
    service_id: String,
    height: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct RewardableUpdate {
    session_id: String,
    is_rewardable: bool,
    #[serde(default)]
    reason: String,
}

/// Seconds a session should stay in L2 given the chain tip.
///
/// Never negative, and non-increasing as `current_height` grows. Once the session is past
/// `end + grace + extra_grace` it collapses to a single block.
#[must_use]
pub fn session_ttl(
    session_end_height: u64,
    grace_period_blocks: u64,
    extra_grace_blocks: u64,
    current_height: u64,
    block_time_secs: u64,
) -> Duration {
    let valid_until = session_end_height
        .saturating_add(grace_period_blocks)
        .saturating_add(extra_grace_blocks);

    if current_height >= valid_until {
        return Duration::from_secs(block_time_secs);
    }

    let remaining = valid_until - current_height;
    Duration::from_secs(
        remaining.saturating_mul(block_time_secs).saturating_add(SESSION_TTL_BUFFER_SECS),
    )
}

/// Blocks a non-rewardable marker must outlive: the session plus its grace and claim windows.
fn rewardable_marker_blocks(params: &SharedParams, extra_grace: u64) -> u64 {
    params.num_blocks_per_session
        + params.grace_period_end_offset_blocks
        + params.claim_window_open_offset_blocks
        + params.claim_window_close_offset_blocks
        + extra_grace
}

pub struct SessionCache {
    config: CacheConfig,
    store: Arc<dyn CacheBackend>,
    client: Arc<dyn SessionQueryClient>,
    shared_params: Arc<dyn SharedParamsLookup>,
    block_height: BlockHeightState,
    metrics: Arc<MetricsCollector>,
    sessions: LocalMap<String, Session>,
    rewardable: LocalMap<String, bool>,
    closed: AtomicBool,
}

impl SessionCache {
    pub fn new(
        config: CacheConfig,
        store: Arc<dyn CacheBackend>,
        client: Arc<dyn SessionQueryClient>,
        shared_params: Arc<dyn SharedParamsLookup>,
        block_height: BlockHeightState,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            config,
            store,
            client,
            shared_params,
            block_height,
            metrics,
            sessions: LocalMap::new(),
            rewardable: LocalMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Lifetime of a rewardability marker.
    async fn marker_ttl(&self) -> Duration {
        let current = self.block_height.current_height();
        // Default geometry matches the protocol genesis parameters.
        let params = self.shared_params.get_shared_params(current).await.unwrap_or_default();
        let blocks = rewardable_marker_blocks(&params, self.config.extra_grace_blocks);
        Duration::from_secs(blocks.saturating_mul(self.config.block_time_secs()))
    }

    fn ensure_open(&self) -> Result<(), CacheError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::Closed);
        }
        Ok(())
    }

    async fn compute_ttl(&self, session_end_height: u64) -> Duration {
        let current = self.block_height.current_height();
        match self.shared_params.get_shared_params(current).await {
            Ok(params) => session_ttl(
                session_end_height,
                params.grace_period_end_offset_blocks,
                self.config.extra_grace_blocks,
                current,
                self.config.block_time_secs(),
            ),
            Err(e) => {
                debug!(error = %e, "shared params unavailable, using default session ttl");
                Duration::from_secs(self.config.block_time_secs() * 10)
            }
        }
    }

    /// Drops a cached session everywhere.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Closed`] or the substrate error from the L2 delete.
    pub async fn invalidate_session(
        &self,
        app_address: &str,
        service_id: &str,
        height: u64,
    ) -> Result<(), CacheError> {
        self.ensure_open()?;

        let key = self.config.session_key(app_address, service_id, height);
        self.sessions.remove(&key);
        self.store.del(&key).await?;

        let event = SessionInvalidation {
            app_address: app_address.to_string(),
            service_id: service_id.to_string(),
            height,
        };
        let payload = serde_json::to_string(&event)?;
        if let Err(e) = self.store.publish(&self.config.session_invalidation_channel(), &payload).await {
            warn!(app = app_address, service_id, height, error = %e, "failed to publish session invalidation");
        }

        self.metrics.record_cache_invalidation(CACHE_NAME, "local");
        Ok(())
    }

    /// Cached validation outcome, if one was recorded within the last block.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Closed`], a substrate error, or a decode error.
    pub async fn get_validation_result(
        &self,
        app_address: &str,
        service_id: &str,
        height: u64,
    ) -> Result<Option<SessionValidationResult>, CacheError> {
        self.ensure_open()?;

        let key = self.config.session_validation_key(app_address, service_id, height);
        let Some(raw) = self.store.get(&key).await? else {
            self.metrics.record_cache_miss(VALIDATION_CACHE_NAME, "l2");
            return Ok(None);
        };

        let result = serde_json::from_str(&raw)?;
        self.metrics.record_cache_hit(VALIDATION_CACHE_NAME, "l2");
        Ok(Some(result))
    }

    /// # Errors
    ///
    /// Returns [`CacheError::Closed`] or the substrate error from the write.
    pub async fn set_validation_result(
        &self,
        result: &SessionValidationResult,
    ) -> Result<(), CacheError> {
        self.ensure_open()?;

        let key = self.config.session_validation_key(
            &result.app_address,
            &result.service_id,
            result.block_height,
        );
        let raw = serde_json::to_string(result)?;
        self.store.set(&key, &raw, Some(self.config.block_time)).await?;
        Ok(())
    }

    /// Whether relays for `session_id` can still earn rewards.
    ///
    /// Substrate errors resolve to `true` so a transient outage never rejects traffic.
    pub async fn is_session_rewardable(&self, session_id: &str) -> bool {
        if let Some(cached) = self.rewardable.get(session_id) {
            return cached;
        }

        match self.store.get(&self.config.session_rewardable_key(session_id)).await {
            Ok(Some(value)) => {
                let rewardable = value != NON_REWARDABLE_VALUE;
                self.rewardable.insert(session_id.to_string(), rewardable, self.marker_ttl().await);
                rewardable
            }
            Ok(None) => true,
            Err(e) => {
                warn!(session_id, error = %e, "error checking rewardability");
                true
            }
        }
    }

    /// Records that `session_id` must not be claimed, on every instance.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Closed`] or the substrate error from the marker write.
    pub async fn mark_session_non_rewardable(
        &self,
        session_id: &str,
        reason: &str,
    ) -> Result<(), CacheError> {
        self.ensure_open()?;

        let ttl = self.marker_ttl().await;
        self.store
            .set(&self.config.session_rewardable_key(session_id), NON_REWARDABLE_VALUE, Some(ttl))
            .await?;
        self.rewardable.insert(session_id.to_string(), false, ttl);

        let update = RewardableUpdate {
            session_id: session_id.to_string(),
            is_rewardable: false,
            reason: reason.to_string(),
        };
        let payload = serde_json::to_string(&update)?;
        if let Err(e) = self.store.publish(&self.config.rewardable_channel(), &payload).await {
            warn!(session_id, error = %e, "failed to publish rewardability update");
        }

        self.metrics.record_session_non_rewardable(reason);
        debug!(session_id, reason, "marked session as non-rewardable");
        Ok(())
    }

    fn handle_invalidation(&self, payload: &str) {
        match serde_json::from_str::<SessionInvalidation>(payload) {
            Ok(event) => {
                let key = self.config.session_key(&event.app_address, &event.service_id, event.height);
                self.sessions.remove(&key);
                self.metrics.record_cache_invalidation(CACHE_NAME, "pubsub");
            }
            Err(e) => warn!(payload, error = %e, "invalid session invalidation payload"),
        }
    }

    async fn handle_rewardable_update(&self, payload: &str) {
        match serde_json::from_str::<RewardableUpdate>(payload) {
            Ok(update) => {
                let ttl = self.marker_ttl().await;
                self.rewardable.insert(update.session_id, update.is_rewardable, ttl);
            }
            Err(e) => warn!(payload, error = %e, "invalid rewardability update"),
        }
    }

    /// Drops L1 sessions and markers past their TTL.
    pub fn evict_expired(&self) {
        let evicted = self.sessions.evict_expired() + self.rewardable.evict_expired();
        if evicted > 0 {
            debug!(evicted, "evicted expired session cache entries");
        }
    }

    /// Subscribes to session invalidations and rewardability updates until shutdown, sweeping
    /// expired L1 entries once per block.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache is closed or a subscription cannot be opened.
    pub async fn start(
        self: &Arc<Self>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<JoinHandle<()>, CacheError> {
        self.ensure_open()?;

        let mut invalidations =
            self.store.subscribe(&self.config.session_invalidation_channel()).await?;
        let mut rewardability = self.store.subscribe(&self.config.rewardable_channel()).await?;
        let mut sweep = tokio::time::interval(self.config.block_time.max(Duration::from_secs(1)));
        let cache = Arc::clone(self);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.recv() => break,

                    msg = invalidations.next() => match msg {
                        Some(payload) => cache.handle_invalidation(&payload),
                        None => {
                            warn!("session invalidation subscription ended");
                            break;
                        }
                    },

                    msg = rewardability.next() => match msg {
                        Some(payload) => cache.handle_rewardable_update(&payload).await,
                        None => {
                            warn!("rewardability subscription ended");
                            break;
                        }
                    },

                    _ = sweep.tick() => cache.evict_expired(),
                }
            }
            debug!("session cache listener stopped");
        });

        info!("session cache started");
        Ok(handle)
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.sessions.clear();
            self.rewardable.clear();
            info!("session cache closed");
        }
    }
}

#[async_trait]
impl SessionLookup for SessionCache {
    async fn get_session(
        &self,
        app_address: &str,
        service_id: &str,
        height: u64,
    ) -> Result<Session, CacheError> {
        self.ensure_open()?;

        let key = self.config.session_key(app_address, service_id, height);
        if let Some(session) = self.sessions.get(&key) {
            self.metrics.record_cache_hit(CACHE_NAME, "l1");
            return Ok(session);
        }
        self.metrics.record_cache_miss(CACHE_NAME, "l1");

        let reader = ReadThrough {
            store: self.store.as_ref(),
            metrics: &self.metrics,
            cache: CACHE_NAME,
            lock_timeout: self.config.lock_timeout,
        };

        let session = reader
            .get(
                &key,
                &self.config.session_lock_key(app_address, service_id, height),
                || async {
                    let session = self.client.get_session(app_address, service_id, height).await?;
                    let ttl = self.compute_ttl(session.header.end_height()).await;
                    Ok::<_, CacheError>((session, ttl))
                },
            )
            .await?;

        let ttl = self.compute_ttl(session.header.end_height()).await;
        self.sessions.insert(key, session.clone(), ttl);
        Ok(session)
    }
}
