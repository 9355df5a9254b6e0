//! L2/L3 half of the read path, shared by every cache.
//!
//! Callers check their own L1 first and populate it from the returned value.

use super::{CacheBackend, CacheError};
use crate::metrics::MetricsCollector;
use serde::{de::DeserializeOwned, Serialize};
use std::{future::Future, time::Duration};
use tracing::{debug, warn};

/// Wait before re-reading L2 after losing the population lock.
pub(crate) const LOCK_RETRY_DELAY: Duration = Duration::from_millis(100);

pub(crate) struct ReadThrough<'a> {
    pub store: &'a dyn CacheBackend,
    pub metrics: &'a MetricsCollector,
    pub cache: &'static str,
    pub lock_timeout: Duration,
}

impl ReadThrough<'_> {
    async fn read_l2<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.store.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(cache = self.cache, key, error = %e, "discarding undecodable L2 entry");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(cache = self.cache, key, error = %e, "L2 read failed");
                None
            }
        }
    }

    /// Resolves `key` from L2, or from the chain via `fetch` under the population lock.
    ///
    /// `fetch` returns the value and the TTL to store it with. At most one instance runs a
    /// locked fetch per key; a caller that loses the race waits once, re-reads L2 and then
    /// queries the chain directly without writing L2.
    pub(crate) async fn get<T, F, Fut>(
        &self,
        key: &str,
        lock_key: &str,
        fetch: F,
    ) -> Result<T, CacheError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(T, Duration), CacheError>>,
    {
        if let Some(value) = self.read_l2(key).await {
            self.metrics.record_cache_hit(self.cache, "l2");
            return Ok(value);
        }
        self.metrics.record_cache_miss(self.cache, "l2");

        match self.store.set_nx(lock_key, "1", self.lock_timeout).await {
            Ok(true) => {
                let result = fetch().await;
                self.metrics.record_chain_query(self.cache, result.is_ok());

                if let Ok((value, ttl)) = &result {
                    match serde_json::to_string(value) {
                        Ok(raw) => {
                            if let Err(e) = self.store.set(key, &raw, Some(*ttl)).await {
                                warn!(cache = self.cache, key, error = %e, "failed to populate L2");
                            }
                        }
                        Err(e) => warn!(cache = self.cache, key, error = %e, "failed to encode L2 entry"),
                    }
                }
                if let Err(e) = self.store.del(lock_key).await {
                    debug!(cache = self.cache, lock_key, error = %e, "lock release failed, will expire");
                }

                let (value, _) = result?;
                self.metrics.record_cache_hit(self.cache, "l3");
                Ok(value)
            }
            Ok(false) => {
                tokio::time::sleep(LOCK_RETRY_DELAY).await;
                if let Some(value) = self.read_l2(key).await {
                    self.metrics.record_cache_hit(self.cache, "l2_retry");
                    return Ok(value);
                }

                debug!(cache = self.cache, key, "lock held elsewhere, querying chain uncached");
                let result = fetch().await;
                self.metrics.record_chain_query(self.cache, result.is_ok());
                result.map(|(value, _)| value)
            }
            Err(e) => {
                warn!(cache = self.cache, lock_key, error = %e, "lock acquisition failed, querying chain directly");
                let result = fetch().await;
                self.metrics.record_chain_query(self.cache, result.is_ok());
                result.map(|(value, _)| value)
            }
        }
    }
}
