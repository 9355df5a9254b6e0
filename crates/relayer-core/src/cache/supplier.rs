//! Supplier activity state.
//!
//! Written by the process that owns the supplier's on-chain lifecycle, read by every relayer
//! instance. Entries never expire; they are replaced or deleted explicitly. On substrate errors
//! the cache either reports the supplier as active (fail-open) or as absent (fail-closed).

use super::{CacheError, SupplierLookup};
use crate::{metrics::MetricsCollector, store::KvStore};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, info, warn};

pub const SUPPLIER_STATUS_ACTIVE: &str = "active";
pub const SUPPLIER_STATUS_UNSTAKING: &str = "unstaking";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupplierState {
    pub status: String,
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub unstake_session_end_height: u64,
    pub operator_address: String,
    #[serde(default)]
    pub owner_address: String,
    #[serde(default)]
    pub last_updated: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub updated_by: String,
    /// Set on the synthetic state returned when a read failed open; carries no service list.
    #[serde(skip)]
    pub assumed_active: bool,
}

impl SupplierState {
    /// Synthetic state used when the cache fails open.
    #[must_use]
    pub fn fail_open_placeholder(operator_address: &str) -> Self {
        Self {
            status: SUPPLIER_STATUS_ACTIVE.to_string(),
            operator_address: operator_address.to_string(),
            assumed_active: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == SUPPLIER_STATUS_ACTIVE && self.unstake_session_end_height == 0
    }

    #[must_use]
    pub fn is_active_for_service(&self, service_id: &str) -> bool {
        self.is_active() && self.services.iter().any(|s| s == service_id)
    }
}

pub struct SupplierCache {
    store: Arc<dyn KvStore>,
    key_prefix: String,
    fail_open: bool,
    metrics: Arc<MetricsCollector>,
}

impl SupplierCache {
    pub fn new(
        store: Arc<dyn KvStore>,
        key_prefix: impl Into<String>,
        fail_open: bool,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self { store, key_prefix: key_prefix.into(), fail_open, metrics }
    }

    #[must_use]
    pub fn fail_open(&self) -> bool {
        self.fail_open
    }

    fn key(&self, operator_address: &str) -> String {
        format!("{}:{operator_address}", self.key_prefix)
    }

    /// Stores `state`, stamping `last_updated`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidArgument`] without an operator address, or the substrate
    /// error from the write.
    pub async fn set_state(&self, state: &mut SupplierState) -> Result<(), CacheError> {
        if state.operator_address.is_empty() {
            return Err(CacheError::InvalidArgument("operator_address is required".to_string()));
        }

        state.last_updated = chrono::Utc::now().timestamp();
        let raw = serde_json::to_string(state)?;
        self.store.set(&self.key(&state.operator_address), &raw, None).await?;

        debug!(
            supplier = %state.operator_address,
            status = %state.status,
            unstake_session_end_height = state.unstake_session_end_height,
            "updated supplier state"
        );
        Ok(())
    }

    /// # Errors
    ///
    /// Returns the substrate error from the delete.
    pub async fn delete_state(&self, operator_address: &str) -> Result<(), CacheError> {
        self.store.del(&self.key(operator_address)).await?;
        info!(supplier = operator_address, "deleted supplier state");
        Ok(())
    }

    /// Whether the supplier may serve `service_id`. A supplier with no recorded state counts as
    /// active only when failing open.
    ///
    /// # Errors
    ///
    /// Returns an error if the recorded state cannot be decoded.
    pub async fn is_active_for_service(
        &self,
        operator_address: &str,
        service_id: &str,
    ) -> Result<bool, CacheError> {
        match self.get_state(operator_address).await? {
            Some(state) => Ok(state.assumed_active || state.is_active_for_service(service_id)),
            None if self.fail_open => {
                warn!(supplier = operator_address, service_id, "fail-open: supplier not in cache, treating as active");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Every recorded supplier keyed by operator address. Undecodable entries are skipped.
    ///
    /// # Errors
    ///
    /// Returns the substrate error from the key scan or a read.
    pub async fn get_all(&self) -> Result<HashMap<String, SupplierState>, CacheError> {
        let keys = self.store.keys(&format!("{}:*", self.key_prefix)).await?;

        let mut states = HashMap::with_capacity(keys.len());
        for key in keys {
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            match serde_json::from_str::<SupplierState>(&raw) {
                Ok(state) => {
                    states.insert(state.operator_address.clone(), state);
                }
                Err(e) => warn!(key, error = %e, "skipping undecodable supplier state"),
            }
        }
        Ok(states)
    }
}

#[async_trait]
impl SupplierLookup for SupplierCache {
    async fn get_state(&self, operator_address: &str) -> Result<Option<SupplierState>, CacheError> {
        match self.store.get(&self.key(operator_address)).await {
            Ok(Some(raw)) => {
                self.metrics.record_cache_hit("supplier", "l2");
                Ok(Some(serde_json::from_str(&raw)?))
            }
            Ok(None) => {
                self.metrics.record_cache_miss("supplier", "l2");
                Ok(None)
            }
            Err(e) if self.fail_open => {
                warn!(supplier = operator_address, error = %e, "fail-open: treating supplier as active due to cache error");
                self.metrics.record_supplier_cache_fail_open();
                Ok(Some(SupplierState::fail_open_placeholder(operator_address)))
            }
            Err(e) => {
                warn!(supplier = operator_address, error = %e, "fail-closed: treating supplier as absent due to cache error");
                Ok(None)
            }
        }
    }
}
