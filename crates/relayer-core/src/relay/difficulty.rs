//! Relay mining difficulty and compute-unit pricing.
//!
//! A served relay is billed only if its hash, read as a big-endian integer, is at most the
//! service's target hash. The base target (all `0xff`) makes every relay billable, which is
//! what any lookup failure degrades to.

use crate::{chain::ServiceQueryClient, types::RelayHash};
use async_trait::async_trait;
use dashmap::DashMap;
use std::{cmp::Ordering, sync::Arc};
use tracing::{debug, warn};

/// Target hash under which every relay is billable.
pub const BASE_RELAY_DIFFICULTY_HASH: [u8; 32] = [0xff; 32];

/// Compute units assumed when a service's pricing is unknown.
pub const DEFAULT_COMPUTE_UNITS_PER_RELAY: u64 = 1;

/// Compares two big-endian unsigned integers of possibly different widths.
fn cmp_big_endian(a: &[u8], b: &[u8]) -> Ordering {
    let strip = |bytes: &[u8]| -> usize { bytes.iter().take_while(|b| **b == 0).count() };
    let a = &a[strip(a)..];
    let b = &b[strip(b)..];
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

/// Whether a relay with `relay_hash` counts toward billable volume under `target_hash`.
#[must_use]
pub fn is_relay_volume_applicable(relay_hash: &RelayHash, target_hash: &[u8]) -> bool {
    if target_hash.is_empty() {
        return true;
    }
    cmp_big_endian(relay_hash.as_bytes(), target_hash) != Ordering::Greater
}

#[async_trait]
pub trait DifficultyProvider: Send + Sync {
    /// Current target hash for `service_id`. Implementations fall back to
    /// [`BASE_RELAY_DIFFICULTY_HASH`] rather than fail.
    async fn get_target_hash(&self, service_id: &str) -> Vec<u8>;
}

/// Every relay is billable.
#[derive(Debug, Default, Clone, Copy)]
pub struct BaseDifficultyProvider;

#[async_trait]
impl DifficultyProvider for BaseDifficultyProvider {
    async fn get_target_hash(&self, _service_id: &str) -> Vec<u8> {
        BASE_RELAY_DIFFICULTY_HASH.to_vec()
    }
}

/// Per-service target hashes fetched from the chain once and kept until invalidated.
pub struct CachedDifficultyProvider {
    client: Arc<dyn ServiceQueryClient>,
    targets: DashMap<String, Vec<u8>>,
}

impl CachedDifficultyProvider {
    pub fn new(client: Arc<dyn ServiceQueryClient>) -> Self {
        Self { client, targets: DashMap::new() }
    }

    pub fn invalidate(&self, service_id: &str) {
        self.targets.remove(service_id);
    }

    pub fn invalidate_all(&self) {
        self.targets.clear();
    }
}

#[async_trait]
impl DifficultyProvider for CachedDifficultyProvider {
    async fn get_target_hash(&self, service_id: &str) -> Vec<u8> {
        if let Some(target) = self.targets.get(service_id) {
            return target.clone();
        }

        match self.client.get_relay_mining_difficulty(service_id).await {
            Ok(difficulty) if !difficulty.target_hash.is_empty() => {
                debug!(service_id, target = %hex::encode(&difficulty.target_hash), "cached relay mining difficulty");
                self.targets.insert(service_id.to_string(), difficulty.target_hash.clone());
                difficulty.target_hash
            }
            Ok(_) => {
                self.targets.insert(service_id.to_string(), BASE_RELAY_DIFFICULTY_HASH.to_vec());
                BASE_RELAY_DIFFICULTY_HASH.to_vec()
            }
            Err(e) => {
                warn!(service_id, error = %e, "failed to query service difficulty, using base");
                BASE_RELAY_DIFFICULTY_HASH.to_vec()
            }
        }
    }
}

#[async_trait]
pub trait ComputeUnitsProvider: Send + Sync {
    async fn get_compute_units_per_relay(&self, service_id: &str) -> u64;
}

/// Compute units per relay fetched from the chain once per service.
pub struct CachedComputeUnitsProvider {
    client: Arc<dyn ServiceQueryClient>,
    units: DashMap<String, u64>,
}

impl CachedComputeUnitsProvider {
    pub fn new(client: Arc<dyn ServiceQueryClient>) -> Self {
        Self { client, units: DashMap::new() }
    }

    /// Warms the cache so relays for these services never wait on the chain.
    pub async fn preload(&self, service_ids: &[String]) {
        for service_id in service_ids {
            match self.client.get_compute_units_per_relay(service_id).await {
                Ok(units) => {
                    self.units.insert(service_id.clone(), units);
                    debug!(service_id = %service_id, compute_units = units, "preloaded service compute units");
                }
                Err(e) => warn!(service_id = %service_id, error = %e, "failed to preload service compute units"),
            }
        }
    }

    pub fn invalidate(&self, service_id: &str) {
        self.units.remove(service_id);
    }

    pub fn invalidate_all(&self) {
        self.units.clear();
    }
}

#[async_trait]
impl ComputeUnitsProvider for CachedComputeUnitsProvider {
    async fn get_compute_units_per_relay(&self, service_id: &str) -> u64 {
        if let Some(units) = self.units.get(service_id) {
            return *units;
        }

        match self.client.get_compute_units_per_relay(service_id).await {
            Ok(units) => {
                self.units.insert(service_id.to_string(), units);
                units
            }
            Err(e) => {
                warn!(service_id, error = %e, "failed to query service compute units, using default");
                DEFAULT_COMPUTE_UNITS_PER_RELAY
            }
        }
    }
}
