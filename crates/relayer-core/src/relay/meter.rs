//! Stake-based relay metering.
//!
//! Each session gets a budget derived from the application's stake, split across the
//! session's suppliers and across every session that may still be awaiting settlement:
//!
//! ```text
//! max_stake = (app_stake / num_suppliers_per_session)
//!           / (ceil(session_end_to_proof_window_close_blocks / num_blocks_per_session) + 1)
//! ```
//!
//! Every relay consumes `compute_units_per_relay * multiplier / granularity`. Past the budget a
//! relay is "over-serviced": still served when over-servicing is enabled, rejected otherwise.
//! Meter state is process-local and dropped once the session's claim window opens.

use super::{
    difficulty::{ComputeUnitsProvider, DEFAULT_COMPUTE_UNITS_PER_RELAY},
    errors::RelayError,
};
use crate::{
    cache::SharedParamsLookup,
    chain::{ApplicationQueryClient, BlockHeightState, SessionQueryClient},
    config::RelayMeterConfig,
    metrics::MetricsCollector,
    types::SharedParams,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct RelayMeterSettings {
    pub over_servicing_enabled: bool,
    pub cleanup_interval: Duration,
}

impl Default for RelayMeterSettings {
    fn default() -> Self {
        Self { over_servicing_enabled: true, cleanup_interval: Duration::from_secs(30) }
    }
}

impl From<&RelayMeterConfig> for RelayMeterSettings {
    fn from(config: &RelayMeterConfig) -> Self {
        Self {
            over_servicing_enabled: config.over_servicing_enabled,
            cleanup_interval: Duration::from_secs(config.cleanup_interval_seconds.max(1)),
        }
    }
}

/// Budget and consumption for one session, in the chain's base denomination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMeterState {
    pub session_id: String,
    pub app_address: String,
    pub service_id: String,
    pub max_stake: u64,
    pub consumed_stake: u64,
    pub over_serviced_relays: u64,
    pub session_end_height: u64,
    pub last_updated: DateTime<Utc>,
}

/// Outcome of [`RelayMeter::check_and_consume_relay`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeterDecision {
    pub allowed: bool,
    pub over_serviced: bool,
}

impl MeterDecision {
    const ALLOW: Self = Self { allowed: true, over_serviced: false };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayMeterSnapshot {
    pub active_sessions: usize,
    pub total_over_serviced: u64,
    pub over_servicing_enabled: bool,
}

/// Budget available to one supplier in one session.
#[must_use]
pub fn app_stake_per_session_supplier(
    app_stake: u64,
    params: &SharedParams,
    num_suppliers_per_session: u64,
) -> u64 {
    let per_supplier = app_stake / num_suppliers_per_session.max(1);
    let blocks_per_session = params.num_blocks_per_session.max(1);
    let awaiting_settlement =
        params.session_end_to_proof_window_close_blocks().div_ceil(blocks_per_session);
    per_supplier / (awaiting_settlement + 1)
}

/// Cost of one relay for a service priced at `compute_units_per_relay`.
#[must_use]
pub fn relay_cost(compute_units_per_relay: u64, params: &SharedParams) -> u64 {
    let cost = u128::from(compute_units_per_relay) *
        u128::from(params.compute_units_to_tokens_multiplier) /
        u128::from(params.compute_unit_cost_granularity.max(1));
    u64::try_from(cost).unwrap_or(u64::MAX)
}

/// Power-of-two occurrences, so over-servicing logs back off exponentially.
fn should_log_over_servicing(occurrence: u64) -> bool {
    occurrence & occurrence.wrapping_sub(1) == 0
}

pub struct RelayMeter {
    settings: RelayMeterSettings,
    applications: Arc<dyn ApplicationQueryClient>,
    sessions: Arc<dyn SessionQueryClient>,
    shared_params: Arc<dyn SharedParamsLookup>,
    compute_units: Option<Arc<dyn ComputeUnitsProvider>>,
    block_height: BlockHeightState,
    metrics: Arc<MetricsCollector>,
    meters: Mutex<HashMap<String, SessionMeterState>>,
    closed: AtomicBool,
    stop_tx: broadcast::Sender<()>,
}

impl RelayMeter {
    pub fn new(
        settings: RelayMeterSettings,
        applications: Arc<dyn ApplicationQueryClient>,
        sessions: Arc<dyn SessionQueryClient>,
        shared_params: Arc<dyn SharedParamsLookup>,
        block_height: BlockHeightState,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let (stop_tx, _) = broadcast::channel(1);
        Self {
            settings,
            applications,
            sessions,
            shared_params,
            compute_units: None,
            block_height,
            metrics,
            meters: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            stop_tx,
        }
    }

    /// Prices relays from the chain instead of one compute unit per relay.
    #[must_use]
    pub fn with_compute_units_provider(mut self, provider: Arc<dyn ComputeUnitsProvider>) -> Self {
        self.compute_units = Some(provider);
        self
    }

    /// Charges one relay against the session's budget.
    ///
    /// Failing to build the meter or price the relay allows the relay uncharged.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::MeterClosed`] after [`close`](Self::close).
    pub async fn check_and_consume_relay(
        &self,
        session_id: &str,
        app_address: &str,
        service_id: &str,
        session_end_height: u64,
    ) -> Result<MeterDecision, RelayError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RelayError::MeterClosed);
        }

        if let Err(e) =
            self.ensure_session_meter(session_id, app_address, service_id, session_end_height).await
        {
            warn!(session_id, app_address, error = %e, "failed to get session meter, allowing relay");
            return Ok(MeterDecision::ALLOW);
        }

        let cost = match self.relay_cost(service_id).await {
            Ok(cost) => cost,
            Err(e) => {
                warn!(session_id, service_id, error = %e, "failed to calculate relay cost, allowing relay");
                return Ok(MeterDecision::ALLOW);
            }
        };

        let mut meters = self.meters.lock();
        let Some(meter) = meters.get_mut(session_id) else {
            // Swept between creation and charge.
            return Ok(MeterDecision::ALLOW);
        };

        meter.last_updated = Utc::now();
        let consumed = meter.consumed_stake.saturating_add(cost);
        if consumed <= meter.max_stake {
            meter.consumed_stake = consumed;
            return Ok(MeterDecision::ALLOW);
        }

        meter.over_serviced_relays += 1;
        let over_serviced = meter.over_serviced_relays;
        drop(meters);

        let allowed = self.settings.over_servicing_enabled;
        self.metrics.record_over_serviced(service_id, allowed);
        if allowed {
            if should_log_over_servicing(over_serviced) {
                warn!(
                    application = app_address,
                    session_id,
                    over_serviced_count = over_serviced,
                    "application over-serviced (over-servicing enabled)"
                );
            }
        } else {
            debug!(application = app_address, session_id, "relay rejected due to stake limit");
        }

        Ok(MeterDecision { allowed, over_serviced: true })
    }

    /// Gives back the cost of a relay that was charged but not billed.
    pub async fn revert_relay_consumption(&self, session_id: &str, service_id: &str) {
        if !self.meters.lock().contains_key(session_id) {
            return;
        }
        let Ok(cost) = self.relay_cost(service_id).await else {
            return;
        };

        if let Some(meter) = self.meters.lock().get_mut(session_id) {
            if meter.consumed_stake >= cost {
                meter.consumed_stake -= cost;
                meter.last_updated = Utc::now();
            }
        }
    }

    #[must_use]
    pub fn get_session_meter_state(&self, session_id: &str) -> Option<SessionMeterState> {
        self.meters.lock().get(session_id).cloned()
    }

    #[must_use]
    pub fn snapshot(&self) -> RelayMeterSnapshot {
        let meters = self.meters.lock();
        RelayMeterSnapshot {
            active_sessions: meters.len(),
            total_over_serviced: meters.values().map(|m| m.over_serviced_relays).sum(),
            over_servicing_enabled: self.settings.over_servicing_enabled,
        }
    }

    async fn ensure_session_meter(
        &self,
        session_id: &str,
        app_address: &str,
        service_id: &str,
        session_end_height: u64,
    ) -> Result<(), String> {
        if self.meters.lock().contains_key(session_id) {
            return Ok(());
        }

        let app = self
            .applications
            .get_application(app_address)
            .await
            .map_err(|e| format!("failed to get application: {e}"))?;
        let shared = self
            .shared_params
            .get_shared_params(self.block_height.current_height())
            .await
            .map_err(|e| format!("failed to get shared params: {e}"))?;
        let session_params = self
            .sessions
            .get_params()
            .await
            .map_err(|e| format!("failed to get session params: {e}"))?;

        let max_stake =
            app_stake_per_session_supplier(app.stake, &shared, session_params.num_suppliers_per_session);

        let active = {
            let mut meters = self.meters.lock();
            meters.entry(session_id.to_string()).or_insert_with(|| SessionMeterState {
                session_id: session_id.to_string(),
                app_address: app_address.to_string(),
                service_id: service_id.to_string(),
                max_stake,
                consumed_stake: 0,
                over_serviced_relays: 0,
                session_end_height,
                last_updated: Utc::now(),
            });
            meters.len()
        };
        self.metrics.record_meter_active_sessions(active);
        debug!(session_id, app_address, max_stake, "created session meter");
        Ok(())
    }

    async fn relay_cost(&self, service_id: &str) -> Result<u64, String> {
        let shared = self
            .shared_params
            .get_shared_params(self.block_height.current_height())
            .await
            .map_err(|e| e.to_string())?;
        let units = match &self.compute_units {
            Some(provider) => provider.get_compute_units_per_relay(service_id).await,
            None => DEFAULT_COMPUTE_UNITS_PER_RELAY,
        };
        Ok(relay_cost(units, &shared))
    }

    /// Drops meters for sessions whose claim window has opened. Returns how many were removed.
    pub async fn cleanup_expired_sessions(&self) -> usize {
        let current = self.block_height.current_height();
        let Ok(shared) = self.shared_params.get_shared_params(current).await else {
            return 0;
        };

        let (removed, remaining) = {
            let mut meters = self.meters.lock();
            let before = meters.len();
            meters.retain(|_, m| current < shared.claim_window_open_height(m.session_end_height));
            (before - meters.len(), meters.len())
        };

        if removed > 0 {
            self.metrics.record_meter_active_sessions(remaining);
            debug!(cleaned_up = removed, height = current, "cleaned up expired session meters");
        }
        removed
    }

    /// Spawns the periodic cleanup loop.
    pub fn start(self: &Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let meter = Arc::clone(self);
        let mut stop_rx = self.stop_tx.subscribe();
        let period = self.settings.cleanup_interval;

        info!(over_servicing_enabled = self.settings.over_servicing_enabled, "relay meter started");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.recv() => break,
                    _ = stop_rx.recv() => break,

                    _ = ticker.tick() => {
                        meter.cleanup_expired_sessions().await;
                    }
                }
            }
        })
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.stop_tx.send(());
            info!("relay meter closed");
        }
    }
}
