//! Background session validation.
//!
//! Relays served optimistically are validated here after the response has gone out. Depending
//! on the mode a relay is validated inline (`eager`), always queued for the worker pool
//! (`lazy`), or validated inline with probability `sample_rate` and queued otherwise
//! (`sampled`). A relay that fails validation in the background marks its whole session as
//! non-rewardable on every instance; it cannot be retracted from the client.
//!
//! The queue is bounded. When it is full the request is dropped and counted rather than
//! blocking the caller.

use super::{errors::ValidationError, validator::RelayValidator};
use crate::{
    cache::{session::SessionValidationResult, SessionCache},
    config::SessionValidationConfig,
    metrics::MetricsCollector,
    types::RelayRequest,
};
use parking_lot::{Mutex, RwLock};
use std::{
    collections::HashSet,
    str::FromStr,
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
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionValidationMode {
    Eager,
    Lazy,
    Sampled,
}

impl FromStr for SessionValidationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "eager" => Ok(Self::Eager),
            "lazy" => Ok(Self::Lazy),
            "sampled" => Ok(Self::Sampled),
            other => Err(format!("unknown session validation mode: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionValidatorConfig {
    pub mode: SessionValidationMode,
    /// Fraction of relays validated inline in `sampled` mode.
    pub sample_rate: f64,
    pub queue_size: usize,
    pub workers: usize,
    pub timeout: Duration,
}

impl Default for SessionValidatorConfig {
    fn default() -> Self {
        Self {
            mode: SessionValidationMode::Eager,
            sample_rate: 0.1,
            queue_size: 10_000,
            workers: 4,
            timeout: Duration::from_secs(5),
        }
    }
}

impl From<&SessionValidationConfig> for SessionValidatorConfig {
    fn from(config: &SessionValidationConfig) -> Self {
        let defaults = Self::default();
        Self {
            mode: SessionValidationMode::from_str(&config.mode).unwrap_or(defaults.mode),
            sample_rate: config.sample_rate.clamp(0.0, 1.0),
            queue_size: if config.queue_size == 0 { defaults.queue_size } else { config.queue_size },
            workers: if config.workers == 0 { defaults.workers } else { config.workers },
            timeout: if config.timeout_seconds == 0 {
                defaults.timeout
            } else {
                Duration::from_secs(config.timeout_seconds)
            },
        }
    }
}

/// One served relay awaiting validation.
#[derive(Debug, Clone)]
pub struct SessionValidationRequest {
    pub request: RelayRequest,
    pub arrival_block_height: u64,
}

/// Result of [`SessionValidator::validate_relay_request`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionVerdict {
    Valid(SessionValidationResult),
    /// Handed to the worker pool; no verdict yet.
    Queued,
    Invalid(ValidationError),
}

pub struct SessionValidator {
    config: SessionValidatorConfig,
    validator: Arc<dyn RelayValidator>,
    sessions: Arc<SessionCache>,
    metrics: Arc<MetricsCollector>,
    suppliers: RwLock<HashSet<String>>,
    queue_tx: mpsc::Sender<SessionValidationRequest>,
    queue_rx: Mutex<Option<mpsc::Receiver<SessionValidationRequest>>>,
    closed: AtomicBool,
    stop_tx: broadcast::Sender<()>,
}

impl SessionValidator {
    pub fn new(
        config: SessionValidatorConfig,
        validator: Arc<dyn RelayValidator>,
        sessions: Arc<SessionCache>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_size.max(1));
        let (stop_tx, _) = broadcast::channel(1);
        Self {
            config,
            validator,
            sessions,
            metrics,
            suppliers: RwLock::new(HashSet::new()),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            closed: AtomicBool::new(false),
            stop_tx,
        }
    }

    #[must_use]
    pub fn mode(&self) -> SessionValidationMode {
        self.config.mode
    }

    /// Replaces the set of supplier operators this relayer serves.
    pub fn set_supplier_addresses(&self, addresses: impl IntoIterator<Item = String>) {
        let addresses: HashSet<String> = addresses.into_iter().collect();
        info!(count = addresses.len(), "updated supplier addresses");
        *self.suppliers.write() = addresses;
    }

    #[must_use]
    pub fn is_known_supplier(&self, operator_address: &str) -> bool {
        self.suppliers.read().contains(operator_address)
    }

    /// Validates per the configured mode.
    ///
    /// # Errors
    ///
    /// Returns a transient [`ValidationError`] (lookup failure or timeout) when no verdict
    /// could be reached.
    pub async fn validate_relay_request(
        &self,
        request: SessionValidationRequest,
    ) -> Result<SessionVerdict, ValidationError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ValidationError::SessionLookup("validator is closed".to_string()));
        }

        match self.config.mode {
            SessionValidationMode::Eager => self.validate_sync(&request).await,
            SessionValidationMode::Lazy => Ok(self.enqueue(request)),
            SessionValidationMode::Sampled => {
                if rand::random::<f64>() < self.config.sample_rate {
                    self.validate_sync(&request).await
                } else {
                    Ok(self.enqueue(request))
                }
            }
        }
    }

    fn enqueue(&self, request: SessionValidationRequest) -> SessionVerdict {
        match self.queue_tx.try_send(request) {
            Ok(()) => self.metrics.record_validation("async", "queued"),
            Err(e) => {
                let request = e.into_inner();
                warn!(session_id = %request.request.session_id(), "async validation queue full, dropping request");
                self.metrics.record_validation_dropped();
            }
        }
        SessionVerdict::Queued
    }

    async fn validate_sync(
        &self,
        request: &SessionValidationRequest,
    ) -> Result<SessionVerdict, ValidationError> {
        let relay = &request.request;
        let Some(header) = relay.session_header() else {
            return Ok(SessionVerdict::Invalid(ValidationError::Basic(
                "missing session header".to_string(),
            )));
        };
        let supplier = relay.meta.supplier_operator_address.as_str();

        if !self.is_known_supplier(supplier) {
            self.metrics.record_validation("sync", "invalid");
            return Ok(SessionVerdict::Invalid(ValidationError::UnknownSupplier(supplier.to_string())));
        }

        if !self.sessions.is_session_rewardable(&header.session_id).await {
            self.metrics.record_validation("sync", "invalid");
            return Ok(SessionVerdict::Invalid(ValidationError::NotRewardable));
        }

        let height = request.arrival_block_height;
        let outcome = match tokio::time::timeout(
            self.config.timeout,
            self.validator.validate_relay_request(relay, height),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(ValidationError::Timeout),
        };

        let mut result = SessionValidationResult {
            app_address: header.application_address.clone(),
            service_id: header.service_id.clone(),
            block_height: height,
            session_id: header.session_id.clone(),
            session_end_height: header.end_height(),
            is_valid: true,
            failure_reason: None,
            validated_at: chrono::Utc::now(),
        };

        match outcome {
            Ok(()) => {
                self.metrics.record_validation("sync", "valid");
                self.record(&result).await;
                Ok(SessionVerdict::Valid(result))
            }
            Err(e) if e.is_transient() => {
                self.metrics.record_validation("sync", "error");
                Err(e)
            }
            Err(e) => {
                self.metrics.record_validation("sync", "invalid");
                result.is_valid = false;
                result.failure_reason = Some(e.to_string());
                self.record(&result).await;
                Ok(SessionVerdict::Invalid(e))
            }
        }
    }

    async fn record(&self, result: &SessionValidationResult) {
        if let Err(e) = self.sessions.set_validation_result(result).await {
            debug!(session_id = %result.session_id, error = %e, "failed to cache validation result");
        }
    }

    /// Marks the session non-rewardable on every instance after a failed validation.
    pub async fn reject_session(&self, session_id: &str, error: &ValidationError) {
        let reason = error.to_string();
        if let Err(err) = self.sessions.mark_session_non_rewardable(session_id, &reason).await {
            warn!(session_id, error = %err, "failed to mark session non-rewardable");
            return;
        }
        warn!(session_id, reason, "relay validation failed, session marked non-rewardable");
    }

    async fn process_queued(&self, request: SessionValidationRequest) {
        let session_id = request.request.session_id().to_string();
        match self.validate_sync(&request).await {
            Ok(SessionVerdict::Invalid(e)) => self.reject_session(&session_id, &e).await,
            Ok(_) => {}
            Err(e) => warn!(session_id, error = %e, "async validation error"),
        }
    }

    /// Spawns the worker pool. Workers exit on shutdown or [`close`](Self::close).
    ///
    /// Calling `start` twice returns no new workers.
    pub fn start(self: &Arc<Self>, shutdown_rx: broadcast::Receiver<()>) -> Vec<JoinHandle<()>> {
        let Some(queue_rx) = self.queue_rx.lock().take() else {
            warn!("session validator already started");
            return Vec::new();
        };
        let queue_rx = Arc::new(tokio::sync::Mutex::new(queue_rx));

        let handles = (0..self.config.workers)
            .map(|worker| {
                let validator = Arc::clone(self);
                let queue_rx = Arc::clone(&queue_rx);
                let mut shutdown_rx = shutdown_rx.resubscribe();
                let mut stop_rx = self.stop_tx.subscribe();

                tokio::spawn(async move {
                    loop {
                        let next = tokio::select! {
                            biased;

                            _ = shutdown_rx.recv() => break,
                            _ = stop_rx.recv() => break,

                            next = async { queue_rx.lock().await.recv().await } => next,
                        };
                        match next {
                            Some(request) => validator.process_queued(request).await,
                            None => break,
                        }
                    }
                    debug!(worker, "session validation worker stopped");
                })
            })
            .collect();

        info!(
            workers = self.config.workers,
            mode = ?self.config.mode,
            sample_rate = self.config.sample_rate,
            "session validator started"
        );
        handles
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.stop_tx.send(());
            info!("session validator closed");
        }
    }
}
