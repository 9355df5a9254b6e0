use super::errors::UpstreamError;
use crate::{config::BackendHealthCheckConfig, metrics::MetricsCollector};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::broadcast, task::JoinHandle, time::interval};
use tracing::{debug, info, warn};
use url::Url;

const DEFAULT_UNHEALTHY_THRESHOLD: u32 = 3;
const DEFAULT_HEALTHY_THRESHOLD: u32 = 2;
const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Health of one backend.
///
/// Transitions:
/// - `Unknown` -> `Healthy`: `healthy_threshold` consecutive successes
/// - `Unknown`/`Healthy` -> `Unhealthy`: `unhealthy_threshold` consecutive failures
/// - `Unhealthy` -> `Healthy`: `healthy_threshold` consecutive successes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HealthStatus {
    /// Not checked yet. Treated as healthy so startup never blocks traffic.
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

impl HealthStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
        }
    }
}

/// Point-in-time copy of a backend's health.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendHealth {
    pub backend_id: String,
    pub backend_url: String,
    pub status: HealthStatus,
    pub last_check: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
}

impl BackendHealth {
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.status != HealthStatus::Unhealthy
    }
}

#[derive(Debug, Default)]
struct HealthCounters {
    status: HealthStatus,
    last_check: Option<DateTime<Utc>>,
    last_error: Option<String>,
    consecutive_failures: u32,
    consecutive_successes: u32,
}

struct TrackedBackend {
    url: String,
    config: Option<BackendHealthCheckConfig>,
    counters: Mutex<HealthCounters>,
}

impl TrackedBackend {
    fn snapshot(&self, backend_id: &str) -> BackendHealth {
        let counters = self.counters.lock();
        BackendHealth {
            backend_id: backend_id.to_string(),
            backend_url: self.url.clone(),
            status: counters.status,
            last_check: counters.last_check,
            last_error: counters.last_error.clone(),
            consecutive_failures: counters.consecutive_failures,
            consecutive_successes: counters.consecutive_successes,
        }
    }

    fn unhealthy_threshold(&self) -> u32 {
        self.config
            .as_ref()
            .map(|c| c.unhealthy_threshold)
            .filter(|t| *t > 0)
            .unwrap_or(DEFAULT_UNHEALTHY_THRESHOLD)
    }

    fn healthy_threshold(&self) -> u32 {
        self.config
            .as_ref()
            .map(|c| c.healthy_threshold)
            .filter(|t| *t > 0)
            .unwrap_or(DEFAULT_HEALTHY_THRESHOLD)
    }
}

/// Identifier under which a service's backend for one RPC type is tracked.
#[must_use]
pub fn backend_id(service_id: &str, rpc_type: &str) -> String {
    format!("{service_id}/{rpc_type}")
}

/// Joins `path` onto `base`'s path with exactly one slash between them.
///
/// # Errors
///
/// Returns [`UpstreamError::InvalidRequest`] if `base` is not a URL.
pub fn join_url_path(base: &str, path: &str) -> Result<String, UpstreamError> {
    let mut url =
        Url::parse(base).map_err(|e| UpstreamError::InvalidRequest(format!("invalid backend URL: {e}")))?;
    let base_path = url.path().trim_end_matches('/').to_string();
    let suffix = path.trim_start_matches('/');
    url.set_path(&format!("{base_path}/{suffix}"));
    Ok(url.to_string())
}

/// Actively probes backends and tracks their health.
///
/// Each backend with health checking enabled gets its own ticking loop issuing a `GET` to its
/// endpoint. Backends registered without a check stay `Unknown`, which counts as healthy.
pub struct HealthChecker {
    client: reqwest::Client,
    backends: DashMap<String, Arc<TrackedBackend>>,
    metrics: Arc<MetricsCollector>,
    closed: AtomicBool,
    stop_tx: broadcast::Sender<()>,
}

impl HealthChecker {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(metrics: Arc<MetricsCollector>) -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(UpstreamError::Network)?;
        let (stop_tx, _) = broadcast::channel(1);
        Ok(Self { client, backends: DashMap::new(), metrics, closed: AtomicBool::new(false), stop_tx })
    }

    pub fn register_backend(
        &self,
        backend_id: &str,
        backend_url: &str,
        config: Option<BackendHealthCheckConfig>,
    ) {
        let enabled = config.as_ref().is_some_and(|c| c.enabled);
        self.backends.insert(
            backend_id.to_string(),
            Arc::new(TrackedBackend {
                url: backend_url.to_string(),
                config,
                counters: Mutex::new(HealthCounters::default()),
            }),
        );
        info!(backend_id, backend_url, health_check_enabled = enabled, "registered backend");
    }

    /// Unregistered backends are assumed healthy.
    #[must_use]
    pub fn is_healthy(&self, backend_id: &str) -> bool {
        self.backends
            .get(backend_id)
            .map_or(true, |b| b.counters.lock().status != HealthStatus::Unhealthy)
    }

    #[must_use]
    pub fn get_health(&self, backend_id: &str) -> Option<BackendHealth> {
        self.backends.get(backend_id).map(|b| b.snapshot(backend_id))
    }

    #[must_use]
    pub fn get_all_health(&self) -> HashMap<String, BackendHealth> {
        self.backends.iter().map(|e| (e.key().clone(), e.value().snapshot(e.key()))).collect()
    }

    /// Runs one check for `backend_id` immediately.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError::InvalidRequest`] if the backend has no health check config.
    pub async fn check_now(&self, backend_id: &str) -> Result<(), UpstreamError> {
        let backend = self.backends.get(backend_id).map(|b| Arc::clone(b.value()));
        match backend {
            Some(backend) if backend.config.is_some() => {
                self.check_backend(backend_id, &backend).await;
                Ok(())
            }
            _ => Err(UpstreamError::InvalidRequest(format!(
                "no health check config for backend {backend_id}"
            ))),
        }
    }

    async fn probe(&self, backend: &TrackedBackend) -> Result<(), String> {
        let config = backend.config.clone().unwrap_or_default();
        let url = join_url_path(&backend.url, &config.endpoint).map_err(|e| e.to_string())?;
        let timeout = if config.timeout_seconds == 0 {
            DEFAULT_CHECK_TIMEOUT
        } else {
            Duration::from_secs(config.timeout_seconds)
        };

        let response = self
            .client
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("unhealthy status code: {}", status.as_u16()));
        }
        Ok(())
    }

    async fn check_backend(&self, backend_id: &str, backend: &TrackedBackend) {
        match self.probe(backend).await {
            Ok(()) => self.record_success(backend_id, backend),
            Err(e) => self.record_failure(backend_id, backend, e),
        }
    }

    fn record_failure(&self, backend_id: &str, backend: &TrackedBackend, error: String) {
        let threshold = backend.unhealthy_threshold();
        let mut counters = backend.counters.lock();
        counters.last_check = Some(Utc::now());
        counters.consecutive_successes = 0;
        counters.consecutive_failures += 1;

        if counters.consecutive_failures >= threshold && counters.status != HealthStatus::Unhealthy {
            counters.status = HealthStatus::Unhealthy;
            warn!(
                backend_id,
                backend_url = %backend.url,
                error = %error,
                consecutive_failures = counters.consecutive_failures,
                "backend became unhealthy"
            );
            self.metrics.record_backend_health(backend_id, false);
        }
        counters.last_error = Some(error);
        drop(counters);

        self.metrics.record_health_check(backend_id, false);
    }

    fn record_success(&self, backend_id: &str, backend: &TrackedBackend) {
        let threshold = backend.healthy_threshold();
        let mut counters = backend.counters.lock();
        counters.last_check = Some(Utc::now());
        counters.last_error = None;
        counters.consecutive_failures = 0;
        counters.consecutive_successes += 1;

        if counters.consecutive_successes >= threshold && counters.status != HealthStatus::Healthy {
            counters.status = HealthStatus::Healthy;
            info!(
                backend_id,
                backend_url = %backend.url,
                consecutive_successes = counters.consecutive_successes,
                "backend became healthy"
            );
            self.metrics.record_backend_health(backend_id, true);
        }
        drop(counters);

        self.metrics.record_health_check(backend_id, true);
    }

    /// Spawns one check loop per backend with health checking enabled.
    ///
    /// Each loop checks immediately, then every `interval_seconds`.
    pub fn start(self: &Arc<Self>, shutdown_rx: broadcast::Receiver<()>) -> Vec<JoinHandle<()>> {
        let enabled: Vec<(String, Arc<TrackedBackend>, u64)> = self
            .backends
            .iter()
            .filter_map(|e| {
                let config = e.value().config.as_ref()?;
                config.enabled.then(|| (e.key().clone(), Arc::clone(e.value()), config.interval_seconds.max(1)))
            })
            .collect();

        let handles = enabled
            .into_iter()
            .map(|(backend_id, backend, every)| {
                let checker = Arc::clone(self);
                let mut shutdown_rx = shutdown_rx.resubscribe();
                let mut stop_rx = self.stop_tx.subscribe();

                tokio::spawn(async move {
                    let mut ticker = interval(Duration::from_secs(every));
                    loop {
                        tokio::select! {
                            biased;

                            _ = shutdown_rx.recv() => break,
                            _ = stop_rx.recv() => break,

                            _ = ticker.tick() => {
                                checker.check_backend(&backend_id, &backend).await;
                            }
                        }
                    }
                    debug!(backend_id, "health check loop stopped");
                })
            })
            .collect::<Vec<_>>();

        info!(loops = handles.len(), "health checker started");
        handles
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.stop_tx.send(());
            info!("health checker closed");
        }
    }
}
