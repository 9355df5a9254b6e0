//! # Metrics Architecture
//!
//! A single [`MetricsCollector`] is constructed at startup and handed to every component as
//! `Arc<MetricsCollector>`. Components never touch metric macros directly; each observable
//! event has a named `record_*` method with an explicit label set, so the full metric surface
//! is listed in one place.
//!
//! ## Exposition
//!
//! Metrics are recorded through the `metrics` facade and rendered in Prometheus text format
//! by [`MetricsCollector::get_prometheus_metrics`].
//!
//! ## Metric Families
//!
//! | Prefix | Covers |
//! |--------|--------|
//! | `ha_cache_*` | L1/L2 hits, misses, chain queries, invalidations |
//! | `ha_block_*` | current height, dropped block events |
//! | `ha_relays_*` | received, served, rejected, published, dropped, difficulty skips |
//! | `ha_meter_*` | over-serviced relays, active metered sessions |
//! | `ha_backend_*` | backend health status and checks |
//! | `ha_validation_*` | relay validation outcomes and queue drops |
//! | `ha_stream_*` | consumer reads, acks, reclaims, poison messages |

use crate::{proxy::errors::ProxyError, upstream::errors::UpstreamError};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Maps an error or state onto a stable metric label and a severity gauge value.
pub trait MetricsState {
    fn as_metric_str(&self) -> &'static str;
    fn as_gauge_value(&self) -> f64;
}

impl MetricsState for UpstreamError {
    fn as_metric_str(&self) -> &'static str {
        match self {
            Self::NoBackend(_) => "no_backend",
            Self::Timeout => "timeout",
            Self::ConnectionFailed(_) => "connection_failed",
            Self::Network(_) => "network_error",
            Self::InvalidRequest(_) => "invalid_request",
            Self::InvalidResponse(_) => "invalid_response",
            Self::ResponseTooLarge(_) => "response_too_large",
            Self::WebSocket(_) => "websocket_error",
        }
    }

    fn as_gauge_value(&self) -> f64 {
        match self {
            Self::InvalidRequest(_) | Self::ResponseTooLarge(_) => 0.5,
            _ => 1.0,
        }
    }
}

impl MetricsState for ProxyError {
    fn as_metric_str(&self) -> &'static str {
        match self {
            Self::BodyTooLarge | Self::ServiceBodyTooLarge => "body_too_large",
            Self::InvalidRelayRequest => "invalid_relay_request",
            Self::MissingServiceId => "missing_service_id",
            Self::UnknownService(_) => "unknown_service",
            Self::SupplierNotRegistered(_) => "supplier_not_registered",
            Self::SupplierInactive { .. } => "supplier_inactive",
            Self::SupplierNoServices(_) => "supplier_no_services",
            Self::SupplierWrongService { .. } => "supplier_wrong_service",
            Self::BackendUnhealthy => "backend_unhealthy",
            Self::ValidationFailed(_) => "validation_failed",
            Self::OverServiced => "over_serviced",
            Self::Backend(_) => "backend_error",
            Self::Signing(_) => "signing_failed",
            Self::Internal(_) => "internal_error",
        }
    }

    fn as_gauge_value(&self) -> f64 {
        match self {
            Self::Backend(_) | Self::Signing(_) | Self::Internal(_) | Self::BackendUnhealthy => 1.0,
            _ => 0.5,
        }
    }
}

fn try_init_prometheus_recorder(
) -> Result<PrometheusHandle, metrics_exporter_prometheus::BuildError> {
    PrometheusBuilder::new().install_recorder()
}

fn init_prometheus_recorder() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| match try_init_prometheus_recorder() {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    "failed to install primary Prometheus recorder, attempting fallback"
                );
                let recorder = PrometheusBuilder::new().build_recorder();
                tracing::warn!(
                    "using fallback Prometheus recorder (install error: {e}) - metrics may not be globally visible"
                );
                recorder.handle()
            }
        })
        .clone()
}

pub struct MetricsCollector {
    prometheus_handle: PrometheusHandle,
}

impl MetricsCollector {
    /// # Errors
    ///
    /// Returns an error if the Prometheus recorder cannot be initialized.
    pub fn new() -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Self { prometheus_handle: init_prometheus_recorder() })
    }

    // Cache layer

    pub fn record_cache_hit(&self, cache: &'static str, level: &'static str) {
        counter!("ha_cache_hits_total", "cache" => cache, "level" => level).increment(1);
    }

    pub fn record_cache_miss(&self, cache: &'static str, level: &'static str) {
        counter!("ha_cache_misses_total", "cache" => cache, "level" => level).increment(1);
    }

    pub fn record_chain_query(&self, cache: &'static str, success: bool) {
        if success {
            counter!("ha_cache_chain_queries_total", "cache" => cache).increment(1);
        } else {
            counter!("ha_cache_chain_query_errors_total", "cache" => cache).increment(1);
        }
    }

    pub fn record_cache_invalidation(&self, cache: &'static str, source: &'static str) {
        counter!("ha_cache_invalidations_total", "cache" => cache, "source" => source).increment(1);
    }

    pub fn record_session_non_rewardable(&self, reason: &str) {
        counter!("ha_cache_sessions_marked_non_rewardable_total", "reason" => reason.to_string())
            .increment(1);
    }

    pub fn record_supplier_cache_fail_open(&self) {
        counter!("ha_cache_supplier_fail_open_total").increment(1);
    }

    // Block height

    #[allow(clippy::cast_precision_loss)]
    pub fn record_block_height(&self, height: u64) {
        gauge!("ha_block_current_height").set(height as f64);
    }

    pub fn record_block_event_dropped(&self) {
        counter!("ha_block_events_dropped_total").increment(1);
    }

    pub fn record_block_event_published(&self) {
        counter!("ha_block_events_published_total").increment(1);
    }

    // Relay pipeline

    pub fn record_relay_received(&self, service_id: &str, protocol: &'static str) {
        counter!("ha_relays_received_total", "service_id" => service_id.to_string(), "protocol" => protocol)
            .increment(1);
    }

    pub fn record_relay_served(&self, service_id: &str, protocol: &'static str, latency_secs: f64) {
        counter!("ha_relays_served_total", "service_id" => service_id.to_string(), "protocol" => protocol)
            .increment(1);
        histogram!("ha_relay_duration_seconds", "service_id" => service_id.to_string(), "protocol" => protocol)
            .record(latency_secs);
    }

    pub fn record_relay_rejected(&self, service_id: &str, error: &ProxyError) {
        counter!(
            "ha_relays_rejected_total",
            "service_id" => service_id.to_string(),
            "reason" => error.as_metric_str()
        )
        .increment(1);
    }

    pub fn record_backend_error(&self, service_id: &str, error: &UpstreamError) {
        counter!(
            "ha_backend_errors_total",
            "service_id" => service_id.to_string(),
            "error_type" => error.as_metric_str()
        )
        .increment(1);
    }

    pub fn record_relay_published(&self, service_id: &str) {
        counter!("ha_relays_published_total", "service_id" => service_id.to_string()).increment(1);
    }

    pub fn record_relay_publish_error(&self, service_id: &str) {
        counter!("ha_relays_publish_errors_total", "service_id" => service_id.to_string())
            .increment(1);
    }

    pub fn record_relay_dropped(&self, service_id: &str) {
        counter!("ha_relays_dropped_total", "service_id" => service_id.to_string()).increment(1);
    }

    pub fn record_relay_skipped_difficulty(&self, service_id: &str) {
        counter!("ha_relays_skipped_difficulty_total", "service_id" => service_id.to_string())
            .increment(1);
    }

    pub fn record_relay_mined(&self, service_id: &str) {
        counter!("ha_relays_mined_total", "service_id" => service_id.to_string()).increment(1);
    }

    pub fn record_streaming_response(&self, service_id: &str) {
        counter!("ha_relays_streaming_total", "service_id" => service_id.to_string()).increment(1);
    }

    pub fn record_websocket_connection(&self, service_id: &str, connected: bool) {
        if connected {
            gauge!("ha_websocket_connections", "service_id" => service_id.to_string()).increment(1.0);
        } else {
            gauge!("ha_websocket_connections", "service_id" => service_id.to_string()).decrement(1.0);
        }
    }

    pub fn record_grpc_request(&self, method: &str, code: &'static str) {
        counter!("ha_grpc_requests_total", "method" => method.to_string(), "code" => code)
            .increment(1);
    }

    // Relay meter

    pub fn record_over_serviced(&self, service_id: &str, allowed: bool) {
        counter!(
            "ha_meter_over_serviced_total",
            "service_id" => service_id.to_string(),
            "allowed" => if allowed { "true" } else { "false" }
        )
        .increment(1);
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn record_meter_active_sessions(&self, count: usize) {
        gauge!("ha_meter_active_sessions").set(count as f64);
    }

    // Backend health

    pub fn record_backend_health(&self, backend: &str, healthy: bool) {
        gauge!("ha_backend_healthy", "backend" => backend.to_string())
            .set(if healthy { 1.0 } else { 0.0 });
    }

    pub fn record_health_check(&self, backend: &str, success: bool) {
        counter!(
            "ha_backend_health_checks_total",
            "backend" => backend.to_string(),
            "success" => if success { "true" } else { "false" }
        )
        .increment(1);
    }

    // Validation

    pub fn record_validation(&self, mode: &'static str, outcome: &'static str) {
        counter!("ha_validation_total", "mode" => mode, "outcome" => outcome).increment(1);
    }

    pub fn record_validation_dropped(&self) {
        counter!("ha_validation_dropped_total").increment(1);
    }

    // Stream transport

    pub fn record_stream_read(&self, stream: &str, count: usize) {
        counter!("ha_stream_messages_read_total", "stream" => stream.to_string())
            .increment(count as u64);
    }

    pub fn record_stream_acked(&self, stream: &str, count: u64) {
        counter!("ha_stream_messages_acked_total", "stream" => stream.to_string()).increment(count);
    }

    pub fn record_stream_claimed(&self, stream: &str, count: usize) {
        counter!("ha_stream_messages_claimed_total", "stream" => stream.to_string())
            .increment(count as u64);
    }

    pub fn record_stream_poison(&self, stream: &str) {
        counter!("ha_stream_poison_messages_total", "stream" => stream.to_string()).increment(1);
    }

    /// Prometheus text exposition of everything recorded so far.
    #[must_use]
    pub fn get_prometheus_metrics(&self) -> String {
        self.prometheus_handle.render()
    }
}
