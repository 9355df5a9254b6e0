//! Relayer configuration with layered loading.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded in this order (later overrides earlier):
//!
//! 1. **Compiled defaults**: `serde(default = ...)` functions and `Default` impls
//! 2. **Config file**: TOML file specified by the `RELAYER_CONFIG` env var
//! 3. **Environment variables**: `RELAYER__*` env vars override specific fields
//!
//! # Configuration Sections
//!
//! - [`RedisConfig`]: shared substrate connection and stream naming
//! - [`ServiceConfig`]: per-service validation mode, limits and backends
//! - [`BackendConfig`]: backend URL, header overrides, auth and health checks
//! - [`SupplierCacheConfig`], [`CacheTimingConfig`]: cache layer tuning
//! - [`RelayMeterConfig`], [`SessionValidationConfig`]: relay pipeline knobs
//! - [`MetricsConfig`], [`HealthCheckConfig`], [`LoggingConfig`]: operations
//!
//! # Example
//!
//! ```toml
//! listen_addr = "0.0.0.0:8080"
//! default_validation_mode = "optimistic"
//!
//! [redis]
//! url = "redis://localhost:6379"
//!
//! [keys]
//! pokt1supplier = "0f3c...hex private key..."
//!
//! [services.anvil]
//! validation_mode = "eager"
//!
//! [services.anvil.backends.json_rpc]
//! url = "http://localhost:8545"
//!
//! [services.anvil.backends.json_rpc.health_check]
//! enabled = true
//! endpoint = "/health"
//! interval_seconds = 10
//! ```

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, path::Path, str::FromStr, time::Duration};

/// Default maximum relay body size (10 MiB).
pub const DEFAULT_MAX_BODY_SIZE_BYTES: u64 = 10 * 1024 * 1024;

/// Default per-service request timeout.
pub const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 30;

/// When the relay request is validated relative to forwarding it to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    /// Validate before forwarding; failures never reach the backend.
    Eager,
    /// Forward immediately, validate after responding.
    Optimistic,
}

impl ValidationMode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eager => "eager",
            Self::Optimistic => "optimistic",
        }
    }
}

impl fmt::Display for ValidationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValidationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "eager" => Ok(Self::Eager),
            "optimistic" => Ok(Self::Optimistic),
            other => Err(other.to_string()),
        }
    }
}

/// Shared substrate connection and relay stream naming.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Prefix for per-supplier relay streams; cache and pub/sub prefixes derive from it.
    #[serde(default = "default_stream_prefix")]
    pub stream_prefix: String,

    /// Approximate cap on each relay stream's length.
    #[serde(default = "default_max_stream_len")]
    pub max_stream_len: u64,
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_stream_prefix() -> String {
    "ha:relays".to_string()
}

fn default_max_stream_len() -> u64 {
    100_000
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            stream_prefix: default_stream_prefix(),
            max_stream_len: default_max_stream_len(),
        }
    }
}

impl RedisConfig {
    /// Key prefix for the cache layer (`<stream_prefix>:cache`).
    #[must_use]
    pub fn cache_prefix(&self) -> String {
        format!("{}:cache", self.stream_prefix)
    }

    /// Channel prefix for cache and block pub/sub (`<stream_prefix>:events`).
    #[must_use]
    pub fn pubsub_prefix(&self) -> String {
        format!("{}:events", self.stream_prefix)
    }
}

/// Chain node endpoints used by the chain query client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PocketNodeConfig {
    /// CometBFT RPC endpoint, used for the latest block.
    #[serde(default)]
    pub query_node_rpc_url: String,

    /// REST (gRPC gateway) endpoint, used for module queries.
    #[serde(default)]
    pub query_node_rest_url: String,

    #[serde(default = "default_query_timeout_seconds")]
    pub query_timeout_seconds: u64,
}

fn default_query_timeout_seconds() -> u64 {
    10
}

/// HTTP Basic or Bearer credentials applied to a backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendAuth {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub bearer_token: Option<String>,
}

/// Active health checking for one backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendHealthCheckConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Path joined onto the backend URL.
    #[serde(default)]
    pub endpoint: String,

    #[serde(default = "default_health_interval_seconds")]
    pub interval_seconds: u64,

    #[serde(default = "default_health_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Consecutive failures before the backend is marked unhealthy (0 = default of 3).
    #[serde(default)]
    pub unhealthy_threshold: u32,

    /// Consecutive successes before the backend is marked healthy (0 = default of 2).
    #[serde(default)]
    pub healthy_threshold: u32,
}

fn default_health_interval_seconds() -> u64 {
    10
}

fn default_health_timeout_seconds() -> u64 {
    5
}

impl Default for BackendHealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: String::new(),
            interval_seconds: default_health_interval_seconds(),
            timeout_seconds: default_health_timeout_seconds(),
            unhealthy_threshold: 0,
            healthy_threshold: 0,
        }
    }
}

/// One backend for an RPC type (`json_rpc`, `rest`, `websocket`, `grpc`, `comet_bft`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendConfig {
    pub url: String,

    /// Headers set on every forwarded request, replacing any client value.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    #[serde(default)]
    pub authentication: Option<BackendAuth>,

    #[serde(default)]
    pub health_check: Option<BackendHealthCheckConfig>,
}

/// Per-service relay handling.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// `eager` or `optimistic`; falls back to `default_validation_mode`.
    #[serde(default)]
    pub validation_mode: Option<String>,

    #[serde(default)]
    pub request_timeout_seconds: Option<u64>,

    #[serde(default)]
    pub max_body_size_bytes: Option<u64>,

    /// Backends keyed by RPC type.
    #[serde(default)]
    pub backends: HashMap<String, BackendConfig>,
}

/// Supplier state cache policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupplierCacheConfig {
    #[serde(default = "default_supplier_key_prefix")]
    pub key_prefix: String,

    /// Serve traffic when the supplier cache cannot be read.
    #[serde(default = "default_true")]
    pub fail_open: bool,
}

fn default_supplier_key_prefix() -> String {
    "ha:supplier".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for SupplierCacheConfig {
    fn default() -> Self {
        Self { key_prefix: default_supplier_key_prefix(), fail_open: true }
    }
}

/// Block timing used for cache TTLs and population locks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheTimingConfig {
    #[serde(default = "default_block_time_seconds")]
    pub block_time_seconds: u64,

    /// Shared-parameter TTL in blocks.
    #[serde(default = "default_ttl_blocks")]
    pub ttl_blocks: u64,

    #[serde(default = "default_lock_timeout_seconds")]
    pub lock_timeout_seconds: u64,
}

fn default_block_time_seconds() -> u64 {
    6
}

fn default_ttl_blocks() -> u64 {
    1
}

fn default_lock_timeout_seconds() -> u64 {
    5
}

impl Default for CacheTimingConfig {
    fn default() -> Self {
        Self {
            block_time_seconds: default_block_time_seconds(),
            ttl_blocks: default_ttl_blocks(),
            lock_timeout_seconds: default_lock_timeout_seconds(),
        }
    }
}

/// Stake-based relay metering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayMeterConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Keep serving relays past the application's stake allowance.
    #[serde(default = "default_true")]
    pub over_servicing_enabled: bool,

    #[serde(default = "default_meter_cleanup_interval_seconds")]
    pub cleanup_interval_seconds: u64,
}

fn default_meter_cleanup_interval_seconds() -> u64 {
    30
}

impl Default for RelayMeterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            over_servicing_enabled: true,
            cleanup_interval_seconds: default_meter_cleanup_interval_seconds(),
        }
    }
}

/// Background (post-response) session validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionValidationConfig {
    /// `eager` validates inline, `lazy` queues every relay for the worker pool, `sampled`
    /// validates a random fraction inline and queues the rest.
    #[serde(default = "default_session_validation_mode")]
    pub mode: String,

    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,

    #[serde(default = "default_validation_queue_size")]
    pub queue_size: usize,

    #[serde(default = "default_validation_workers")]
    pub workers: usize,

    #[serde(default = "default_validation_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_session_validation_mode() -> String {
    "eager".to_string()
}

fn default_sample_rate() -> f64 {
    0.1
}

fn default_validation_queue_size() -> usize {
    10_000
}

fn default_validation_workers() -> usize {
    4
}

fn default_validation_timeout_seconds() -> u64 {
    5
}

impl Default for SessionValidationConfig {
    fn default() -> Self {
        Self {
            mode: default_session_validation_mode(),
            sample_rate: default_sample_rate(),
            queue_size: default_validation_queue_size(),
            workers: default_validation_workers(),
            timeout_seconds: default_validation_timeout_seconds(),
        }
    }
}

/// Prometheus exposition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_metrics_addr")]
    pub addr: String,
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9090".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true, addr: default_metrics_addr() }
    }
}

/// Operational health listener (separate from the relay port).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_health_addr")]
    pub addr: String,
}

fn default_health_addr() -> String {
    "0.0.0.0:8081".to_string()
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self { enabled: true, addr: default_health_addr() }
    }
}

/// Log level and format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// `json` or `pretty`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level(), format: default_log_format() }
    }
}

/// Top-level relayer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub pocket_node: PocketNodeConfig,

    #[serde(default)]
    pub services: HashMap<String, ServiceConfig>,

    #[serde(default = "default_validation_mode")]
    pub default_validation_mode: String,

    #[serde(default = "default_request_timeout_seconds")]
    pub default_request_timeout_seconds: u64,

    #[serde(default = "default_max_body_size_bytes")]
    pub default_max_body_size_bytes: u64,

    /// Blocks tolerated past the on-chain grace period.
    #[serde(default = "default_grace_period_extra_blocks")]
    pub grace_period_extra_blocks: u64,

    /// Supplier used when a relay does not name one.
    #[serde(default)]
    pub supplier_operator_address: Option<String>,

    /// Hex-encoded secp256k1 signing keys by supplier operator address.
    #[serde(default)]
    pub keys: HashMap<String, String>,

    /// Run the elected block watcher on this instance.
    #[serde(default = "default_true")]
    pub block_watcher_enabled: bool,

    #[serde(default)]
    pub supplier_cache: SupplierCacheConfig,

    #[serde(default)]
    pub cache: CacheTimingConfig,

    #[serde(default)]
    pub relay_meter: RelayMeterConfig,

    #[serde(default)]
    pub session_validation: SessionValidationConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub health_check: HealthCheckConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_validation_mode() -> String {
    "optimistic".to_string()
}

fn default_request_timeout_seconds() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECONDS
}

fn default_max_body_size_bytes() -> u64 {
    DEFAULT_MAX_BODY_SIZE_BYTES
}

fn default_grace_period_extra_blocks() -> u64 {
    2
}

impl Default for RelayerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            redis: RedisConfig::default(),
            pocket_node: PocketNodeConfig::default(),
            services: HashMap::new(),
            default_validation_mode: default_validation_mode(),
            default_request_timeout_seconds: default_request_timeout_seconds(),
            default_max_body_size_bytes: default_max_body_size_bytes(),
            grace_period_extra_blocks: default_grace_period_extra_blocks(),
            supplier_operator_address: None,
            keys: HashMap::new(),
            block_watcher_enabled: true,
            supplier_cache: SupplierCacheConfig::default(),
            cache: CacheTimingConfig::default(),
            relay_meter: RelayMeterConfig::default(),
            session_validation: SessionValidationConfig::default(),
            metrics: MetricsConfig::default(),
            health_check: HealthCheckConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl RelayerConfig {
    /// Loads configuration from a TOML file with environment variable overrides.
    ///
    /// Environment variables with the `RELAYER__` prefix override any value, using `__` as
    /// the separator for nested fields (e.g. `RELAYER__REDIS__URL=redis://cache:6379`).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, parsed, or deserialized.
    pub fn from_file<P: AsRef<Path>>(config_path: P) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::with_name(&config_path.as_ref().to_string_lossy()).required(false))
            .add_source(Environment::with_prefix("RELAYER").separator("__"))
            .build()?
            .try_deserialize()
    }

    /// Loads configuration from `config/relayer.toml`, overridable with `RELAYER_CONFIG`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration cannot be loaded or parsed.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("RELAYER_CONFIG").unwrap_or_else(|_| "config/relayer.toml".to_string());
        Self::from_file(&config_path)
    }

    /// Validates the configuration. Any error here aborts startup.
    ///
    /// # Errors
    ///
    /// Returns a descriptive error string naming the offending field.
    pub fn validate(&self) -> Result<(), String> {
        if self.listen_addr.is_empty() {
            return Err("listen_addr is required".to_string());
        }
        if self.redis.url.is_empty() {
            return Err("redis.url is required".to_string());
        }
        if self.services.is_empty() {
            return Err("at least one service must be configured".to_string());
        }
        if ValidationMode::from_str(&self.default_validation_mode).is_err() {
            return Err(format!("invalid default_validation_mode: {}", self.default_validation_mode));
        }

        for (service_id, service) in &self.services {
            if service.backends.is_empty() {
                return Err(format!(
                    "service[{service_id}].backends is required: at least one backend type must be configured"
                ));
            }
            if let Some(mode) = &service.validation_mode {
                if ValidationMode::from_str(mode).is_err() {
                    return Err(format!("service[{service_id}].validation_mode is invalid: {mode}"));
                }
            }

            for (rpc_type, backend) in &service.backends {
                if backend.url.is_empty() {
                    return Err(format!("service[{service_id}].backends[{rpc_type}].url is required"));
                }
                if url::Url::parse(&backend.url).is_err() {
                    return Err(format!(
                        "service[{service_id}].backends[{rpc_type}].url is invalid: {}",
                        backend.url
                    ));
                }
                if let Some(hc) = backend.health_check.as_ref().filter(|hc| hc.enabled) {
                    if hc.endpoint.is_empty() {
                        return Err(format!(
                            "service[{service_id}].backends[{rpc_type}].health_check.endpoint is required when enabled"
                        ));
                    }
                    if hc.interval_seconds == 0 {
                        return Err(format!(
                            "service[{service_id}].backends[{rpc_type}].health_check.interval_seconds must be positive"
                        ));
                    }
                }
            }
        }

        if !(0.0..=1.0).contains(&self.session_validation.sample_rate) {
            return Err("session_validation.sample_rate must be between 0 and 1".to_string());
        }
        if !matches!(self.session_validation.mode.as_str(), "eager" | "lazy" | "sampled") {
            return Err(format!(
                "session_validation.mode is invalid: {}",
                self.session_validation.mode
            ));
        }
        if self.cache.block_time_seconds == 0 {
            return Err("cache.block_time_seconds must be positive".to_string());
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            return Err(format!("logging.format must be json or pretty: {}", self.logging.format));
        }

        Ok(())
    }

    /// Validation mode for a service, falling back to the default.
    #[must_use]
    pub fn service_validation_mode(&self, service_id: &str) -> ValidationMode {
        let default =
            ValidationMode::from_str(&self.default_validation_mode).unwrap_or(ValidationMode::Optimistic);
        self.services
            .get(service_id)
            .and_then(|s| s.validation_mode.as_deref())
            .and_then(|m| ValidationMode::from_str(m).ok())
            .unwrap_or(default)
    }

    /// Backend request timeout for a service.
    #[must_use]
    pub fn service_timeout(&self, service_id: &str) -> Duration {
        let secs = self
            .services
            .get(service_id)
            .and_then(|s| s.request_timeout_seconds)
            .filter(|t| *t > 0)
            .unwrap_or(if self.default_request_timeout_seconds > 0 {
                self.default_request_timeout_seconds
            } else {
                DEFAULT_REQUEST_TIMEOUT_SECONDS
            });
        Duration::from_secs(secs)
    }

    /// Maximum relay body size for a service.
    #[must_use]
    pub fn service_max_body_size(&self, service_id: &str) -> u64 {
        self.services
            .get(service_id)
            .and_then(|s| s.max_body_size_bytes)
            .filter(|b| *b > 0)
            .unwrap_or(self.default_max_body_size_bytes)
    }

    /// Backend configured for `rpc_type` on a service.
    #[must_use]
    pub fn backend(&self, service_id: &str, rpc_type: &str) -> Option<&BackendConfig> {
        self.services.get(service_id).and_then(|s| s.backends.get(rpc_type))
    }

    #[must_use]
    pub fn block_time(&self) -> Duration {
        Duration::from_secs(self.cache.block_time_seconds)
    }
}
