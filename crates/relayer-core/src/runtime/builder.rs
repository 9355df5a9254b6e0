//! Builder that wires every relayer component from a [`RelayerConfig`].

use crate::{
    cache::{BlockHeightSubscriber, BlockHeightWatcher, CacheBackend, CacheConfig, SessionCache,
        SharedParamCache, SupplierCache},
    chain::{
        AccountQueryClient, ApplicationQueryClient, BlockHeightState, BlockQueryClient, ChainError,
        RestChainClient, ServiceQueryClient, SessionQueryClient, SharedQueryClient,
    },
    config::RelayerConfig,
    metrics::MetricsCollector,
    proxy::{PublishQueue, RelayProxy},
    relay::{
        CachedComputeUnitsProvider, CachedDifficultyProvider, EcdsaRingVerifier, RelayMeter,
        RelayMeterSettings, RelayProcessor, ResponseSigner, SessionRelayValidator,
        SessionValidator, SessionValidatorConfig, ValidatorConfig,
    },
    store::{KvStore, MemoryStore, PubSub, RedisStore, StoreError, StreamStore},
    transport::{PublisherConfig, StreamPublisher},
    upstream::{backend_id, HealthChecker},
};
use rand::Rng;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{lifecycle::RelayerRuntime, RelayerComponents};

/// `redis.url` scheme that selects the in-process substrate.
pub const MEMORY_STORE_URL: &str = "memory://";

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Failed to initialize metrics collector: {0}")]
    MetricsInitialization(String),

    #[error("Configuration validation failed: {0}")]
    ConfigValidation(String),

    #[error("Substrate unavailable: {0}")]
    Store(#[from] StoreError),

    #[error("Chain client initialization failed: {0}")]
    Chain(#[from] ChainError),

    #[error("Runtime initialization failed: {0}")]
    Initialization(String),
}

/// One substrate seen through each capability the components need.
#[derive(Clone)]
pub struct Substrate {
    pub kv: Arc<dyn KvStore>,
    pub cache: Arc<dyn CacheBackend>,
    pub streams: Arc<dyn StreamStore>,
}

impl Substrate {
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: KvStore + PubSub + StreamStore + 'static,
    {
        Self { kv: store.clone(), cache: store.clone(), streams: store }
    }

    /// Redis for `redis://` URLs, an in-process store for [`MEMORY_STORE_URL`].
    ///
    /// # Errors
    ///
    /// Returns the connection error when Redis is unreachable.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        if url.starts_with(MEMORY_STORE_URL) {
            warn!("using in-process substrate; state is not shared with other instances");
            return Ok(Self::from_store(Arc::new(MemoryStore::new())));
        }
        let store = RedisStore::connect(url).await?;
        store.ping().await?;
        Ok(Self::from_store(Arc::new(store)))
    }
}

/// One chain client seen through each query trait.
#[derive(Clone)]
pub struct ChainClients {
    pub shared: Arc<dyn SharedQueryClient>,
    pub sessions: Arc<dyn SessionQueryClient>,
    pub applications: Arc<dyn ApplicationQueryClient>,
    pub accounts: Arc<dyn AccountQueryClient>,
    pub blocks: Arc<dyn BlockQueryClient>,
    pub services: Arc<dyn ServiceQueryClient>,
}

impl ChainClients {
    pub fn from_client<C>(client: Arc<C>) -> Self
    where
        C: SharedQueryClient
            + SessionQueryClient
            + ApplicationQueryClient
            + AccountQueryClient
            + BlockQueryClient
            + ServiceQueryClient
            + 'static,
    {
        Self {
            shared: client.clone(),
            sessions: client.clone(),
            applications: client.clone(),
            accounts: client.clone(),
            blocks: client.clone(),
            services: client,
        }
    }
}

#[derive(Clone)]
struct RuntimeOptions {
    instance_id: Option<String>,
    shutdown_channel_capacity: usize,
    block_poll_interval: Option<Duration>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self { instance_id: None, shutdown_channel_capacity: 16, block_poll_interval: None }
    }
}

/// Builds a [`RelayerRuntime`].
///
/// The substrate and chain client default to what the configuration names; tests and
/// embedders can supply their own.
///
/// ```no_run
/// # use relayer_core::{config::RelayerConfig, runtime::RelayerRuntimeBuilder};
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let runtime = RelayerRuntimeBuilder::new()
///     .with_config(RelayerConfig::load()?)
///     .build()
///     .await?;
/// let router = relayer_core::proxy::router(runtime.proxy().clone());
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct RelayerRuntimeBuilder {
    config: Option<RelayerConfig>,
    substrate: Option<Substrate>,
    chain: Option<ChainClients>,
    options: RuntimeOptions,
}

impl RelayerRuntimeBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_config(mut self, config: RelayerConfig) -> Self {
        self.config = Some(config);
        self
    }

    #[must_use]
    pub fn with_substrate(mut self, substrate: Substrate) -> Self {
        self.substrate = Some(substrate);
        self
    }

    #[must_use]
    pub fn with_chain_clients(mut self, chain: ChainClients) -> Self {
        self.chain = Some(chain);
        self
    }

    /// Identity used for the block watcher lease. Random when unset.
    #[must_use]
    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.options.instance_id = Some(instance_id.into());
        self
    }

    #[must_use]
    pub fn with_shutdown_channel_capacity(mut self, capacity: usize) -> Self {
        self.options.shutdown_channel_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_block_poll_interval(mut self, interval: Duration) -> Self {
        self.options.block_poll_interval = Some(interval);
        self
    }

    /// Builds every component and starts background work in dependency order: caches, block
    /// subscriber and watcher, backend health checks, meter, validation and publish workers.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError`] if the configuration is missing or invalid, the substrate is
    /// unreachable, a signing key is malformed, or a cache listener cannot subscribe.
    pub async fn build(self) -> Result<RelayerRuntime, RuntimeError> {
        let config = self
            .config
            .ok_or_else(|| RuntimeError::ConfigValidation("No configuration provided".to_string()))?;
        config.validate().map_err(RuntimeError::ConfigValidation)?;
        let config = Arc::new(config);

        info!(
            services = config.services.len(),
            default_validation_mode = %config.default_validation_mode,
            block_watcher_enabled = config.block_watcher_enabled,
            "Initializing relayer runtime"
        );

        let (shutdown_tx, _) = broadcast::channel::<()>(self.options.shutdown_channel_capacity);
        let mut tasks = Vec::new();

        let metrics = Arc::new(
            MetricsCollector::new().map_err(|e| RuntimeError::MetricsInitialization(e.to_string()))?,
        );

        let substrate = match self.substrate {
            Some(substrate) => substrate,
            None => Substrate::connect(&config.redis.url).await?,
        };
        debug!("Substrate connected");

        let chain = match self.chain {
            Some(chain) => chain,
            None => ChainClients::from_client(Arc::new(RestChainClient::new(
                &config.pocket_node.query_node_rest_url,
                &config.pocket_node.query_node_rpc_url,
                Duration::from_secs(config.pocket_node.query_timeout_seconds.max(1)),
            )?)),
        };

        let cache_config = CacheConfig::from_relayer_config(&config);
        let block_height = BlockHeightState::new();

        let shared_params = Arc::new(SharedParamCache::new(
            cache_config.clone(),
            substrate.cache.clone(),
            chain.shared.clone(),
            metrics.clone(),
        ));
        let session_cache = Arc::new(SessionCache::new(
            cache_config.clone(),
            substrate.cache.clone(),
            chain.sessions.clone(),
            shared_params.clone(),
            block_height.clone(),
            metrics.clone(),
        ));
        let supplier_cache = Arc::new(SupplierCache::new(
            substrate.kv.clone(),
            config.supplier_cache.key_prefix.clone(),
            config.supplier_cache.fail_open,
            metrics.clone(),
        ));
        tasks.push(init_err(shared_params.start(shutdown_tx.subscribe()).await)?);
        tasks.push(init_err(session_cache.start(shutdown_tx.subscribe()).await)?);
        debug!("Caches started");

        let block_subscriber = Arc::new(BlockHeightSubscriber::new(
            cache_config,
            substrate.cache.clone(),
            Some(chain.blocks.clone()),
            block_height.clone(),
            metrics.clone(),
        ));
        tasks.push(init_err(block_subscriber.start(shutdown_tx.subscribe()).await)?);
        if config.block_watcher_enabled {
            let instance_id = self.options.instance_id.unwrap_or_else(random_instance_id);
            let mut watcher =
                BlockHeightWatcher::new(chain.blocks.clone(), block_subscriber.clone(), instance_id);
            if let Some(interval) = self.options.block_poll_interval {
                watcher = watcher.with_poll_interval(interval);
            }
            tasks.push(Arc::new(watcher).start(shutdown_tx.subscribe()));
        }
        debug!(height = block_height.current_height(), "Block subscriber started");

        let health_checker = Arc::new(
            HealthChecker::new(metrics.clone()).map_err(|e| RuntimeError::Initialization(e.to_string()))?,
        );
        for (service_id, service) in &config.services {
            for (rpc_type, backend) in &service.backends {
                health_checker.register_backend(
                    &backend_id(service_id, rpc_type),
                    &backend.url,
                    backend.health_check.clone(),
                );
            }
        }
        tasks.extend(health_checker.start(shutdown_tx.subscribe()));

        let signer = Arc::new(
            ResponseSigner::from_hex_keys(&config.keys)
                .map_err(|e| RuntimeError::ConfigValidation(e.to_string()))?,
        );
        if signer.operator_addresses().is_empty() {
            warn!("no supplier signing keys configured; relays cannot be signed");
        }

        let compute_units = Arc::new(CachedComputeUnitsProvider::new(chain.services.clone()));
        let service_ids: Vec<String> = config.services.keys().cloned().collect();
        compute_units.preload(&service_ids).await;
        let difficulty = Arc::new(CachedDifficultyProvider::new(chain.services.clone()));

        let relay_meter = if config.relay_meter.enabled {
            let meter = Arc::new(
                RelayMeter::new(
                    RelayMeterSettings::from(&config.relay_meter),
                    chain.applications.clone(),
                    chain.sessions.clone(),
                    shared_params.clone(),
                    block_height.clone(),
                    metrics.clone(),
                )
                .with_compute_units_provider(compute_units.clone()),
            );
            tasks.push(meter.start(shutdown_tx.subscribe()));
            Some(meter)
        } else {
            debug!("Relay meter disabled");
            None
        };

        let ring = Arc::new(EcdsaRingVerifier::new(chain.applications.clone(), chain.accounts.clone()));
        let validator = Arc::new(SessionRelayValidator::new(
            ValidatorConfig {
                allowed_supplier_addresses: signer.operator_addresses(),
                grace_period_extra_blocks: config.grace_period_extra_blocks,
            },
            ring,
            session_cache.clone(),
            shared_params.clone(),
        ));
        let session_validator = Arc::new(SessionValidator::new(
            SessionValidatorConfig::from(&config.session_validation),
            validator.clone(),
            session_cache.clone(),
            metrics.clone(),
        ));
        session_validator.set_supplier_addresses(signer.operator_addresses());
        tasks.extend(session_validator.start(shutdown_tx.subscribe()));

        let publisher = Arc::new(StreamPublisher::new(
            substrate.streams.clone(),
            PublisherConfig {
                stream_prefix: config.redis.stream_prefix.clone(),
                max_len: config.redis.max_stream_len,
                approx_max_len: true,
            },
            metrics.clone(),
        ));
        let processor = Arc::new(
            RelayProcessor::new(Some(signer.clone()), metrics.clone())
                .with_difficulty_provider(difficulty)
                .with_compute_units_provider(compute_units),
        );
        let publish_queue = Arc::new(PublishQueue::new(processor, publisher.clone(), metrics.clone()));
        tasks.extend(publish_queue.start(shutdown_tx.subscribe()));

        let mut proxy = RelayProxy::new(
            config.clone(),
            signer.clone(),
            health_checker.clone(),
            block_height.clone(),
            publish_queue.clone(),
            metrics.clone(),
        )
        .map_err(|e| RuntimeError::Initialization(e.to_string()))?
        .with_supplier_lookup(supplier_cache.clone())
        .with_validator(validator)
        .with_session_validator(session_validator.clone());
        if let Some(meter) = &relay_meter {
            proxy = proxy.with_meter(meter.clone());
        }
        let proxy = Arc::new(proxy);
        tasks.extend(proxy.start(shutdown_tx.subscribe()));
        debug!("Relay proxy initialized");

        let components = RelayerComponents {
            metrics,
            block_height,
            shared_params,
            session_cache,
            supplier_cache,
            block_subscriber,
            health_checker,
            relay_meter,
            session_validator,
            publisher,
            publish_queue,
            signer,
            proxy,
        };

        info!(
            suppliers = ?components.signer.operator_addresses(),
            background_tasks = tasks.len(),
            "Relayer runtime initialization complete"
        );
        Ok(RelayerRuntime::new(components, shutdown_tx, config, tasks))
    }
}

fn init_err<T>(result: Result<T, crate::cache::CacheError>) -> Result<T, RuntimeError> {
    result.map_err(|e| RuntimeError::Initialization(e.to_string()))
}

fn random_instance_id() -> String {
    let suffix: u32 = rand::thread_rng().gen();
    format!("relayer-{}-{suffix:08x}", std::process::id())
}
