//! In-memory chain implementing every query trait the relayer consumes.
//!
//! Sessions are derived from the shared parameters: an application/service pair at height
//! `h` gets the session starting at `session_start_height(h)`, with the ID
//! `"{app}/{service}/{start}"` and the suppliers registered for the service.

use async_trait::async_trait;
use parking_lot::RwLock;
use relayer_core::{
    chain::{
        AccountQueryClient, ApplicationQueryClient, BlockQueryClient, ChainError,
        ServiceQueryClient, SessionQueryClient, SharedQueryClient,
    },
    runtime::ChainClients,
    types::{
        Application, BlockInfo, RelayMiningDifficulty, Session, SessionHeader, SessionParams,
        SharedParams,
    },
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

/// Shared parameters used by every test chain: 4-block sessions, 1-block grace period.
#[must_use]
pub fn test_shared_params() -> SharedParams {
    SharedParams {
        num_blocks_per_session: 4,
        grace_period_end_offset_blocks: 1,
        claim_window_open_offset_blocks: 1,
        claim_window_close_offset_blocks: 4,
        proof_window_open_offset_blocks: 0,
        proof_window_close_offset_blocks: 4,
        compute_units_to_tokens_multiplier: 42,
        compute_unit_cost_granularity: 1,
    }
}

pub struct MockChain {
    height: AtomicU64,
    shared_params: RwLock<SharedParams>,
    session_params: RwLock<SessionParams>,
    applications: RwLock<HashMap<String, Application>>,
    public_keys: RwLock<HashMap<String, Vec<u8>>>,
    suppliers: RwLock<HashMap<String, Vec<String>>>,
    compute_units: RwLock<HashMap<String, u64>>,
    target_hash: RwLock<Vec<u8>>,
    session_latency: RwLock<Duration>,
    session_queries: AtomicUsize,
    params_queries: AtomicUsize,
}

impl MockChain {
    #[must_use]
    pub fn new(height: u64) -> Self {
        Self {
            height: AtomicU64::new(height),
            shared_params: RwLock::new(test_shared_params()),
            session_params: RwLock::new(SessionParams { num_suppliers_per_session: 1 }),
            applications: RwLock::new(HashMap::new()),
            public_keys: RwLock::new(HashMap::new()),
            suppliers: RwLock::new(HashMap::new()),
            compute_units: RwLock::new(HashMap::new()),
            target_hash: RwLock::new(vec![0xff; 32]),
            session_latency: RwLock::new(Duration::ZERO),
            session_queries: AtomicUsize::new(0),
            params_queries: AtomicUsize::new(0),
        }
    }

    /// The chain seen through each query trait, for the runtime builder.
    #[must_use]
    pub fn clients(self: &Arc<Self>) -> ChainClients {
        ChainClients::from_client(Arc::clone(self))
    }

    pub fn set_height(&self, height: u64) {
        self.height.store(height, Ordering::SeqCst);
    }

    #[must_use]
    pub fn height(&self) -> u64 {
        self.height.load(Ordering::SeqCst)
    }

    pub fn add_application(&self, application: Application) {
        self.applications.write().insert(application.address.clone(), application);
    }

    pub fn set_public_key(&self, address: &str, sec1_bytes: Vec<u8>) {
        self.public_keys.write().insert(address.to_string(), sec1_bytes);
    }

    pub fn add_session_supplier(&self, service_id: &str, operator_address: &str) {
        self.suppliers
            .write()
            .entry(service_id.to_string())
            .or_default()
            .push(operator_address.to_string());
    }

    pub fn set_compute_units(&self, service_id: &str, units: u64) {
        self.compute_units.write().insert(service_id.to_string(), units);
    }

    pub fn set_target_hash(&self, target_hash: Vec<u8>) {
        *self.target_hash.write() = target_hash;
    }

    /// Delays every session query, widening the window for concurrent lookups.
    pub fn set_session_latency(&self, latency: Duration) {
        *self.session_latency.write() = latency;
    }

    #[must_use]
    pub fn session_queries(&self) -> usize {
        self.session_queries.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn params_queries(&self) -> usize {
        self.params_queries.load(Ordering::SeqCst)
    }

    /// Header of the session `app` has for `service_id` at `height`.
    #[must_use]
    pub fn session_header(&self, app: &str, service_id: &str, height: u64) -> SessionHeader {
        let params = self.shared_params.read().clone();
        let start = params.session_start_height(height);
        let end = params.session_end_height(height);
        SessionHeader {
            application_address: app.to_string(),
            service_id: service_id.to_string(),
            session_id: format!("{app}/{service_id}/{start}"),
            session_start_block_height: i64::try_from(start).unwrap_or_default(),
            session_end_block_height: i64::try_from(end).unwrap_or_default(),
        }
    }
}

#[async_trait]
impl SharedQueryClient for MockChain {
    async fn get_params(&self) -> Result<SharedParams, ChainError> {
        self.params_queries.fetch_add(1, Ordering::SeqCst);
        Ok(self.shared_params.read().clone())
    }
}

#[async_trait]
impl SessionQueryClient for MockChain {
    async fn get_session(
        &self,
        app_address: &str,
        service_id: &str,
        height: u64,
    ) -> Result<Session, ChainError> {
        self.session_queries.fetch_add(1, Ordering::SeqCst);
        let latency = *self.session_latency.read();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if !self.applications.read().contains_key(app_address) {
            return Err(ChainError::NotFound(format!("application {app_address}")));
        }
        let header = self.session_header(app_address, service_id, height);
        let num_blocks_per_session = self.shared_params.read().num_blocks_per_session;
        Ok(Session {
            session_id: header.session_id.clone(),
            session_number: header.start_height() / num_blocks_per_session.max(1),
            num_blocks_per_session,
            suppliers: self.suppliers.read().get(service_id).cloned().unwrap_or_default(),
            header,
        })
    }

    async fn get_params(&self) -> Result<SessionParams, ChainError> {
        Ok(self.session_params.read().clone())
    }
}

#[async_trait]
impl ApplicationQueryClient for MockChain {
    async fn get_application(&self, address: &str) -> Result<Application, ChainError> {
        self.applications
            .read()
            .get(address)
            .cloned()
            .ok_or_else(|| ChainError::NotFound(format!("application {address}")))
    }
}

#[async_trait]
impl AccountQueryClient for MockChain {
    async fn get_public_key(&self, address: &str) -> Result<Vec<u8>, ChainError> {
        self.public_keys
            .read()
            .get(address)
            .cloned()
            .ok_or_else(|| ChainError::NotFound(format!("account {address}")))
    }
}

#[async_trait]
impl BlockQueryClient for MockChain {
    async fn latest_block(&self) -> Result<BlockInfo, ChainError> {
        let height = self.height();
        Ok(BlockInfo { height, hash: Some(format!("{height:064x}")) })
    }
}

#[async_trait]
impl ServiceQueryClient for MockChain {
    async fn get_relay_mining_difficulty(
        &self,
        service_id: &str,
    ) -> Result<RelayMiningDifficulty, ChainError> {
        Ok(RelayMiningDifficulty {
            service_id: service_id.to_string(),
            block_height: self.height(),
            num_relays_ema: 0,
            target_hash: self.target_hash.read().clone(),
        })
    }

    async fn get_compute_units_per_relay(&self, service_id: &str) -> Result<u64, ChainError> {
        Ok(self.compute_units.read().get(service_id).copied().unwrap_or(1))
    }
}
