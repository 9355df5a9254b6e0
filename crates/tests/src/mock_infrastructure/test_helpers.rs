//! Keys, relay construction and a fully wired in-process relayer for integration tests.

use super::chain_mock::MockChain;
use axum::{body::Body, http::Request, response::Response, Router};
use async_trait::async_trait;
use http_body_util::BodyExt;
use k256::ecdsa::{
    signature::hazmat::{PrehashSigner, PrehashVerifier},
    Signature, SigningKey,
};
use relayer_core::{
    cache::SupplierState,
    config::{BackendConfig, RelayerConfig, ServiceConfig},
    proxy,
    runtime::{RelayerRuntime, Substrate},
    store::{KvStore, MemoryStore, StoreError, StreamStore},
    transport::{stream_name, ConsumerConfig, StreamConsumer},
    types::{
        Application, HttpRequestPayload, HttpResponsePayload, RelayRequest, RelayRequestMetadata,
        RelayResponse, SessionHeader, WireMessage,
    },
};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tower::ServiceExt;

pub const APP_ADDRESS: &str = "pokt1app";
pub const GATEWAY_ADDRESS: &str = "pokt1gateway";
pub const SUPPLIER_ADDRESS: &str = "pokt1supplier";
pub const STRANGER_ADDRESS: &str = "pokt1stranger";
pub const SERVICE_ID: &str = "anvil";
pub const CHAIN_HEIGHT: u64 = 102;

/// Deterministic secp256k1 key; distinct seeds give distinct keys.
#[must_use]
pub fn test_key(seed: u8) -> SigningKey {
    SigningKey::from_slice(&[seed; 32]).expect("non-zero seed is a valid scalar")
}

#[must_use]
pub fn app_key() -> SigningKey {
    test_key(0x0a)
}

#[must_use]
pub fn gateway_key() -> SigningKey {
    test_key(0x0b)
}

#[must_use]
pub fn supplier_key() -> SigningKey {
    test_key(0x0c)
}

#[must_use]
pub fn stranger_key() -> SigningKey {
    test_key(0x0d)
}

#[must_use]
pub fn json_rpc_payload(method: &str) -> HttpRequestPayload {
    let mut headers = std::collections::BTreeMap::new();
    headers.insert("Content-Type".to_string(), vec!["application/json".to_string()]);
    HttpRequestPayload {
        method: "POST".to_string(),
        url: "/".to_string(),
        headers,
        body: serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": method, "params": []})
            .to_string()
            .into_bytes(),
    }
}

/// Encoded relay request for `payload`, signed by `signer` over its signable hash.
#[must_use]
pub fn signed_relay(header: SessionHeader, payload: &HttpRequestPayload, signer: &SigningKey) -> Vec<u8> {
    let mut request = RelayRequest {
        meta: RelayRequestMetadata {
            session_header: Some(header),
            signature: Vec::new(),
            supplier_operator_address: SUPPLIER_ADDRESS.to_string(),
        },
        payload: payload.encode().expect("payload encodes"),
    };
    let hash = request.signable_bytes_hash().expect("request hashes");
    let signature: Signature = signer.sign_prehash(&hash).expect("prehash signs");
    request.meta.signature = signature.to_bytes().to_vec();
    request.encode().expect("request encodes")
}

/// Decodes a relay response and checks the supplier's signature over it.
#[must_use]
pub fn verify_relay_response(bytes: &[u8]) -> (RelayResponse, HttpResponsePayload) {
    let response = RelayResponse::decode(bytes).expect("body is a relay response");
    let signature = Signature::from_slice(&response.meta.supplier_operator_signature)
        .expect("response carries a signature");
    let hash = response.signable_bytes_hash().expect("response hashes");
    supplier_key().verifying_key().verify_prehash(&hash, &signature).expect("supplier signature verifies");

    let payload = HttpResponsePayload::decode(&response.payload).expect("payload decodes");
    (response, payload)
}

pub async fn body_bytes(response: Response) -> Vec<u8> {
    response.into_body().collect().await.expect("body collects").to_bytes().to_vec()
}

pub async fn body_json(response: Response) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).expect("body is json")
}

/// Single service backed by `url` under `rpc_type`.
#[must_use]
pub fn service(rpc_type: &str, url: &str, validation_mode: &str) -> ServiceConfig {
    ServiceConfig {
        validation_mode: Some(validation_mode.to_string()),
        backends: HashMap::from([(
            rpc_type.to_string(),
            BackendConfig { url: url.to_string(), ..Default::default() },
        )]),
        ..Default::default()
    }
}

/// Key/value store whose every call fails as if the substrate were unreachable.
pub struct UnreachableKv;

#[async_trait]
impl KvStore for UnreachableKv {
    async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
        Err(StoreError::Connection("connection refused".to_string()))
    }

    async fn set(&self, _key: &str, _value: &str, _ttl: Option<Duration>) -> Result<(), StoreError> {
        Err(StoreError::Connection("connection refused".to_string()))
    }

    async fn set_nx(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<bool, StoreError> {
        Err(StoreError::Connection("connection refused".to_string()))
    }

    async fn del(&self, _key: &str) -> Result<(), StoreError> {
        Err(StoreError::Connection("connection refused".to_string()))
    }

    async fn keys(&self, _pattern: &str) -> Result<Vec<String>, StoreError> {
        Err(StoreError::Connection("connection refused".to_string()))
    }
}

pub struct TestRelayerBuilder {
    config: RelayerConfig,
    chain: Arc<MockChain>,
    store: Arc<MemoryStore>,
    supplier_kv: Option<Arc<dyn KvStore>>,
    register_supplier: bool,
    block_poll_interval: Option<Duration>,
}

impl TestRelayerBuilder {
    #[must_use]
    pub fn new() -> Self {
        let mut config = RelayerConfig::default();
        config.block_watcher_enabled = false;
        config.keys.insert(SUPPLIER_ADDRESS.to_string(), hex::encode(supplier_key().to_bytes()));
        config.session_validation.mode = "eager".to_string();

        let chain = Arc::new(MockChain::new(CHAIN_HEIGHT));
        chain.add_application(Application {
            address: APP_ADDRESS.to_string(),
            stake: 1_000_000,
            service_ids: vec![SERVICE_ID.to_string()],
            delegatee_gateway_addresses: vec![GATEWAY_ADDRESS.to_string()],
        });
        for (address, key) in
            [(APP_ADDRESS, app_key()), (GATEWAY_ADDRESS, gateway_key()), (STRANGER_ADDRESS, stranger_key())]
        {
            chain.set_public_key(address, key.verifying_key().to_sec1_bytes().to_vec());
        }
        chain.add_session_supplier(SERVICE_ID, SUPPLIER_ADDRESS);

        Self {
            config,
            chain,
            store: Arc::new(MemoryStore::new()),
            supplier_kv: None,
            register_supplier: true,
            block_poll_interval: None,
        }
    }

    #[must_use]
    pub fn with_service(mut self, service_id: &str, service: ServiceConfig) -> Self {
        self.config.services.insert(service_id.to_string(), service);
        self
    }

    #[must_use]
    pub fn with_config(mut self, f: impl FnOnce(&mut RelayerConfig)) -> Self {
        f(&mut self.config);
        self
    }

    #[must_use]
    pub fn with_chain(self, f: impl FnOnce(&MockChain)) -> Self {
        f(&self.chain);
        self
    }

    /// Shares a substrate with another relayer, as two instances of one fleet would.
    #[must_use]
    pub fn with_store(mut self, store: Arc<MemoryStore>) -> Self {
        self.store = store;
        self
    }

    /// Leaves the supplier out of the supplier cache.
    #[must_use]
    pub fn without_supplier_state(mut self) -> Self {
        self.register_supplier = false;
        self
    }

    /// Backs the supplier cache with `kv` instead of the shared store. The supplier is not
    /// registered.
    #[must_use]
    pub fn with_supplier_store(mut self, kv: Arc<dyn KvStore>) -> Self {
        self.supplier_kv = Some(kv);
        self.register_supplier = false;
        self
    }

    /// Runs the elected block watcher, polling the mock chain at `interval`.
    #[must_use]
    pub fn with_block_watcher(mut self, interval: Duration) -> Self {
        self.config.block_watcher_enabled = true;
        self.block_poll_interval = Some(interval);
        self
    }

    pub async fn build(self) -> TestRelayer {
        let mut substrate = Substrate::from_store(self.store.clone());
        if let Some(kv) = self.supplier_kv {
            substrate.kv = kv;
        }
        let mut builder = RelayerRuntime::builder()
            .with_config(self.config)
            .with_substrate(substrate)
            .with_chain_clients(self.chain.clients())
            .with_instance_id("test-instance");
        if let Some(interval) = self.block_poll_interval {
            builder = builder.with_block_poll_interval(interval).with_shutdown_channel_capacity(4);
        }
        let runtime = builder.build().await.expect("relayer runtime builds");

        if self.register_supplier {
            let services = runtime.config().services.keys().cloned().collect();
            runtime
                .components()
                .supplier_cache()
                .set_state(&mut SupplierState {
                    status: "active".to_string(),
                    services,
                    operator_address: SUPPLIER_ADDRESS.to_string(),
                    ..SupplierState::default()
                })
                .await
                .expect("supplier state stored");
        }

        TestRelayer { runtime, chain: self.chain, store: self.store }
    }
}

impl Default for TestRelayerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// An in-process relayer on a memory substrate and a mock chain.
pub struct TestRelayer {
    pub runtime: RelayerRuntime,
    pub chain: Arc<MockChain>,
    pub store: Arc<MemoryStore>,
}

impl TestRelayer {
    #[must_use]
    pub fn builder() -> TestRelayerBuilder {
        TestRelayerBuilder::new()
    }

    #[must_use]
    pub fn router(&self) -> Router {
        proxy::router(self.runtime.proxy().clone())
    }

    /// Header of the application's current session for `service_id`.
    #[must_use]
    pub fn session_header(&self, service_id: &str) -> SessionHeader {
        self.chain.session_header(APP_ADDRESS, service_id, self.chain.height())
    }

    /// A relay for `service_id` signed by the application.
    #[must_use]
    pub fn relay(&self, service_id: &str, payload: &HttpRequestPayload) -> Vec<u8> {
        signed_relay(self.session_header(service_id), payload, &app_key())
    }

    pub async fn post(&self, body: Vec<u8>) -> Response {
        self.router()
            .oneshot(Request::builder().method("POST").uri("/").body(Body::from(body)).expect("request builds"))
            .await
            .expect("router is infallible")
    }

    #[must_use]
    pub fn supplier_stream(&self) -> String {
        stream_name(&self.runtime.config().redis.stream_prefix, SUPPLIER_ADDRESS)
    }

    pub async fn stream_len(&self) -> u64 {
        self.store.len(&self.supplier_stream()).await.unwrap_or_default()
    }

    /// Polls the supplier stream until it holds `expected` entries.
    pub async fn wait_for_published(&self, expected: u64, timeout: Duration) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < timeout {
            if self.stream_len().await >= expected {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[must_use]
    pub fn consumer(&self, group: &str, name: &str, claim_idle: Duration) -> Arc<StreamConsumer> {
        let mut config = ConsumerConfig::new(
            self.runtime.config().redis.stream_prefix.clone(),
            SUPPLIER_ADDRESS,
            group,
            name,
        );
        config.block_timeout = Duration::from_millis(50);
        config.claim_idle_timeout = claim_idle;
        Arc::new(
            StreamConsumer::new(self.store.clone(), config, self.runtime.metrics_collector().clone())
                .expect("consumer config is valid"),
        )
    }

    pub async fn shutdown(self) {
        self.runtime.shutdown().await;
    }
}
