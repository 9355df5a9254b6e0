//! Cross-instance cache behaviour.
//!
//! Two cache instances on one shared substrate stand in for two relayers of the same fleet.
//! The chain counts its queries, so single-flight population and L2 sharing are observable.

use crate::mock_infrastructure::{
    json_rpc_payload, service, MockChain, TestRelayer, APP_ADDRESS, CHAIN_HEIGHT, SERVICE_ID,
};
use axum::http::StatusCode;
use relayer_core::{
    cache::{CacheConfig, SessionCache, SessionLookup, SharedParamCache, SharedParamsLookup},
    chain::BlockHeightState,
    metrics::MetricsCollector,
    store::MemoryStore,
};
use std::sync::Arc;
use tokio::{
    sync::broadcast,
    time::{sleep, Duration},
};

/// One instance's view: its own L1 maps over the shared store and chain.
struct Instance {
    sessions: Arc<SessionCache>,
    params: Arc<SharedParamCache>,
}

fn instance(store: &Arc<MemoryStore>, chain: &Arc<MockChain>) -> Instance {
    let metrics = Arc::new(MetricsCollector::new().unwrap());
    let config = CacheConfig::default();
    let block_height = BlockHeightState::new();
    block_height.update(CHAIN_HEIGHT, None);

    let params = Arc::new(SharedParamCache::new(
        config.clone(),
        store.clone(),
        chain.clone(),
        metrics.clone(),
    ));
    let sessions = Arc::new(SessionCache::new(
        config,
        store.clone(),
        chain.clone(),
        params.clone(),
        block_height,
        metrics,
    ));
    Instance { sessions, params }
}

fn chain_with_app() -> Arc<MockChain> {
    let chain = Arc::new(MockChain::new(CHAIN_HEIGHT));
    chain.add_application(relayer_core::types::Application {
        address: APP_ADDRESS.to_string(),
        stake: 1_000_000,
        service_ids: vec![SERVICE_ID.to_string()],
        delegatee_gateway_addresses: Vec::new(),
    });
    chain
}

#[tokio::test]
async fn test_concurrent_session_lookups_query_chain_once() {
    let store = Arc::new(MemoryStore::new());
    let chain = chain_with_app();
    chain.set_session_latency(Duration::from_millis(50));

    let a = instance(&store, &chain);
    let b = instance(&store, &chain);

    let (from_a, from_b) = tokio::join!(
        a.sessions.get_session(APP_ADDRESS, SERVICE_ID, CHAIN_HEIGHT),
        b.sessions.get_session(APP_ADDRESS, SERVICE_ID, CHAIN_HEIGHT),
    );
    let (from_a, from_b) = (from_a.unwrap(), from_b.unwrap());
    assert_eq!(from_a, from_b);
    assert_eq!(from_a.header.session_start_block_height, 101);
    assert_eq!(chain.session_queries(), 1);

    // Both instances now answer from L1.
    a.sessions.get_session(APP_ADDRESS, SERVICE_ID, CHAIN_HEIGHT).await.unwrap();
    b.sessions.get_session(APP_ADDRESS, SERVICE_ID, CHAIN_HEIGHT).await.unwrap();
    assert_eq!(chain.session_queries(), 1);
}

#[tokio::test]
async fn test_session_invalidation_reaches_other_instances() {
    let store = Arc::new(MemoryStore::new());
    let chain = chain_with_app();
    let (shutdown_tx, _) = broadcast::channel(1);

    let a = instance(&store, &chain);
    let b = instance(&store, &chain);
    let listener = b.sessions.start(shutdown_tx.subscribe()).await.unwrap();

    a.sessions.get_session(APP_ADDRESS, SERVICE_ID, CHAIN_HEIGHT).await.unwrap();
    b.sessions.get_session(APP_ADDRESS, SERVICE_ID, CHAIN_HEIGHT).await.unwrap();
    assert_eq!(chain.session_queries(), 1);

    a.sessions.invalidate_session(APP_ADDRESS, SERVICE_ID, CHAIN_HEIGHT).await.unwrap();
    sleep(Duration::from_millis(100)).await;

    b.sessions.get_session(APP_ADDRESS, SERVICE_ID, CHAIN_HEIGHT).await.unwrap();
    assert_eq!(chain.session_queries(), 2, "invalidated entry is re-fetched from chain");

    let _ = shutdown_tx.send(());
    listener.await.unwrap();
}

#[tokio::test]
async fn test_unknown_application_is_not_cached() {
    let store = Arc::new(MemoryStore::new());
    let chain = chain_with_app();
    let a = instance(&store, &chain);

    assert!(a.sessions.get_session("pokt1nobody", SERVICE_ID, CHAIN_HEIGHT).await.is_err());
    assert!(a.sessions.get_session("pokt1nobody", SERVICE_ID, CHAIN_HEIGHT).await.is_err());
    assert_eq!(chain.session_queries(), 2);
}

#[tokio::test]
async fn test_shared_params_are_fetched_once_per_fleet() {
    let store = Arc::new(MemoryStore::new());
    let chain = chain_with_app();
    let a = instance(&store, &chain);
    let b = instance(&store, &chain);

    let from_a = a.params.get_shared_params(CHAIN_HEIGHT).await.unwrap();
    let from_b = b.params.get_shared_params(CHAIN_HEIGHT).await.unwrap();
    assert_eq!(from_a, from_b);
    assert_eq!(from_a.num_blocks_per_session, 4);
    assert_eq!(chain.params_queries(), 1);
}

#[tokio::test]
async fn test_non_rewardable_marker_is_shared() {
    let store = Arc::new(MemoryStore::new());
    let chain = chain_with_app();
    let a = instance(&store, &chain);
    let b = instance(&store, &chain);

    assert!(b.sessions.is_session_rewardable("session-1").await);
    a.sessions.mark_session_non_rewardable("session-1", "over_serviced").await.unwrap();

    let fresh = instance(&store, &chain);
    assert!(!fresh.sessions.is_session_rewardable("session-1").await);
    assert!(!a.sessions.is_session_rewardable("session-1").await);
}

#[tokio::test]
async fn test_supplier_state_is_visible_to_every_relayer() {
    let mut backend = mockito::Server::new_async().await;
    let mock = backend.mock("POST", "/").with_status(200).with_body("{}").expect(1).create_async().await;
    let store = Arc::new(MemoryStore::new());

    let registrar = TestRelayer::builder()
        .with_service(SERVICE_ID, service("json_rpc", &backend.url(), "eager"))
        .with_store(store.clone())
        .build()
        .await;
    let peer = TestRelayer::builder()
        .with_service(SERVICE_ID, service("json_rpc", &backend.url(), "eager"))
        .with_store(store)
        .without_supplier_state()
        .build()
        .await;

    let response = peer.post(peer.relay(SERVICE_ID, &json_rpc_payload("eth_chainId"))).await;
    assert_eq!(response.status(), StatusCode::OK);

    mock.assert_async().await;
    peer.shutdown().await;
    registrar.shutdown().await;
}
