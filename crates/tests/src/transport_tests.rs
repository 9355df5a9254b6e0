//! Mined relay hand-off through per-supplier streams.
//!
//! Relays are published by the relayer under test and read back by consumers in a group,
//! covering acknowledgement, reclaiming from a dead consumer and stream trimming.

use crate::mock_infrastructure::{
    json_rpc_payload, service, TestRelayer, SERVICE_ID, SUPPLIER_ADDRESS,
};
use axum::http::StatusCode;
use relayer_core::{
    metrics::MetricsCollector,
    store::{MemoryStore, StreamStore},
    transport::{
        stream_name, ConsumerConfig, MinedRelayMessage, MinedRelayPublisher, PublisherConfig,
        StreamConsumer, StreamPublisher,
    },
};
use std::{collections::HashSet, sync::Arc};
use tokio::{
    sync::broadcast,
    time::{timeout, Duration},
};

async fn relayer_with_traffic(relays: usize) -> (TestRelayer, mockito::ServerGuard) {
    let mut backend = mockito::Server::new_async().await;
    let _mock = backend.mock("POST", "/").with_status(200).with_body("{}").create_async().await;

    let relayer = TestRelayer::builder()
        .with_service(SERVICE_ID, service("json_rpc", &backend.url(), "eager"))
        .build()
        .await;

    for i in 0..relays {
        let payload = json_rpc_payload(&format!("eth_call_{i}"));
        let response = relayer.post(relayer.relay(SERVICE_ID, &payload)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
    assert!(
        relayer.wait_for_published(relays as u64, Duration::from_secs(2)).await,
        "relays were not published"
    );
    (relayer, backend)
}

#[tokio::test]
async fn test_consumer_group_reads_and_acks_published_relays() {
    let (relayer, _backend) = relayer_with_traffic(3).await;

    let consumer = relayer.consumer("miners", "miner-1", Duration::from_secs(30));
    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let mut rx = consumer.consume(shutdown_rx).await.unwrap();

    let mut ids = Vec::new();
    let mut hashes = HashSet::new();
    for _ in 0..3 {
        let msg = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(msg.message.supplier_operator_address, SUPPLIER_ADDRESS);
        assert_eq!(msg.message.service_id, SERVICE_ID);
        assert!(msg.message.published_at().is_some());
        hashes.insert(msg.message.relay_hash_hex());
        ids.push(msg.id);
    }
    assert_eq!(hashes.len(), 3, "every relay hashes differently");

    assert_eq!(consumer.pending().await.unwrap(), 3);
    consumer.ack(&ids[0]).await.unwrap();
    assert_eq!(consumer.pending().await.unwrap(), 2);
    consumer.ack_batch(&ids[1..]).await.unwrap();
    assert_eq!(consumer.pending().await.unwrap(), 0);

    // Nothing is redelivered once acknowledged.
    assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());

    consumer.close();
    relayer.shutdown().await;
}

#[tokio::test]
async fn test_unacked_relay_is_reclaimed_by_another_consumer() {
    let (relayer, _backend) = relayer_with_traffic(1).await;
    let (_shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);

    let crashed = relayer.consumer("miners", "miner-1", Duration::from_secs(30));
    let mut crashed_rx = crashed.consume(shutdown_rx.resubscribe()).await.unwrap();
    let delivered = timeout(Duration::from_secs(2), crashed_rx.recv()).await.unwrap().unwrap();
    crashed.close();

    let survivor = relayer.consumer("miners", "miner-2", Duration::from_millis(100));
    let mut survivor_rx = survivor.consume(shutdown_rx).await.unwrap();
    let reclaimed = timeout(Duration::from_secs(2), survivor_rx.recv()).await.unwrap().unwrap();

    assert_eq!(reclaimed.id, delivered.id);
    assert_eq!(reclaimed.message, delivered.message);
    assert_eq!(
        relayer.store.pending_owner(&relayer.supplier_stream(), "miners", &reclaimed.id).as_deref(),
        Some("miner-2")
    );

    survivor.ack(&reclaimed.id).await.unwrap();
    assert_eq!(survivor.pending().await.unwrap(), 0);

    survivor.close();
    relayer.shutdown().await;
}

#[tokio::test]
async fn test_independent_groups_each_see_every_relay() {
    let (relayer, _backend) = relayer_with_traffic(2).await;
    let (_shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);

    for group in ["miners", "auditors"] {
        let consumer = relayer.consumer(group, "reader", Duration::from_secs(30));
        let mut rx = consumer.consume(shutdown_rx.resubscribe()).await.unwrap();
        for _ in 0..2 {
            timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        }
        consumer.close();
    }

    relayer.shutdown().await;
}

#[tokio::test]
async fn test_stream_is_trimmed_to_max_len() {
    let store = Arc::new(MemoryStore::new());
    let metrics = Arc::new(MetricsCollector::new().unwrap());
    let publisher = StreamPublisher::new(
        store.clone(),
        PublisherConfig { stream_prefix: "ha:relays".to_string(), max_len: 5, approx_max_len: true },
        metrics.clone(),
    );

    for i in 0u8..8 {
        publisher
            .publish(MinedRelayMessage {
                relay_hash: vec![i; 32],
                relay_bytes: vec![i],
                supplier_operator_address: SUPPLIER_ADDRESS.to_string(),
                service_id: SERVICE_ID.to_string(),
                session_id: "s1".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
    }

    let stream = stream_name("ha:relays", SUPPLIER_ADDRESS);
    assert_eq!(store.len(&stream).await.unwrap(), 5);

    let mut config = ConsumerConfig::new("ha:relays", SUPPLIER_ADDRESS, "miners", "miner-1");
    config.block_timeout = Duration::from_millis(50);
    let consumer = Arc::new(StreamConsumer::new(store, config, metrics).unwrap());
    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let mut rx = consumer.consume(shutdown_rx).await.unwrap();

    // The oldest entries were dropped.
    for expected in 3u8..8 {
        let msg = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(msg.message.relay_hash, vec![expected; 32]);
    }

    consumer.close();
}

#[tokio::test]
async fn test_closed_publisher_rejects_relays() {
    let publisher = StreamPublisher::new(
        Arc::new(MemoryStore::new()),
        PublisherConfig::default(),
        Arc::new(MetricsCollector::new().unwrap()),
    );
    publisher.close();

    let result = publisher
        .publish(MinedRelayMessage {
            supplier_operator_address: SUPPLIER_ADDRESS.to_string(),
            ..Default::default()
        })
        .await;
    assert!(result.is_err());
}
