//! End-to-end HTTP relay tests.
//!
//! Each test drives the relay router with encoded relay requests and checks three things: what
//! the gateway got back, whether the backend was called, and whether the relay reached the
//! supplier's stream for billing.

use crate::mock_infrastructure::{
    body_bytes, body_json, json_rpc_payload, service, signed_relay, stranger_key,
    verify_relay_response, TestRelayer, UnreachableKv, APP_ADDRESS, SERVICE_ID, SUPPLIER_ADDRESS,
};
use axum::http::{header, StatusCode};
use relayer_core::{
    transport::MinedRelayMessage,
    types::{Relay, WireMessage},
};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::{
    sync::broadcast,
    time::{timeout, Duration},
};

const PUBLISH_WAIT: Duration = Duration::from_secs(2);

/// Reads every mined relay currently on the supplier stream.
async fn published_relays(relayer: &TestRelayer, expected: usize) -> Vec<MinedRelayMessage> {
    let consumer = relayer.consumer("inspect", "inspector", Duration::from_secs(30));
    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let mut rx = consumer.consume(shutdown_rx).await.expect("consumer starts");

    let mut messages = Vec::with_capacity(expected);
    while messages.len() < expected {
        let msg = timeout(PUBLISH_WAIT, rx.recv())
            .await
            .expect("timed out waiting for mined relay")
            .expect("consumer channel open");
        messages.push(msg.message);
    }
    consumer.close();
    messages
}

#[tokio::test]
async fn test_raw_json_body_is_rejected() {
    let mut backend = mockito::Server::new_async().await;
    let mock = backend.mock("POST", "/").expect(0).create_async().await;

    let relayer = TestRelayer::builder()
        .with_service(SERVICE_ID, service("json_rpc", &backend.url(), "eager"))
        .build()
        .await;

    let response = relayer.post(br#"{"jsonrpc":"2.0","method":"eth_blockNumber","id":1}"#.to_vec()).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().starts_with("invalid relay request"));

    mock.assert_async().await;
    relayer.shutdown().await;
}

#[tokio::test]
async fn test_eager_relay_is_signed_and_published() {
    let mut backend = mockito::Server::new_async().await;
    let mock = backend
        .mock("POST", "/")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"jsonrpc":"2.0","id":1,"result":"0x66"}"#)
        .expect(1)
        .create_async()
        .await;

    let relayer = TestRelayer::builder()
        .with_service(SERVICE_ID, service("json_rpc", &backend.url(), "eager"))
        .build()
        .await;

    let relay = relayer.relay(SERVICE_ID, &json_rpc_payload("eth_blockNumber"));
    let response = relayer.post(relay).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "application/x-protobuf");

    let (signed, payload) = verify_relay_response(&body_bytes(response).await);
    assert_eq!(payload.status_code, 200);
    assert_eq!(payload.body, br#"{"jsonrpc":"2.0","id":1,"result":"0x66"}"#);
    let header = signed.meta.session_header.expect("response echoes the session header");
    assert_eq!(header.application_address, APP_ADDRESS);
    assert_eq!(signed.meta.supplier_operator_signature.len(), 64);
    mock.assert_async().await;

    assert!(relayer.wait_for_published(1, PUBLISH_WAIT).await, "relay was not published");
    let mined = published_relays(&relayer, 1).await.remove(0);
    assert_eq!(mined.session_id, header.session_id);
    assert_eq!(mined.service_id, SERVICE_ID);
    assert_eq!(mined.application_address, APP_ADDRESS);
    assert_eq!(mined.supplier_operator_address, SUPPLIER_ADDRESS);
    assert_eq!(mined.session_start_height, 101);
    assert_eq!(mined.session_end_height, 104);
    assert_eq!(mined.compute_units_per_relay, 1);
    assert_eq!(mined.relay_hash, Sha256::digest(&mined.relay_bytes).to_vec());

    let billed = Relay::decode(&mined.relay_bytes).expect("relay bytes decode");
    assert_eq!(billed.req.session_id(), header.session_id);
    assert!(billed.res.payload.is_empty(), "billed response keeps only the payload hash");

    relayer.shutdown().await;
}

#[tokio::test]
async fn test_gateway_delegate_signature_is_accepted() {
    let mut backend = mockito::Server::new_async().await;
    let mock = backend.mock("POST", "/").with_status(200).with_body("{}").expect(1).create_async().await;

    let relayer = TestRelayer::builder()
        .with_service(SERVICE_ID, service("json_rpc", &backend.url(), "eager"))
        .build()
        .await;

    let relay = signed_relay(
        relayer.session_header(SERVICE_ID),
        &json_rpc_payload("eth_chainId"),
        &crate::mock_infrastructure::gateway_key(),
    );
    let response = relayer.post(relay).await;
    assert_eq!(response.status(), StatusCode::OK);

    mock.assert_async().await;
    relayer.shutdown().await;
}

#[tokio::test]
async fn test_eager_rejection_never_reaches_backend() {
    let mut backend = mockito::Server::new_async().await;
    let mock = backend.mock("POST", "/").expect(0).create_async().await;

    let relayer = TestRelayer::builder()
        .with_service(SERVICE_ID, service("json_rpc", &backend.url(), "eager"))
        .build()
        .await;

    let relay =
        signed_relay(relayer.session_header(SERVICE_ID), &json_rpc_payload("eth_chainId"), &stranger_key());
    let response = relayer.post(relay).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().starts_with("relay validation failed"));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(relayer.stream_len().await, 0);

    mock.assert_async().await;
    relayer.shutdown().await;
}

#[tokio::test]
async fn test_expired_session_is_rejected() {
    let mut backend = mockito::Server::new_async().await;
    let mock = backend.mock("POST", "/").expect(0).create_async().await;

    let relayer = TestRelayer::builder()
        .with_service(SERVICE_ID, service("json_rpc", &backend.url(), "eager"))
        .build()
        .await;

    let relay = relayer.relay(SERVICE_ID, &json_rpc_payload("eth_chainId"));
    relayer.runtime.components().block_height().update(120, None);

    let response = relayer.post(relay).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    mock.assert_async().await;
    relayer.shutdown().await;
}

#[tokio::test]
async fn test_optimistic_relay_with_bad_signature_is_served_but_not_billed() {
    let mut backend = mockito::Server::new_async().await;
    let mock = backend.mock("POST", "/").with_status(200).with_body("{}").expect(1).create_async().await;

    let relayer = TestRelayer::builder()
        .with_service(SERVICE_ID, service("json_rpc", &backend.url(), "optimistic"))
        .build()
        .await;

    let relay =
        signed_relay(relayer.session_header(SERVICE_ID), &json_rpc_payload("eth_chainId"), &stranger_key());
    let response = relayer.post(relay).await;
    assert_eq!(response.status(), StatusCode::OK);
    verify_relay_response(&body_bytes(response).await);
    mock.assert_async().await;

    assert!(!relayer.wait_for_published(1, Duration::from_millis(500)).await);

    relayer.shutdown().await;
}

#[tokio::test]
async fn test_optimistic_valid_relay_is_billed() {
    let mut backend = mockito::Server::new_async().await;
    let _mock = backend.mock("POST", "/").with_status(200).with_body("{}").create_async().await;

    let relayer = TestRelayer::builder()
        .with_service(SERVICE_ID, service("json_rpc", &backend.url(), "optimistic"))
        .build()
        .await;

    let response = relayer.post(relayer.relay(SERVICE_ID, &json_rpc_payload("eth_chainId"))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(relayer.wait_for_published(1, PUBLISH_WAIT).await);

    relayer.shutdown().await;
}

#[tokio::test]
async fn test_unknown_service_returns_not_found() {
    let mut backend = mockito::Server::new_async().await;
    let mock = backend.mock("POST", "/").expect(0).create_async().await;

    let relayer = TestRelayer::builder()
        .with_service(SERVICE_ID, service("json_rpc", &backend.url(), "eager"))
        .build()
        .await;

    let response = relayer.post(relayer.relay("solana", &json_rpc_payload("getSlot"))).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["error"], "unknown service: solana");

    mock.assert_async().await;
    relayer.shutdown().await;
}

#[tokio::test]
async fn test_unregistered_supplier_is_unavailable() {
    let mut backend = mockito::Server::new_async().await;
    let mock = backend.mock("POST", "/").expect(0).create_async().await;

    let relayer = TestRelayer::builder()
        .with_service(SERVICE_ID, service("json_rpc", &backend.url(), "eager"))
        .without_supplier_state()
        .build()
        .await;

    let response = relayer.post(relayer.relay(SERVICE_ID, &json_rpc_payload("eth_chainId"))).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("not registered"));

    mock.assert_async().await;
    relayer.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_supplier_cache_fails_closed() {
    let mut backend = mockito::Server::new_async().await;
    let mock = backend.mock("POST", "/").expect(0).create_async().await;

    let relayer = TestRelayer::builder()
        .with_service(SERVICE_ID, service("json_rpc", &backend.url(), "eager"))
        .with_config(|config| config.supplier_cache.fail_open = false)
        .with_supplier_store(Arc::new(UnreachableKv))
        .build()
        .await;

    let response = relayer.post(relayer.relay(SERVICE_ID, &json_rpc_payload("eth_chainId"))).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("not registered with any miner"));

    mock.assert_async().await;
    assert_eq!(relayer.stream_len().await, 0);
    relayer.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_supplier_cache_fails_open() {
    let mut backend = mockito::Server::new_async().await;
    let mock = backend
        .mock("POST", "/")
        .with_status(200)
        .with_body(r#"{"jsonrpc":"2.0","id":1,"result":"0x1"}"#)
        .expect(1)
        .create_async()
        .await;

    let relayer = TestRelayer::builder()
        .with_service(SERVICE_ID, service("json_rpc", &backend.url(), "eager"))
        .with_supplier_store(Arc::new(UnreachableKv))
        .build()
        .await;

    let response = relayer.post(relayer.relay(SERVICE_ID, &json_rpc_payload("eth_chainId"))).await;
    assert_eq!(response.status(), StatusCode::OK);

    mock.assert_async().await;
    relayer.shutdown().await;
}

#[tokio::test]
async fn test_streaming_response_is_forwarded_and_billed_after_completion() {
    let mut backend = mockito::Server::new_async().await;
    let mock = backend
        .mock("POST", "/")
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body("data: 1\n\ndata: 2\n\ndata: 3\n\n")
        .expect(1)
        .create_async()
        .await;

    let relayer = TestRelayer::builder()
        .with_service(SERVICE_ID, service("json_rpc", &backend.url(), "eager"))
        .build()
        .await;

    let response = relayer.post(relayer.relay(SERVICE_ID, &json_rpc_payload("eth_subscribe"))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()[header::CONTENT_TYPE].to_str().unwrap().starts_with("text/event-stream"));

    let body = String::from_utf8(body_bytes(response).await).expect("stream is utf-8");
    let events: Vec<&str> = body.lines().filter(|l| l.starts_with("data:")).collect();
    assert_eq!(events, ["data: 1", "data: 2", "data: 3"]);

    mock.assert_async().await;
    assert!(relayer.wait_for_published(1, PUBLISH_WAIT).await, "streamed relay was not billed");
    relayer.shutdown().await;
}

#[tokio::test]
async fn test_over_serviced_relay_is_rejected_when_disabled() {
    let mut backend = mockito::Server::new_async().await;
    let mock = backend.mock("POST", "/").with_status(200).with_body("{}").expect(2).create_async().await;

    // 400 stake split over 4 pending sessions leaves 100 per session; each relay costs 42.
    let relayer = TestRelayer::builder()
        .with_service(SERVICE_ID, service("json_rpc", &backend.url(), "eager"))
        .with_config(|c| c.relay_meter.over_servicing_enabled = false)
        .with_chain(|chain| {
            chain.add_application(relayer_core::types::Application {
                address: APP_ADDRESS.to_string(),
                stake: 400,
                service_ids: vec![SERVICE_ID.to_string()],
                delegatee_gateway_addresses: Vec::new(),
            });
        })
        .build()
        .await;

    for _ in 0..2 {
        let response = relayer.post(relayer.relay(SERVICE_ID, &json_rpc_payload("eth_chainId"))).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = relayer.post(relayer.relay(SERVICE_ID, &json_rpc_payload("eth_chainId"))).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    let session_id = relayer.session_header(SERVICE_ID).session_id;
    let state = relayer
        .runtime
        .components()
        .relay_meter()
        .expect("meter enabled")
        .get_session_meter_state(&session_id)
        .expect("session metered");
    assert_eq!(state.max_stake, 100);
    assert_eq!(state.consumed_stake, 84);

    mock.assert_async().await;
    relayer.shutdown().await;
}

#[tokio::test]
async fn test_backend_failure_returns_bad_gateway_and_refunds_meter() {
    let relayer = TestRelayer::builder()
        .with_service(SERVICE_ID, service("json_rpc", "http://127.0.0.1:1", "eager"))
        .build()
        .await;

    let response = relayer.post(relayer.relay(SERVICE_ID, &json_rpc_payload("eth_chainId"))).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    let session_id = relayer.session_header(SERVICE_ID).session_id;
    let consumed = relayer
        .runtime
        .components()
        .relay_meter()
        .and_then(|m| m.get_session_meter_state(&session_id))
        .map_or(0, |s| s.consumed_stake);
    assert_eq!(consumed, 0);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(relayer.stream_len().await, 0);
    relayer.shutdown().await;
}
