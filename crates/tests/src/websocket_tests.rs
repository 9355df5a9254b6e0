//! WebSocket bridge tests against a live listener.
//!
//! The relay router is served on a random local port so real upgrade handshakes take place
//! between a tungstenite client (the gateway), the relayer and a [`MockWebSocketBackend`].

use crate::mock_infrastructure::{
    json_rpc_payload, service, signed_relay, stranger_key, verify_relay_response,
    MockWebSocketBackend, TestRelayer, APP_ADDRESS, SERVICE_ID,
};
use futures_util::{SinkExt, StreamExt};
use relayer_core::types::Application;
use std::net::SocketAddr;
use tokio::{
    net::TcpListener,
    time::{timeout, Duration},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
    MaybeTlsStream, WebSocketStream,
};

type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn serve(relayer: &TestRelayer) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = relayer.router();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

async fn connect(addr: SocketAddr, service_id: &str) -> Result<Client, tokio_tungstenite::tungstenite::Error> {
    let mut request = format!("ws://{addr}/").into_client_request().unwrap();
    request.headers_mut().insert("Pocket-Service-Id", HeaderValue::from_str(service_id).unwrap());
    connect_async(request).await.map(|(stream, _)| stream)
}

async fn next_frame(client: &mut Client) -> Message {
    loop {
        let msg = timeout(Duration::from_secs(2), client.next())
            .await
            .expect("timed out waiting for frame")
            .expect("connection open")
            .expect("frame reads");
        if !matches!(msg, Message::Ping(_) | Message::Pong(_)) {
            return msg;
        }
    }
}

#[tokio::test]
async fn test_relay_frame_is_signed_and_published() {
    let backend = MockWebSocketBackend::echo().await.unwrap();
    let relayer = TestRelayer::builder()
        .with_service(SERVICE_ID, service("websocket", &backend.url(), "eager"))
        .build()
        .await;
    let addr = serve(&relayer).await;
    let mut client = connect(addr, SERVICE_ID).await.expect("upgrade succeeds");

    let payload = json_rpc_payload("eth_subscribe");
    client.send(Message::Binary(relayer.relay(SERVICE_ID, &payload).into())).await.unwrap();

    let Message::Binary(data) = next_frame(&mut client).await else {
        panic!("expected a binary relay response");
    };
    let (_, response_payload) = verify_relay_response(&data);
    assert_eq!(response_payload.status_code, 200);
    // The echo backend returns the HTTP body it was sent.
    assert_eq!(response_payload.body, payload.body);

    assert!(backend.wait_for_frames(1, Duration::from_secs(1)).await);
    assert_eq!(backend.received().await, vec![payload.body.clone()]);
    assert!(relayer.wait_for_published(1, Duration::from_secs(2)).await);

    client.close(None).await.ok();
    relayer.shutdown().await;
}

#[tokio::test]
async fn test_forged_relay_frame_is_answered_with_error_and_not_forwarded() {
    let backend = MockWebSocketBackend::echo().await.unwrap();
    let relayer = TestRelayer::builder()
        .with_service(SERVICE_ID, service("websocket", &backend.url(), "eager"))
        .build()
        .await;
    let addr = serve(&relayer).await;
    let mut client = connect(addr, SERVICE_ID).await.expect("upgrade succeeds");

    let forged = signed_relay(relayer.session_header(SERVICE_ID), &json_rpc_payload("eth_subscribe"), &stranger_key());
    client.send(Message::Binary(forged.into())).await.unwrap();

    let Message::Binary(data) = next_frame(&mut client).await else {
        panic!("expected a binary error relay response");
    };
    let (response, _) = verify_relay_response(&data);
    let error = response.relay_miner_error.expect("rejection carries a relay miner error");
    assert_eq!(error.code, 403);
    assert!(error.message.contains("relay validation failed"));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(backend.received().await.is_empty());
    assert_eq!(relayer.stream_len().await, 0);

    client.close(None).await.ok();
    relayer.shutdown().await;
}

#[tokio::test]
async fn test_relay_frames_over_session_budget_are_rejected() {
    let backend = MockWebSocketBackend::echo().await.unwrap();
    // 400 stake split over 4 pending sessions leaves 100 per session; each relay costs 42.
    let relayer = TestRelayer::builder()
        .with_service(SERVICE_ID, service("websocket", &backend.url(), "eager"))
        .with_config(|c| c.relay_meter.over_servicing_enabled = false)
        .with_chain(|chain| {
            chain.add_application(Application {
                address: APP_ADDRESS.to_string(),
                stake: 400,
                service_ids: vec![SERVICE_ID.to_string()],
                delegatee_gateway_addresses: Vec::new(),
            });
        })
        .build()
        .await;
    let addr = serve(&relayer).await;
    let mut client = connect(addr, SERVICE_ID).await.expect("upgrade succeeds");

    let payload = json_rpc_payload("eth_blockNumber");
    for _ in 0..2 {
        client.send(Message::Binary(relayer.relay(SERVICE_ID, &payload).into())).await.unwrap();
        let Message::Binary(data) = next_frame(&mut client).await else {
            panic!("expected a binary relay response");
        };
        let (response, response_payload) = verify_relay_response(&data);
        assert!(response.relay_miner_error.is_none());
        assert_eq!(response_payload.body, payload.body);
    }

    client.send(Message::Binary(relayer.relay(SERVICE_ID, &payload).into())).await.unwrap();
    let Message::Binary(data) = next_frame(&mut client).await else {
        panic!("expected a binary error relay response");
    };
    let (response, _) = verify_relay_response(&data);
    assert_eq!(response.relay_miner_error.expect("over-budget relay is rejected").code, 429);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(backend.received().await.len(), 2);
    assert!(relayer.wait_for_published(2, Duration::from_secs(2)).await);

    client.close(None).await.ok();
    relayer.shutdown().await;
}

#[tokio::test]
async fn test_non_relay_frames_pass_through_unsigned() {
    let backend = MockWebSocketBackend::echo().await.unwrap();
    let relayer = TestRelayer::builder()
        .with_service(SERVICE_ID, service("websocket", &backend.url(), "eager"))
        .build()
        .await;
    let addr = serve(&relayer).await;
    let mut client = connect(addr, SERVICE_ID).await.expect("upgrade succeeds");

    client.send(Message::Text("hello".into())).await.unwrap();
    match next_frame(&mut client).await {
        Message::Text(text) => assert_eq!(text.as_str(), "hello"),
        other => panic!("expected text passthrough, got {other:?}"),
    }

    backend.push_text(r#"{"method":"eth_subscription"}"#);
    match next_frame(&mut client).await {
        Message::Text(text) => assert!(text.as_str().contains("eth_subscription")),
        other => panic!("expected pushed notification, got {other:?}"),
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(relayer.stream_len().await, 0);

    client.close(None).await.ok();
    relayer.shutdown().await;
}

#[tokio::test]
async fn test_upgrade_for_unknown_service_is_refused() {
    let backend = MockWebSocketBackend::echo().await.unwrap();
    let relayer = TestRelayer::builder()
        .with_service(SERVICE_ID, service("websocket", &backend.url(), "eager"))
        .build()
        .await;
    let addr = serve(&relayer).await;

    match connect(addr, "solana").await {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 404);
        }
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("upgrade should be refused"),
    }

    relayer.shutdown().await;
}

#[tokio::test]
async fn test_service_without_websocket_backend_is_unavailable() {
    let relayer = TestRelayer::builder()
        .with_service(SERVICE_ID, service("json_rpc", "http://127.0.0.1:1", "eager"))
        .build()
        .await;
    let addr = serve(&relayer).await;

    match connect(addr, SERVICE_ID).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 502);
        }
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("upgrade should be refused"),
    }

    relayer.shutdown().await;
}
