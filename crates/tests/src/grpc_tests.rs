//! `SendRelay` over native gRPC and binary gRPC-Web.

use crate::mock_infrastructure::{
    json_rpc_payload, service, verify_relay_response, TestRelayer, SERVICE_ID,
};
use axum::{
    body::Body,
    http::{header, Request, StatusCode},
};
use http_body_util::BodyExt;
use relayer_core::proxy::grpc::{decode_frame, encode_frame, SEND_RELAY_PATH};
use tower::ServiceExt;

async fn grpc_backend() -> (mockito::ServerGuard, mockito::Mock) {
    let mut backend = mockito::Server::new_async().await;
    let mock = backend
        .mock("POST", "/")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"result":"0x1"}"#)
        .expect(1)
        .create_async()
        .await;
    (backend, mock)
}

fn grpc_request(path: &str, content_type: &str, message: &[u8]) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from(encode_frame(message)))
        .expect("request builds")
}

#[tokio::test]
async fn test_native_grpc_send_relay() {
    let (backend, mock) = grpc_backend().await;
    let relayer = TestRelayer::builder()
        .with_service(SERVICE_ID, service("json_rpc", &backend.url(), "eager"))
        .build()
        .await;

    let relay = relayer.relay(SERVICE_ID, &json_rpc_payload("eth_blockNumber"));
    let response = relayer
        .router()
        .oneshot(grpc_request(SEND_RELAY_PATH, "application/grpc", &relay))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "application/grpc");

    let collected = response.into_body().collect().await.unwrap();
    let trailers = collected.trailers().cloned().expect("status trailers");
    assert_eq!(trailers["grpc-status"], "0");

    let body = collected.to_bytes();
    let message = decode_frame(&body).expect("single response message");
    let (_, payload) = verify_relay_response(message);
    assert_eq!(payload.body, br#"{"result":"0x1"}"#);

    mock.assert_async().await;
    assert!(relayer.wait_for_published(1, std::time::Duration::from_secs(2)).await);
    relayer.shutdown().await;
}

#[tokio::test]
async fn test_grpc_web_send_relay_appends_trailer_frame() {
    let (backend, mock) = grpc_backend().await;
    let relayer = TestRelayer::builder()
        .with_service(SERVICE_ID, service("json_rpc", &backend.url(), "eager"))
        .build()
        .await;

    let relay = relayer.relay(SERVICE_ID, &json_rpc_payload("eth_blockNumber"));
    let response = relayer
        .router()
        .oneshot(grpc_request(SEND_RELAY_PATH, "application/grpc-web+proto", &relay))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "application/grpc-web+proto");

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let len = u32::from_be_bytes([body[1], body[2], body[3], body[4]]) as usize;
    let (data, trailer) = body.split_at(5 + len);
    verify_relay_response(decode_frame(data).expect("data frame"));

    assert_eq!(trailer[0], 0x80);
    let block = String::from_utf8(trailer[5..].to_vec()).unwrap();
    assert!(block.contains("grpc-status:0"));

    mock.assert_async().await;
    relayer.shutdown().await;
}

#[tokio::test]
async fn test_grpc_unknown_method_is_unimplemented() {
    let relayer = TestRelayer::builder()
        .with_service(SERVICE_ID, service("json_rpc", "http://127.0.0.1:1", "eager"))
        .build()
        .await;

    let relay = relayer.relay(SERVICE_ID, &json_rpc_payload("eth_blockNumber"));
    let response = relayer
        .router()
        .oneshot(grpc_request("/pocket.service.RelayService/Other", "application/grpc", &relay))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["grpc-status"], "12");

    relayer.shutdown().await;
}

#[tokio::test]
async fn test_grpc_rejection_maps_to_status_code() {
    let relayer = TestRelayer::builder()
        .with_service(SERVICE_ID, service("json_rpc", "http://127.0.0.1:1", "eager"))
        .build()
        .await;

    let relay = relayer.relay("solana", &json_rpc_payload("getSlot"));
    let response = relayer
        .router()
        .oneshot(grpc_request(SEND_RELAY_PATH, "application/grpc", &relay))
        .await
        .unwrap();
    assert_eq!(response.headers()["grpc-status"], "5");
    assert!(response.headers()["grpc-message"].to_str().unwrap().contains("unknown service"));

    relayer.shutdown().await;
}
