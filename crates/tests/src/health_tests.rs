//! Backend health checking and its effect on relay admission.

use crate::mock_infrastructure::{json_rpc_payload, TestRelayer, SERVICE_ID};
use axum::http::StatusCode;
use relayer_core::{
    config::{BackendConfig, BackendHealthCheckConfig, ServiceConfig},
    metrics::MetricsCollector,
    upstream::{backend_id, HealthChecker, HealthStatus},
};
use std::{collections::HashMap, sync::Arc};

fn health_config(unhealthy_threshold: u32, healthy_threshold: u32) -> BackendHealthCheckConfig {
    BackendHealthCheckConfig {
        enabled: true,
        endpoint: "/health".to_string(),
        interval_seconds: 60,
        timeout_seconds: 1,
        unhealthy_threshold,
        healthy_threshold,
    }
}

#[tokio::test]
async fn test_thresholds_gate_status_transitions() {
    let mut backend = mockito::Server::new_async().await;
    let failing = backend.mock("GET", "/health").with_status(500).expect(2).create_async().await;

    let checker = HealthChecker::new(Arc::new(MetricsCollector::new().unwrap())).unwrap();
    let id = backend_id(SERVICE_ID, "json_rpc");
    checker.register_backend(&id, &backend.url(), Some(health_config(2, 2)));
    assert_eq!(checker.get_health(&id).unwrap().status, HealthStatus::Unknown);

    checker.check_now(&id).await.unwrap();
    assert!(checker.is_healthy(&id), "one failure is below the threshold");
    checker.check_now(&id).await.unwrap();
    assert!(!checker.is_healthy(&id));

    let health = checker.get_health(&id).unwrap();
    assert_eq!(health.consecutive_failures, 2);
    assert!(health.last_error.unwrap().contains("500"));
    failing.assert_async().await;
    failing.remove_async().await;

    let _recovered = backend.mock("GET", "/health").with_status(200).create_async().await;
    checker.check_now(&id).await.unwrap();
    assert!(!checker.is_healthy(&id), "one success is below the threshold");
    checker.check_now(&id).await.unwrap();
    assert_eq!(checker.get_health(&id).unwrap().status, HealthStatus::Healthy);
}

#[tokio::test]
async fn test_backend_without_health_config_cannot_be_checked() {
    let checker = HealthChecker::new(Arc::new(MetricsCollector::new().unwrap())).unwrap();
    checker.register_backend("anvil/rest", "http://127.0.0.1:1", None);

    assert!(checker.check_now("anvil/rest").await.is_err());
    assert!(checker.check_now("missing/rest").await.is_err());
    assert!(checker.is_healthy("anvil/rest"));
}

#[tokio::test]
async fn test_unhealthy_backend_rejects_relays() {
    let mut backend = mockito::Server::new_async().await;
    let _health = backend.mock("GET", "/health").with_status(503).create_async().await;
    let relay_mock = backend.mock("POST", "/").expect(0).create_async().await;

    let service = ServiceConfig {
        validation_mode: Some("eager".to_string()),
        backends: HashMap::from([(
            "json_rpc".to_string(),
            BackendConfig {
                url: backend.url(),
                health_check: Some(health_config(3, 2)),
                ..Default::default()
            },
        )]),
        ..Default::default()
    };
    let relayer = TestRelayer::builder().with_service(SERVICE_ID, service).build().await;

    let checker = relayer.runtime.components().health_checker().clone();
    let id = backend_id(SERVICE_ID, "json_rpc");
    for _ in 0..3 {
        checker.check_now(&id).await.unwrap();
    }
    assert!(!checker.is_healthy(&id));

    let response = relayer.post(relayer.relay(SERVICE_ID, &json_rpc_payload("eth_chainId"))).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    relay_mock.assert_async().await;
    relayer.shutdown().await;
}
