//! Runtime wiring: background tasks, block height following and shutdown.

use crate::mock_infrastructure::{service, TestRelayer, CHAIN_HEIGHT, SERVICE_ID};
use tokio::time::{sleep, timeout, Duration, Instant};

async fn wait_for_height(relayer: &TestRelayer, height: u64, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if relayer.runtime.components().block_height().current_height() == height {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_block_height_is_seeded_from_chain() {
    let relayer = TestRelayer::builder()
        .with_service(SERVICE_ID, service("json_rpc", "http://127.0.0.1:1", "eager"))
        .build()
        .await;

    let components = relayer.runtime.components();
    assert_eq!(components.block_height().current_height(), CHAIN_HEIGHT);
    assert_eq!(components.block_subscriber().current_height(), CHAIN_HEIGHT);
    assert!(relayer.runtime.background_task_count() > 0);

    relayer.shutdown().await;
}

#[tokio::test]
async fn test_block_watcher_follows_chain_tip() {
    let relayer = TestRelayer::builder()
        .with_service(SERVICE_ID, service("json_rpc", "http://127.0.0.1:1", "eager"))
        .with_block_watcher(Duration::from_millis(50))
        .build()
        .await;
    let mut events = relayer.runtime.components().block_subscriber().subscribe();

    relayer.chain.set_height(CHAIN_HEIGHT + 8);
    assert!(
        wait_for_height(&relayer, CHAIN_HEIGHT + 8, Duration::from_secs(2)).await,
        "local height did not follow the chain"
    );

    let event = timeout(Duration::from_secs(1), events.recv()).await.unwrap().unwrap();
    assert!(event.height > CHAIN_HEIGHT);

    relayer.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_notifies_external_receivers() {
    let relayer = TestRelayer::builder()
        .with_service(SERVICE_ID, service("json_rpc", "http://127.0.0.1:1", "eager"))
        .with_block_watcher(Duration::from_millis(50))
        .build()
        .await;
    let mut shutdown_rx = relayer.runtime.shutdown_receiver();

    let waiter = tokio::spawn(async move { shutdown_rx.recv().await.is_ok() });
    relayer.shutdown().await;

    assert!(timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap());
}
