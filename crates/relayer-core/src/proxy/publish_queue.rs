//! Bounded hand-off from the request path to relay mining and publication.
//!
//! Enqueueing never blocks: when the queue is full the relay is dropped and counted. Workers
//! run on the server's lifetime, so a relay enqueued by a request that is later cancelled is
//! still processed.

use crate::{
    metrics::MetricsCollector,
    relay::RelayProcessor,
    transport::MinedRelayPublisher,
};
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub const DEFAULT_PUBLISH_WORKERS: usize = 4;
pub const DEFAULT_PUBLISH_QUEUE_SIZE: usize = 10_000;

/// One served relay awaiting mining.
#[derive(Debug, Clone)]
pub struct PublishTask {
    /// Encoded relay request, exactly as received.
    pub request_body: Vec<u8>,
    /// Encoded HTTP response payload that was signed for the client.
    pub response_payload: Vec<u8>,
    pub service_id: String,
    pub supplier_operator_address: String,
    pub arrival_block_height: u64,
}

pub struct PublishQueue {
    tx: mpsc::Sender<PublishTask>,
    rx: Mutex<Option<mpsc::Receiver<PublishTask>>>,
    workers: usize,
    processor: Arc<RelayProcessor>,
    publisher: Arc<dyn MinedRelayPublisher>,
    metrics: Arc<MetricsCollector>,
    closed: AtomicBool,
    stop_tx: broadcast::Sender<()>,
}

impl PublishQueue {
    pub fn new(
        processor: Arc<RelayProcessor>,
        publisher: Arc<dyn MinedRelayPublisher>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self::with_capacity(
            DEFAULT_PUBLISH_QUEUE_SIZE,
            DEFAULT_PUBLISH_WORKERS,
            processor,
            publisher,
            metrics,
        )
    }

    pub fn with_capacity(
        queue_size: usize,
        workers: usize,
        processor: Arc<RelayProcessor>,
        publisher: Arc<dyn MinedRelayPublisher>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        let (stop_tx, _) = broadcast::channel(1);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            workers: workers.max(1),
            processor,
            publisher,
            metrics,
            closed: AtomicBool::new(false),
            stop_tx,
        }
    }

    /// Queues `task` without waiting. Returns `false` if it was dropped.
    pub fn submit(&self, task: PublishTask) -> bool {
        if self.closed.load(Ordering::Acquire) {
            self.metrics.record_relay_dropped(&task.service_id);
            return false;
        }

        match self.tx.try_send(task) {
            Ok(()) => true,
            Err(e) => {
                let task = e.into_inner();
                warn!(
                    service_id = %task.service_id,
                    supplier = %task.supplier_operator_address,
                    "publish queue full, relay dropped"
                );
                self.metrics.record_relay_dropped(&task.service_id);
                false
            }
        }
    }

    /// Mines and publishes one relay.
    pub async fn execute(&self, task: PublishTask) {
        let mined = match self
            .processor
            .process_relay(
                &task.request_body,
                &task.response_payload,
                &task.supplier_operator_address,
                &task.service_id,
                task.arrival_block_height,
            )
            .await
        {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!(service_id = %task.service_id, "relay skipped (not mined)");
                return;
            }
            Err(e) => {
                warn!(service_id = %task.service_id, error = %e, "failed to process relay");
                return;
            }
        };

        match self.publisher.publish(mined).await {
            Ok(id) => {
                debug!(
                    service_id = %task.service_id,
                    supplier = %task.supplier_operator_address,
                    stream_id = %id,
                    "published mined relay"
                );
            }
            Err(e) => {
                self.metrics.record_relay_publish_error(&task.service_id);
                warn!(service_id = %task.service_id, error = %e, "failed to publish mined relay");
            }
        }
    }

    /// Spawns the worker pool. A second call spawns nothing.
    pub fn start(self: &Arc<Self>, shutdown_rx: broadcast::Receiver<()>) -> Vec<JoinHandle<()>> {
        let Some(rx) = self.rx.lock().take() else {
            warn!("publish queue already started");
            return Vec::new();
        };
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let handles = (0..self.workers)
            .map(|worker_id| {
                let queue = Arc::clone(self);
                let rx = Arc::clone(&rx);
                let mut shutdown_rx = shutdown_rx.resubscribe();
                let mut stop_rx = self.stop_tx.subscribe();

                tokio::spawn(async move {
                    loop {
                        let task = tokio::select! {
                            biased;

                            _ = shutdown_rx.recv() => break,
                            _ = stop_rx.recv() => break,
                            task = async { rx.lock().await.recv().await } => task,
                        };
                        let Some(task) = task else { break };
                        queue.execute(task).await;
                    }
                    debug!(worker_id, "publish worker stopped");
                })
            })
            .collect();

        info!(workers = self.workers, "publish workers started");
        handles
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.stop_tx.send(());
        }
    }
}
