//! Runtime lifecycle: background task ownership and graceful shutdown.

use crate::{config::RelayerConfig, metrics::MetricsCollector, proxy::RelayProxy};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, info, warn};

use super::{builder::RelayerRuntimeBuilder, RelayerComponents};

/// How long shutdown waits for background tasks before aborting them.
const TASK_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Owns the relayer's components and every background task they started.
///
/// [`shutdown`](Self::shutdown) broadcasts on the shutdown channel, closes components in
/// reverse start order and waits for the tasks to exit.
pub struct RelayerRuntime {
    components: RelayerComponents,
    shutdown_tx: broadcast::Sender<()>,
    config: Arc<RelayerConfig>,
    tasks: Vec<JoinHandle<()>>,
    shutdown_initiated: Arc<AtomicBool>,
}

impl RelayerRuntime {
    #[must_use]
    pub fn builder() -> RelayerRuntimeBuilder {
        RelayerRuntimeBuilder::new()
    }

    pub(super) fn new(
        components: RelayerComponents,
        shutdown_tx: broadcast::Sender<()>,
        config: Arc<RelayerConfig>,
        tasks: Vec<JoinHandle<()>>,
    ) -> Self {
        Self { components, shutdown_tx, config, tasks, shutdown_initiated: Arc::new(AtomicBool::new(false)) }
    }

    #[must_use]
    pub fn components(&self) -> &RelayerComponents {
        &self.components
    }

    #[must_use]
    pub fn config(&self) -> &Arc<RelayerConfig> {
        &self.config
    }

    #[must_use]
    pub fn proxy(&self) -> &Arc<RelayProxy> {
        self.components.proxy()
    }

    #[must_use]
    pub fn metrics_collector(&self) -> &Arc<MetricsCollector> {
        self.components.metrics_collector()
    }

    /// Receiver that fires when shutdown starts, for tasks owned outside the runtime.
    #[must_use]
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    #[must_use]
    pub fn background_task_count(&self) -> usize {
        self.tasks.len()
    }

    pub async fn shutdown(self) {
        if self.shutdown_initiated.swap(true, Ordering::SeqCst) {
            warn!("Shutdown already initiated, ignoring duplicate call");
            return;
        }

        info!("Initiating relayer runtime shutdown");
        if let Err(e) = self.shutdown_tx.send(()) {
            debug!(error = %e, "no shutdown receivers left");
        }
        self.components.close_all();

        let count = self.tasks.len();
        for task in self.tasks {
            let abort = task.abort_handle();
            match tokio::time::timeout(TASK_DRAIN_TIMEOUT, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => warn!(error = %e, "background task failed"),
                Err(_) => {
                    warn!("background task did not stop in time, aborting");
                    abort.abort();
                }
            }
        }

        info!(tasks = count, "Relayer runtime shutdown complete");
    }
}

const _: () = {
    const fn assert_send<T: Send>() {}
    const fn assert_sync<T: Sync>() {}
    let _ = assert_send::<RelayerRuntime>;
    let _ = assert_sync::<RelayerRuntime>;
};
