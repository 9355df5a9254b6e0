//! Component container for the relayer runtime.

use crate::{
    cache::{BlockHeightSubscriber, SessionCache, SharedParamCache, SupplierCache},
    chain::BlockHeightState,
    metrics::MetricsCollector,
    proxy::{PublishQueue, RelayProxy},
    relay::{RelayMeter, ResponseSigner, SessionValidator},
    transport::StreamPublisher,
    upstream::HealthChecker,
};
use std::sync::Arc;

/// Every initialized component, shared by `Arc`.
///
/// Built by [`RelayerRuntimeBuilder`](super::RelayerRuntimeBuilder); fields are crate-visible so
/// the lifecycle can close them in order.
#[derive(Clone)]
pub struct RelayerComponents {
    pub(crate) metrics: Arc<MetricsCollector>,
    pub(crate) block_height: BlockHeightState,
    pub(crate) shared_params: Arc<SharedParamCache>,
    pub(crate) session_cache: Arc<SessionCache>,
    pub(crate) supplier_cache: Arc<SupplierCache>,
    pub(crate) block_subscriber: Arc<BlockHeightSubscriber>,
    pub(crate) health_checker: Arc<HealthChecker>,
    pub(crate) relay_meter: Option<Arc<RelayMeter>>,
    pub(crate) session_validator: Arc<SessionValidator>,
    pub(crate) publisher: Arc<StreamPublisher>,
    pub(crate) publish_queue: Arc<PublishQueue>,
    pub(crate) signer: Arc<ResponseSigner>,
    pub(crate) proxy: Arc<RelayProxy>,
}

impl RelayerComponents {
    #[must_use]
    pub fn metrics_collector(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    #[must_use]
    pub fn block_height(&self) -> &BlockHeightState {
        &self.block_height
    }

    #[must_use]
    pub fn shared_params(&self) -> &Arc<SharedParamCache> {
        &self.shared_params
    }

    #[must_use]
    pub fn session_cache(&self) -> &Arc<SessionCache> {
        &self.session_cache
    }

    #[must_use]
    pub fn supplier_cache(&self) -> &Arc<SupplierCache> {
        &self.supplier_cache
    }

    #[must_use]
    pub fn block_subscriber(&self) -> &Arc<BlockHeightSubscriber> {
        &self.block_subscriber
    }

    #[must_use]
    pub fn health_checker(&self) -> &Arc<HealthChecker> {
        &self.health_checker
    }

    /// `None` when `relay_meter.enabled` is off.
    #[must_use]
    pub fn relay_meter(&self) -> Option<&Arc<RelayMeter>> {
        self.relay_meter.as_ref()
    }

    #[must_use]
    pub fn session_validator(&self) -> &Arc<SessionValidator> {
        &self.session_validator
    }

    #[must_use]
    pub fn publish_queue(&self) -> &Arc<PublishQueue> {
        &self.publish_queue
    }

    #[must_use]
    pub fn signer(&self) -> &Arc<ResponseSigner> {
        &self.signer
    }

    #[must_use]
    pub fn proxy(&self) -> &Arc<RelayProxy> {
        &self.proxy
    }

    /// Closes every component in reverse start order.
    pub(crate) fn close_all(&self) {
        self.publish_queue.close();
        self.publisher.close();
        self.session_validator.close();
        if let Some(meter) = &self.relay_meter {
            meter.close();
        }
        self.health_checker.close();
        self.block_subscriber.close();
        self.session_cache.close();
        self.shared_params.close();
    }
}
