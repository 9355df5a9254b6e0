use super::{
    errors::ProxyError,
    publish_queue::{PublishQueue, PublishTask},
};
use crate::{
    cache::SupplierLookup,
    chain::BlockHeightState,
    config::{BackendConfig, RelayerConfig, ValidationMode},
    metrics::MetricsCollector,
    relay::{
        RelayMeter, RelayValidator, ResponseSigner, SessionValidationRequest, SessionValidator,
        SessionVerdict,
    },
    types::{rpc_type, HttpRequestPayload, RelayRequest, WireMessage, DEFAULT_RPC_TYPE},
    upstream::{
        backend_id, http_client::RPC_TYPE_HEADER, select_backend, BackendClient, HealthChecker,
        UpstreamError,
    },
};
use bytes::Bytes;
use http::HeaderMap;
use parking_lot::Mutex;
use std::{sync::Arc, time::Instant};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

/// Inbound header naming the supplier when neither the relay nor the config does.
pub const SUPPLIER_ADDRESS_HEADER: &str = "Pocket-Supplier-Address";

/// A relay that passed every pre-forward check.
#[derive(Debug, Clone)]
pub struct AdmittedRelay {
    pub request: RelayRequest,
    /// The request exactly as received, for billing.
    pub request_body: Bytes,
    pub payload: HttpRequestPayload,
    pub service_id: String,
    pub rpc_type: String,
    pub backend: BackendConfig,
    /// Height pinned at arrival; drives grace-period checks downstream.
    pub arrival_block_height: u64,
    pub validation_mode: ValidationMode,
    pub supplier_operator_address: Option<String>,
    /// Whether the meter charged this relay against the session budget.
    pub metered: bool,
    pub protocol: &'static str,
    pub received_at: Instant,
}

/// The relay pipeline shared by every ingress protocol.
pub struct RelayProxy {
    config: Arc<RelayerConfig>,
    signer: Arc<ResponseSigner>,
    health: Arc<HealthChecker>,
    block_height: BlockHeightState,
    publish_queue: Arc<PublishQueue>,
    metrics: Arc<MetricsCollector>,
    client: BackendClient,
    suppliers: Option<Arc<dyn SupplierLookup>>,
    validator: Option<Arc<dyn RelayValidator>>,
    session_validator: Option<Arc<SessionValidator>>,
    meter: Option<Arc<RelayMeter>>,
    /// Served optimistic relays waiting for validation before billing.
    optimistic_tx: mpsc::Sender<(AdmittedRelay, Vec<u8>)>,
    optimistic_rx: Mutex<Option<mpsc::Receiver<(AdmittedRelay, Vec<u8>)>>>,
    optimistic_workers: usize,
}

impl RelayProxy {
    /// # Errors
    ///
    /// Returns an error if the backend HTTP client cannot be built.
    pub fn new(
        config: Arc<RelayerConfig>,
        signer: Arc<ResponseSigner>,
        health: Arc<HealthChecker>,
        block_height: BlockHeightState,
        publish_queue: Arc<PublishQueue>,
        metrics: Arc<MetricsCollector>,
    ) -> Result<Self, UpstreamError> {
        let (optimistic_tx, optimistic_rx) = mpsc::channel(config.session_validation.queue_size.max(1));
        let optimistic_workers = config.session_validation.workers.max(1);
        Ok(Self {
            config,
            signer,
            health,
            block_height,
            publish_queue,
            metrics,
            client: BackendClient::new()?,
            suppliers: None,
            validator: None,
            session_validator: None,
            meter: None,
            optimistic_tx,
            optimistic_rx: Mutex::new(Some(optimistic_rx)),
            optimistic_workers,
        })
    }

    #[must_use]
    pub fn with_supplier_lookup(mut self, suppliers: Arc<dyn SupplierLookup>) -> Self {
        self.suppliers = Some(suppliers);
        self
    }

    #[must_use]
    pub fn with_validator(mut self, validator: Arc<dyn RelayValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Optimistic services validate through this pool instead of calling the validator inline.
    #[must_use]
    pub fn with_session_validator(mut self, session_validator: Arc<SessionValidator>) -> Self {
        self.session_validator = Some(session_validator);
        self
    }

    #[must_use]
    pub fn with_meter(mut self, meter: Arc<RelayMeter>) -> Self {
        self.meter = Some(meter);
        self
    }

    #[must_use]
    pub fn config(&self) -> &RelayerConfig {
        &self.config
    }

    #[must_use]
    pub fn signer(&self) -> &ResponseSigner {
        &self.signer
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    #[must_use]
    pub(crate) fn client(&self) -> &BackendClient {
        &self.client
    }

    #[must_use]
    pub fn current_block_height(&self) -> u64 {
        self.block_height.current_height()
    }

    /// Decodes `body` as a relay request and extracts its service and HTTP payload.
    ///
    /// # Errors
    ///
    /// [`ProxyError::InvalidRelayRequest`] for anything that is not an encoded relay request
    /// carrying an HTTP payload; [`ProxyError::MissingServiceId`] when the session header
    /// names no service.
    pub fn parse_relay_request(
        &self,
        body: &[u8],
    ) -> Result<(RelayRequest, String, HttpRequestPayload), ProxyError> {
        if body.is_empty() {
            return Err(ProxyError::InvalidRelayRequest);
        }
        let request = RelayRequest::decode(body).map_err(|e| {
            debug!(error = %e, "rejected request: not a valid RelayRequest");
            ProxyError::InvalidRelayRequest
        })?;

        let service_id = request.service_id().to_string();
        if service_id.is_empty() {
            return Err(ProxyError::MissingServiceId);
        }

        let payload = HttpRequestPayload::decode(&request.payload).map_err(|e| {
            debug!(service_id, error = %e, "failed to decode HTTP payload from relay");
            ProxyError::InvalidRelayRequest
        })?;

        Ok((request, service_id, payload))
    }

    /// Runs every check that precedes the backend call.
    ///
    /// # Errors
    ///
    /// Returns the [`ProxyError`] for the first failed check. The rejection is already counted.
    pub async fn admit(
        &self,
        inbound_headers: &HeaderMap,
        body: Bytes,
        protocol: &'static str,
    ) -> Result<AdmittedRelay, ProxyError> {
        let received_at = Instant::now();
        let result = self.admit_inner(inbound_headers, body, protocol, received_at).await;
        if let Err((service_id, e)) = &result {
            self.metrics.record_relay_rejected(service_id, e);
        }
        result.map_err(|(_, e)| e)
    }

    async fn admit_inner(
        &self,
        inbound_headers: &HeaderMap,
        body: Bytes,
        protocol: &'static str,
        received_at: Instant,
    ) -> Result<AdmittedRelay, (String, ProxyError)> {
        let unknown = || "unknown".to_string();

        if body.len() as u64 > self.config.default_max_body_size_bytes {
            return Err((unknown(), ProxyError::BodyTooLarge));
        }

        let (request, service_id, payload) =
            self.parse_relay_request(&body).map_err(|e| (unknown(), e))?;
        let reject = |e: ProxyError| (service_id.clone(), e);

        self.metrics.record_relay_received(&service_id, protocol);

        let Some(service) = self.config.services.get(&service_id) else {
            return Err(reject(ProxyError::UnknownService(service_id.clone())));
        };

        let supplier = request.meta.supplier_operator_address.clone();
        if !supplier.is_empty() {
            self.check_supplier(&supplier, &service_id).await.map_err(&reject)?;
        }

        let requested_rpc_type = payload
            .header(RPC_TYPE_HEADER)
            .or_else(|| inbound_headers.get(RPC_TYPE_HEADER).and_then(|v| v.to_str().ok()))
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| {
                let grpc = payload
                    .header("Content-Type")
                    .is_some_and(|ct| ct.starts_with("application/grpc"));
                if grpc { rpc_type::GRPC } else { DEFAULT_RPC_TYPE }
            })
            .to_string();
        let Some((rpc_type, backend)) = select_backend(service, &requested_rpc_type) else {
            return Err(reject(ProxyError::Backend(UpstreamError::NoBackend(service_id.clone()))));
        };

        if !self.health.is_healthy(&backend_id(&service_id, rpc_type)) {
            return Err(reject(ProxyError::BackendUnhealthy));
        }

        if body.len() as u64 > self.config.service_max_body_size(&service_id) {
            return Err(reject(ProxyError::ServiceBodyTooLarge));
        }

        let arrival_block_height = self.block_height.current_height();
        let validation_mode = self.config.service_validation_mode(&service_id);

        if validation_mode == ValidationMode::Eager {
            self.validate_eager(&request, arrival_block_height).await.map_err(&reject)?;
        }

        let metered = self.meter_relay(&request, &service_id).await.map_err(&reject)?;

        let supplier_operator_address = Some(supplier)
            .filter(|s| !s.is_empty())
            .or_else(|| self.config.supplier_operator_address.clone().filter(|s| !s.is_empty()))
            .or_else(|| {
                inbound_headers
                    .get(SUPPLIER_ADDRESS_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
            });

        Ok(AdmittedRelay {
            rpc_type: rpc_type.to_string(),
            backend: backend.clone(),
            request,
            request_body: body,
            payload,
            service_id,
            arrival_block_height,
            validation_mode,
            supplier_operator_address,
            metered,
            protocol,
            received_at,
        })
    }

    async fn check_supplier(&self, supplier: &str, service_id: &str) -> Result<(), ProxyError> {
        let Some(suppliers) = &self.suppliers else {
            return Ok(());
        };

        let state = match suppliers.get_state(supplier).await {
            Ok(state) => state,
            Err(e) => {
                // The cache has already applied fail-open; anything left is treated as absent.
                warn!(supplier, service_id, error = %e, "failed to check supplier state in cache");
                return Err(ProxyError::SupplierNotRegistered(supplier.to_string()));
            }
        };

        let Some(state) = state else {
            info!(supplier, service_id, "supplier not found in cache");
            return Err(ProxyError::SupplierNotRegistered(supplier.to_string()));
        };
        if state.assumed_active {
            return Ok(());
        }
        if !state.is_active() {
            info!(supplier, service_id, status = %state.status, "supplier not active");
            return Err(ProxyError::SupplierInactive {
                supplier: supplier.to_string(),
                status: state.status,
            });
        }
        if state.services.is_empty() {
            return Err(ProxyError::SupplierNoServices(supplier.to_string()));
        }
        if !state.is_active_for_service(service_id) {
            info!(supplier, service_id, registered_services = ?state.services, "supplier not staked for service");
            return Err(ProxyError::SupplierWrongService {
                supplier: supplier.to_string(),
                service_id: service_id.to_string(),
                staked: state.services,
            });
        }
        Ok(())
    }

    async fn validate_eager(&self, request: &RelayRequest, height: u64) -> Result<(), ProxyError> {
        let Some(validator) = &self.validator else {
            debug!("no validator configured, skipping signature validation");
            return Ok(());
        };

        let started = Instant::now();
        if let Err(e) = validator.validate_relay_request(request, height).await {
            self.metrics.record_validation("eager", e.as_label());
            return Err(ProxyError::ValidationFailed(format!("relay validation failed: {e}")));
        }
        self.metrics.record_validation("eager", "valid");

        if let Err(e) = validator.check_reward_eligibility(request, height).await {
            warn!(session_id = %request.session_id(), error = %e, "relay not eligible for rewards (continuing to serve)");
        }
        debug!(elapsed_ms = started.elapsed().as_millis() as u64, "eager validation passed");
        Ok(())
    }

    async fn meter_relay(&self, request: &RelayRequest, service_id: &str) -> Result<bool, ProxyError> {
        let (Some(meter), Some(header)) = (&self.meter, request.session_header()) else {
            return Ok(false);
        };

        match meter
            .check_and_consume_relay(
                &header.session_id,
                &header.application_address,
                service_id,
                header.end_height(),
            )
            .await
        {
            Ok(decision) if !decision.allowed => Err(ProxyError::OverServiced),
            Ok(decision) => Ok(!decision.over_serviced),
            Err(e) => {
                debug!(service_id, error = %e, "relay meter unavailable, serving unmetered");
                Ok(false)
            }
        }
    }

    /// Returns the charge for a relay that will not be billed.
    pub async fn release(&self, relay: &AdmittedRelay) {
        if let (true, Some(meter)) = (relay.metered, &self.meter) {
            meter.revert_relay_consumption(relay.request.session_id(), &relay.service_id).await;
        }
    }

    /// Counts a failed backend call and releases the relay's charge.
    pub async fn backend_failed(&self, relay: &AdmittedRelay, error: UpstreamError) -> ProxyError {
        self.release(relay).await;
        self.backend_unavailable(&relay.service_id, error)
    }

    /// Counts a backend failure for `service_id` and turns it into the caller-facing error.
    pub fn backend_unavailable(&self, service_id: &str, error: UpstreamError) -> ProxyError {
        warn!(service_id, error = %error, "backend request failed");
        self.metrics.record_backend_error(service_id, &error);
        let e = ProxyError::Backend(error);
        self.metrics.record_relay_rejected(service_id, &e);
        e
    }

    /// Records the relay as served and hands it to billing.
    ///
    /// `response_payload` is the encoded HTTP response that was (or, for streams, would have
    /// been) signed for the client. Optimistic relays are queued for the validation workers
    /// started by [`RelayProxy::start`]; when the queue is full the relay goes unbilled.
    pub fn complete(&self, relay: AdmittedRelay, response_payload: Vec<u8>) {
        self.metrics.record_relay_served(
            &relay.service_id,
            relay.protocol,
            relay.received_at.elapsed().as_secs_f64(),
        );

        match relay.validation_mode {
            ValidationMode::Eager => self.submit_publish(relay, response_payload),
            ValidationMode::Optimistic => {
                if let Err(e) = self.optimistic_tx.try_send((relay, response_payload)) {
                    let (relay, _) = e.into_inner();
                    warn!(
                        service_id = %relay.service_id,
                        session_id = %relay.request.session_id(),
                        "optimistic validation queue full, relay will not be billed"
                    );
                    self.metrics.record_validation_dropped();
                }
            }
        }
    }

    /// Starts the workers that validate served optimistic relays and publish the valid ones.
    pub fn start(self: &Arc<Self>, shutdown_rx: broadcast::Receiver<()>) -> Vec<JoinHandle<()>> {
        let Some(queue_rx) = self.optimistic_rx.lock().take() else {
            warn!("optimistic validation workers already started");
            return Vec::new();
        };
        let queue_rx = Arc::new(tokio::sync::Mutex::new(queue_rx));

        let handles = (0..self.optimistic_workers)
            .map(|worker| {
                let proxy = Arc::clone(self);
                let queue_rx = Arc::clone(&queue_rx);
                let mut shutdown_rx = shutdown_rx.resubscribe();

                tokio::spawn(async move {
                    loop {
                        let next = tokio::select! {
                            biased;

                            _ = shutdown_rx.recv() => break,

                            next = async { queue_rx.lock().await.recv().await } => next,
                        };
                        let Some((relay, response_payload)) = next else { break };
                        if proxy.validate_optimistic(&relay).await {
                            proxy.submit_publish(relay, response_payload);
                        }
                    }
                    debug!(worker, "optimistic validation worker stopped");
                })
            })
            .collect();

        info!(workers = self.optimistic_workers, "optimistic validation workers started");
        handles
    }

    /// Post-response validation. Returns whether the relay may be billed.
    async fn validate_optimistic(&self, relay: &AdmittedRelay) -> bool {
        let service_id = relay.service_id.as_str();
        let session_id = relay.request.session_id().to_string();

        if let Some(session_validator) = &self.session_validator {
            let request = SessionValidationRequest {
                request: relay.request.clone(),
                arrival_block_height: relay.arrival_block_height,
            };
            return match session_validator.validate_relay_request(request).await {
                Ok(SessionVerdict::Invalid(e)) => {
                    debug!(service_id, error = %e, "optimistic validation failed");
                    session_validator.reject_session(&session_id, &e).await;
                    false
                }
                Ok(_) => true,
                Err(e) => {
                    debug!(service_id, error = %e, "optimistic validation error");
                    false
                }
            };
        }

        let Some(validator) = &self.validator else {
            return true;
        };
        match validator.validate_relay_request(&relay.request, relay.arrival_block_height).await {
            Ok(()) => {
                self.metrics.record_validation("optimistic", "valid");
                true
            }
            Err(e) => {
                self.metrics.record_validation("optimistic", e.as_label());
                debug!(service_id, error = %e, "optimistic validation failed");
                false
            }
        }
    }

    fn submit_publish(&self, relay: AdmittedRelay, response_payload: Vec<u8>) {
        let Some(supplier) = relay.supplier_operator_address else {
            warn!(service_id = %relay.service_id, "no supplier address available, skipping relay publication");
            return;
        };

        self.publish_queue.submit(PublishTask {
            request_body: relay.request_body.to_vec(),
            response_payload,
            service_id: relay.service_id,
            supplier_operator_address: supplier,
            arrival_block_height: relay.arrival_block_height,
        });
    }
}
