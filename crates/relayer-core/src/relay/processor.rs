use super::{
    difficulty::{
        is_relay_volume_applicable, BaseDifficultyProvider, ComputeUnitsProvider,
        DifficultyProvider, DEFAULT_COMPUTE_UNITS_PER_RELAY,
    },
    errors::RelayError,
    signer::ResponseSigner,
};
use crate::{
    metrics::MetricsCollector,
    transport::MinedRelayMessage,
    types::{Relay, RelayHash, RelayRequest, RelayResponse, RelayResponseMetadata, WireMessage},
};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::debug;

/// Turns a served request/response pair into a billable [`MinedRelayMessage`].
///
/// The response is rebuilt from the payload the client received, signed, then dehydrated to
/// its payload hash before the relay is hashed, so the billed record stays small while still
/// committing to the exact response bytes.
pub struct RelayProcessor {
    signer: Option<Arc<ResponseSigner>>,
    difficulty: Arc<dyn DifficultyProvider>,
    compute_units: Option<Arc<dyn ComputeUnitsProvider>>,
    metrics: Arc<MetricsCollector>,
}

impl RelayProcessor {
    pub fn new(signer: Option<Arc<ResponseSigner>>, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            signer,
            difficulty: Arc::new(BaseDifficultyProvider),
            compute_units: None,
            metrics,
        }
    }

    #[must_use]
    pub fn with_difficulty_provider(mut self, provider: Arc<dyn DifficultyProvider>) -> Self {
        self.difficulty = provider;
        self
    }

    #[must_use]
    pub fn with_compute_units_provider(mut self, provider: Arc<dyn ComputeUnitsProvider>) -> Self {
        self.compute_units = Some(provider);
        self
    }

    /// Builds the mined relay for a served request.
    ///
    /// `response_payload` is the encoded HTTP response payload returned to the client.
    /// Returns `Ok(None)` when `request_body` is not a relay request or the relay does not meet
    /// the service's mining difficulty.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError`] if the request has no session header, the response cannot be
    /// signed, or the relay cannot be encoded.
    pub async fn process_relay(
        &self,
        request_body: &[u8],
        response_payload: &[u8],
        supplier_operator_address: &str,
        service_id: &str,
        arrival_block_height: u64,
    ) -> Result<Option<MinedRelayMessage>, RelayError> {
        let request = match RelayRequest::decode(request_body) {
            Ok(request) => request,
            Err(e) => {
                debug!(service_id, error = %e, "request body is not a valid RelayRequest, skipping");
                return Ok(None);
            }
        };
        let header = request.session_header().cloned().ok_or(RelayError::MissingSessionHeader)?;

        let mut response = RelayResponse {
            meta: RelayResponseMetadata { session_header: Some(header.clone()), ..Default::default() },
            payload: response_payload.to_vec(),
            ..Default::default()
        };
        match &self.signer {
            Some(signer) => signer.sign_relay_response(&mut response, supplier_operator_address)?,
            None => response.update_payload_hash(),
        }
        response.payload = Vec::new();

        let relay_bytes = Relay { req: request, res: response }.encode()?;
        let relay_hash = RelayHash(Sha256::digest(&relay_bytes).into());

        let target = self.difficulty.get_target_hash(service_id).await;
        if !is_relay_volume_applicable(&relay_hash, &target) {
            self.metrics.record_relay_skipped_difficulty(service_id);
            debug!(service_id, relay_hash = %relay_hash, "relay below mining difficulty, not billed");
            return Ok(None);
        }

        let compute_units_per_relay = match &self.compute_units {
            Some(provider) => provider.get_compute_units_per_relay(service_id).await,
            None => DEFAULT_COMPUTE_UNITS_PER_RELAY,
        };

        self.metrics.record_relay_mined(service_id);
        Ok(Some(MinedRelayMessage {
            relay_hash: relay_hash.as_bytes().to_vec(),
            relay_bytes,
            compute_units_per_relay,
            session_id: header.session_id.clone(),
            session_start_height: header.start_height(),
            session_end_height: header.end_height(),
            supplier_operator_address: supplier_operator_address.to_string(),
            service_id: service_id.to_string(),
            application_address: header.application_address,
            arrival_block_height,
            published_at_unix_nano: chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default(),
        }))
    }
}
