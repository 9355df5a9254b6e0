//! Relay request validation.
//!
//! Checks run cheapest first and stop at the first failure:
//!
//! 1. envelope sanity (`validate_basic`)
//! 2. supplier is one this relayer serves
//! 3. session timing: the height to look the session up at, honouring the grace period
//! 4. request signature against the application's signing ring
//! 5. session lookup (cached) at that height
//! 6. session ID matches the one the client claims
//! 7. supplier is a member of the session
//!
//! The signing ring is the application plus every gateway it delegates to; a request is
//! authentic if any ring member's key verifies the signature over the request's signable hash.

use super::errors::ValidationError;
use crate::{
    cache::{SessionLookup, SharedParamsLookup},
    chain::{AccountQueryClient, ApplicationQueryClient},
    types::{RelayRequest, SessionHeader},
};
use async_trait::async_trait;
use dashmap::DashMap;
use k256::ecdsa::{signature::hazmat::PrehashVerifier, Signature, VerifyingKey};
use std::{collections::HashSet, sync::Arc};
use tracing::debug;

#[async_trait]
pub trait RelayValidator: Send + Sync {
    /// Validates `request` as of `current_height` (the request's arrival height).
    async fn validate_relay_request(
        &self,
        request: &RelayRequest,
        current_height: u64,
    ) -> Result<(), ValidationError>;

    /// Rejects relays whose session has reached its claim window.
    async fn check_reward_eligibility(
        &self,
        request: &RelayRequest,
        current_height: u64,
    ) -> Result<(), ValidationError>;
}

#[async_trait]
pub trait RingVerifier: Send + Sync {
    async fn verify_relay_request_signature(
        &self,
        request: &RelayRequest,
    ) -> Result<(), ValidationError>;
}

/// Verifies secp256k1 request signatures against the application and its delegated gateways.
pub struct EcdsaRingVerifier {
    applications: Arc<dyn ApplicationQueryClient>,
    accounts: Arc<dyn AccountQueryClient>,
    public_keys: DashMap<String, VerifyingKey>,
}

impl EcdsaRingVerifier {
    pub fn new(
        applications: Arc<dyn ApplicationQueryClient>,
        accounts: Arc<dyn AccountQueryClient>,
    ) -> Self {
        Self { applications, accounts, public_keys: DashMap::new() }
    }

    async fn public_key(&self, address: &str) -> Option<VerifyingKey> {
        if let Some(key) = self.public_keys.get(address) {
            return Some(*key);
        }

        let bytes = match self.accounts.get_public_key(address).await {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(address, error = %e, "public key unavailable for ring member");
                return None;
            }
        };
        match VerifyingKey::from_sec1_bytes(&bytes) {
            Ok(key) => {
                self.public_keys.insert(address.to_string(), key);
                Some(key)
            }
            Err(e) => {
                debug!(address, error = %e, "ring member has an invalid public key");
                None
            }
        }
    }
}

#[async_trait]
impl RingVerifier for EcdsaRingVerifier {
    async fn verify_relay_request_signature(
        &self,
        request: &RelayRequest,
    ) -> Result<(), ValidationError> {
        let header = request
            .session_header()
            .ok_or_else(|| ValidationError::Signature("missing session header".to_string()))?;

        let signature = Signature::from_slice(&request.meta.signature)
            .map_err(|e| ValidationError::Signature(format!("malformed signature: {e}")))?;
        let hash = request
            .signable_bytes_hash()
            .map_err(|e| ValidationError::Signature(e.to_string()))?;

        let application = self
            .applications
            .get_application(&header.application_address)
            .await
            .map_err(|e| ValidationError::Ring(e.to_string()))?;

        let ring = std::iter::once(&application.address)
            .chain(application.delegatee_gateway_addresses.iter());
        for member in ring {
            let Some(key) = self.public_key(member).await else {
                continue;
            };
            if key.verify_prehash(&hash, &signature).is_ok() {
                return Ok(());
            }
        }

        Err(ValidationError::Signature(format!(
            "signature does not match application {} or its delegated gateways",
            header.application_address
        )))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ValidatorConfig {
    /// Suppliers this relayer serves. Empty allows any supplier.
    pub allowed_supplier_addresses: Vec<String>,
    /// Extra leniency past the on-chain grace period.
    pub grace_period_extra_blocks: u64,
}

/// [`RelayValidator`] backed by the session and shared-parameter caches.
pub struct SessionRelayValidator {
    allowed_suppliers: HashSet<String>,
    grace_period_extra_blocks: u64,
    ring: Arc<dyn RingVerifier>,
    sessions: Arc<dyn SessionLookup>,
    shared_params: Arc<dyn SharedParamsLookup>,
}

impl SessionRelayValidator {
    pub fn new(
        config: ValidatorConfig,
        ring: Arc<dyn RingVerifier>,
        sessions: Arc<dyn SessionLookup>,
        shared_params: Arc<dyn SharedParamsLookup>,
    ) -> Self {
        Self {
            allowed_suppliers: config.allowed_supplier_addresses.into_iter().collect(),
            grace_period_extra_blocks: config.grace_period_extra_blocks,
            ring,
            sessions,
            shared_params,
        }
    }

    /// Height at which to look the session up.
    ///
    /// An ongoing session is looked up at the current height; an ended one at its end height,
    /// as long as the grace period (plus the configured extra blocks) has not elapsed.
    async fn target_session_height(
        &self,
        header: &SessionHeader,
        current_height: u64,
    ) -> Result<u64, ValidationError> {
        let session_end = header.end_height();
        if current_height == 0 {
            return Ok(session_end);
        }
        if session_end >= current_height {
            return Ok(current_height);
        }

        let params = self
            .shared_params
            .get_shared_params(current_height)
            .await
            .map_err(|e| ValidationError::SharedParams(e.to_string()))?;

        let effective_height =
            current_height.saturating_sub(self.grace_period_extra_blocks).max(session_end);
        if effective_height <= params.grace_period_end_height(session_end) {
            return Ok(session_end);
        }

        Err(ValidationError::SessionExpired { session_end, current: current_height })
    }
}

#[async_trait]
impl RelayValidator for SessionRelayValidator {
    async fn validate_relay_request(
        &self,
        request: &RelayRequest,
        current_height: u64,
    ) -> Result<(), ValidationError> {
        request.validate_basic().map_err(ValidationError::Basic)?;
        let header = request
            .session_header()
            .ok_or_else(|| ValidationError::Basic("missing session header".to_string()))?;

        let supplier = request.meta.supplier_operator_address.as_str();
        if !self.allowed_suppliers.is_empty() && !self.allowed_suppliers.contains(supplier) {
            return Err(ValidationError::SupplierNotAllowed(supplier.to_string()));
        }

        let target_height = self.target_session_height(header, current_height).await?;

        self.ring.verify_relay_request_signature(request).await?;

        let session = self
            .sessions
            .get_session(&header.application_address, &header.service_id, target_height)
            .await
            .map_err(|e| ValidationError::SessionLookup(e.to_string()))?;

        if session.session_id != header.session_id {
            return Err(ValidationError::SessionMismatch {
                expected: session.session_id,
                got: header.session_id.clone(),
            });
        }
        if !session.has_supplier(supplier) {
            return Err(ValidationError::SupplierNotInSession(supplier.to_string()));
        }

        debug!(
            session_id = %header.session_id,
            supplier,
            height = target_height,
            "relay request validated"
        );
        Ok(())
    }

    async fn check_reward_eligibility(
        &self,
        request: &RelayRequest,
        current_height: u64,
    ) -> Result<(), ValidationError> {
        if current_height == 0 {
            return Ok(());
        }
        let Some(header) = request.session_header() else {
            return Err(ValidationError::Basic("missing session header".to_string()));
        };

        let params = self
            .shared_params
            .get_shared_params(current_height)
            .await
            .map_err(|e| ValidationError::SharedParams(e.to_string()))?;

        let claim_window_open = params.claim_window_open_height(header.end_height());
        if current_height >= claim_window_open {
            return Err(ValidationError::ClaimWindowOpen { claim_window_open, current: current_height });
        }
        Ok(())
    }
}
