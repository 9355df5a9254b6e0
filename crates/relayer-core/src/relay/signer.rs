//! Supplier response signing.
//!
//! Every relay response is signed with the secp256k1 key of the supplier operator named in the
//! request. One relayer may sign for several operators, so keys are held by operator address.
//! The signature covers the SHA-256 of the response encoded without its signature field, which
//! includes the payload hash; the payload itself may be dropped afterwards without invalidating
//! the signature.

use super::errors::RelayError;
use crate::types::{
    HttpResponsePayload, RelayMinerError, RelayRequest, RelayResponse, RelayResponseMetadata,
    SessionHeader, WireMessage,
};
use http::HeaderMap;
use k256::ecdsa::{signature::hazmat::PrehashSigner, Signature, SigningKey, VerifyingKey};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Codespace used in relay-miner errors returned to clients.
pub const RELAY_MINER_CODESPACE: &str = "relayer";

/// Converts response headers into the multi-valued map carried in relay payloads.
#[must_use]
pub fn header_map_to_payload(headers: &HeaderMap) -> BTreeMap<String, Vec<String>> {
    let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            out.entry(name.as_str().to_string()).or_default().push(value.to_string());
        }
    }
    out
}

pub struct ResponseSigner {
    keys: HashMap<String, SigningKey>,
}

impl ResponseSigner {
    #[must_use]
    pub fn new(keys: HashMap<String, SigningKey>) -> Self {
        Self { keys }
    }

    /// Builds a signer from hex-encoded private keys keyed by operator address.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidKey`] for the first key that is not a valid secp256k1
    /// scalar.
    pub fn from_hex_keys(keys: &HashMap<String, String>) -> Result<Self, RelayError> {
        let mut parsed = HashMap::with_capacity(keys.len());
        for (operator, hex_key) in keys {
            let invalid = |reason: String| RelayError::InvalidKey { operator: operator.clone(), reason };
            let bytes = hex::decode(hex_key.trim().trim_start_matches("0x"))
                .map_err(|e| invalid(e.to_string()))?;
            let key = SigningKey::from_slice(&bytes).map_err(|e| invalid(e.to_string()))?;
            parsed.insert(operator.clone(), key);
        }
        Ok(Self::new(parsed))
    }

    /// Operator addresses this relayer can sign for, sorted.
    #[must_use]
    pub fn operator_addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.keys.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    #[must_use]
    pub fn has_signer(&self, operator_address: &str) -> bool {
        self.keys.contains_key(operator_address)
    }

    #[must_use]
    pub fn verifying_key(&self, operator_address: &str) -> Option<VerifyingKey> {
        self.keys.get(operator_address).map(|k| *k.verifying_key())
    }

    /// Recomputes the payload hash and attaches the operator's signature.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::NoSigner`] if no key is held for `operator_address`.
    pub fn sign_relay_response(
        &self,
        response: &mut RelayResponse,
        operator_address: &str,
    ) -> Result<(), RelayError> {
        let key = self.keys.get(operator_address).ok_or_else(|| RelayError::NoSigner {
            operator: operator_address.to_string(),
            available: self.operator_addresses().join(", "),
        })?;

        response.update_payload_hash();
        let hash = response.signable_bytes_hash()?;
        let signature: Signature =
            key.sign_prehash(&hash).map_err(|e| RelayError::Signing(e.to_string()))?;
        response.meta.supplier_operator_signature = signature.to_bytes().to_vec();
        Ok(())
    }

    /// Wraps a backend response in a signed relay response.
    ///
    /// Returns the response and its encoding, which is what the client receives.
    ///
    /// # Errors
    ///
    /// Returns an error if the request lacks a session header or supplier, or signing fails.
    pub fn build_and_sign_relay_response_from_body(
        &self,
        request: &RelayRequest,
        body: &[u8],
        headers: &HeaderMap,
        status: u16,
    ) -> Result<(RelayResponse, Vec<u8>), RelayError> {
        let header = request.session_header().ok_or(RelayError::MissingSessionHeader)?;
        let operator = request.meta.supplier_operator_address.as_str();
        if operator.is_empty() {
            return Err(RelayError::MissingSupplier);
        }

        let payload = HttpResponsePayload {
            status_code: u32::from(status),
            headers: header_map_to_payload(headers),
            body: body.to_vec(),
        };

        let mut response = RelayResponse {
            meta: RelayResponseMetadata { session_header: Some(header.clone()), ..Default::default() },
            payload: payload.encode()?,
            ..Default::default()
        };
        self.sign_relay_response(&mut response, operator)?;

        let encoded = response.encode()?;
        debug!(
            supplier = operator,
            service_id = %header.service_id,
            response_size = encoded.len(),
            "signed relay response"
        );
        Ok((response, encoded))
    }

    /// Signed relay response reporting a relayer-side failure to the client.
    ///
    /// # Errors
    ///
    /// Returns an error if no key is held for `operator_address` or encoding fails.
    pub fn build_error_relay_response(
        &self,
        session_header: &SessionHeader,
        operator_address: &str,
        code: u32,
        message: &str,
    ) -> Result<(RelayResponse, Vec<u8>), RelayError> {
        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".to_string(), vec!["application/json".to_string()]);
        let payload = HttpResponsePayload {
            status_code: 500,
            headers,
            body: serde_json::json!({ "error": message }).to_string().into_bytes(),
        };

        let mut response = RelayResponse {
            meta: RelayResponseMetadata {
                session_header: Some(session_header.clone()),
                ..Default::default()
            },
            payload: payload.encode()?,
            relay_miner_error: Some(RelayMinerError {
                codespace: RELAY_MINER_CODESPACE.to_string(),
                code,
                message: message.to_string(),
            }),
            ..Default::default()
        };
        self.sign_relay_response(&mut response, operator_address)?;

        let encoded = response.encode()?;
        Ok((response, encoded))
    }
}
