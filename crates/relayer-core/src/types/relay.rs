//! Relay wire envelope.
//!
//! A relay request carries `{meta: {session_header, signature, supplier_operator_address}, payload}`
//! and the response carries `{meta: {session_header, supplier_operator_signature}, payload,
//! payload_hash, relay_miner_error}`. The payload embeds an HTTP request or response so that
//! any backend protocol can be proxied.
//!
//! Envelopes use a fixed-width binary encoding with a size limit and trailing-byte rejection, so
//! arbitrary client bodies (JSON, form data) never decode as a relay.

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Upper bound on any decoded envelope.
pub const MAX_WIRE_MESSAGE_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("failed to encode message: {0}")]
    Encode(String),
    #[error("failed to decode message: {0}")]
    Decode(String),
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
        .with_limit(MAX_WIRE_MESSAGE_BYTES)
}

/// Binary encoding shared by all envelope types.
pub trait WireMessage: Serialize + DeserializeOwned + Sized {
    /// # Errors
    ///
    /// Returns [`WireError::Encode`] if the message exceeds the size limit.
    fn encode(&self) -> Result<Vec<u8>, WireError> {
        codec().serialize(self).map_err(|e| WireError::Encode(e.to_string()))
    }

    /// # Errors
    ///
    /// Returns [`WireError::Decode`] if `bytes` is not exactly one encoded message.
    fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        codec().deserialize(bytes).map_err(|e| WireError::Decode(e.to_string()))
    }
}

/// 32-byte SHA-256 digest of an encoded [`Relay`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct RelayHash(pub [u8; 32]);

impl RelayHash {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for RelayHash {
    fn from(arr: [u8; 32]) -> Self {
        Self(arr)
    }
}

impl std::fmt::Display for RelayHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

pub(crate) fn sha256(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

/// Identifies an application/service session and its height range.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHeader {
    pub application_address: String,
    pub service_id: String,
    pub session_id: String,
    pub session_start_block_height: i64,
    pub session_end_block_height: i64,
}

impl SessionHeader {
    /// # Errors
    ///
    /// Returns a description of the first missing or inconsistent field.
    pub fn validate_basic(&self) -> Result<(), String> {
        if self.application_address.is_empty() {
            return Err("invalid session header: missing application address".to_string());
        }
        if self.service_id.is_empty() {
            return Err("invalid session header: missing service ID".to_string());
        }
        if self.session_id.is_empty() {
            return Err("invalid session header: missing session ID".to_string());
        }
        if self.session_start_block_height < 0 {
            return Err(format!(
                "invalid session header: negative session start height {}",
                self.session_start_block_height
            ));
        }
        if self.session_end_block_height < self.session_start_block_height {
            return Err(format!(
                "invalid session header: session end height {} is before start height {}",
                self.session_end_block_height, self.session_start_block_height
            ));
        }
        Ok(())
    }

    /// Session end height clamped to an unsigned value.
    #[must_use]
    pub fn end_height(&self) -> u64 {
        u64::try_from(self.session_end_block_height).unwrap_or(0)
    }

    #[must_use]
    pub fn start_height(&self) -> u64 {
        u64::try_from(self.session_start_block_height).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayRequestMetadata {
    pub session_header: Option<SessionHeader>,
    /// Ring signature over the request's signable bytes.
    pub signature: Vec<u8>,
    pub supplier_operator_address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayRequest {
    pub meta: RelayRequestMetadata,
    /// Encoded [`HttpRequestPayload`].
    pub payload: Vec<u8>,
}

impl WireMessage for RelayRequest {}

impl RelayRequest {
    #[must_use]
    pub fn session_header(&self) -> Option<&SessionHeader> {
        self.meta.session_header.as_ref()
    }

    /// Service ID from the session header, empty when absent.
    #[must_use]
    pub fn service_id(&self) -> &str {
        self.session_header().map_or("", |h| h.service_id.as_str())
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        self.session_header().map_or("", |h| h.session_id.as_str())
    }

    /// # Errors
    ///
    /// Returns a description when the header is missing or invalid, or the request is unsigned.
    pub fn validate_basic(&self) -> Result<(), String> {
        let header = self
            .session_header()
            .ok_or_else(|| "invalid relay request: missing session header".to_string())?;
        header.validate_basic()?;
        if self.meta.signature.is_empty() {
            return Err("invalid relay request: missing signature".to_string());
        }
        Ok(())
    }

    /// SHA-256 of the request encoded without its signature.
    ///
    /// # Errors
    ///
    /// Returns [`WireError`] if the request cannot be encoded.
    pub fn signable_bytes_hash(&self) -> Result<[u8; 32], WireError> {
        let mut unsigned = self.clone();
        unsigned.meta.signature = Vec::new();
        Ok(sha256(&unsigned.encode()?))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayResponseMetadata {
    pub session_header: Option<SessionHeader>,
    pub supplier_operator_signature: Vec<u8>,
}

/// Error reported by the relay miner instead of (or alongside) a backend payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMinerError {
    pub codespace: String,
    pub code: u32,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayResponse {
    pub meta: RelayResponseMetadata,
    /// Encoded [`HttpResponsePayload`]; emptied once the response is signed for billing.
    pub payload: Vec<u8>,
    /// SHA-256 of the payload, kept after the payload is dropped.
    pub payload_hash: Vec<u8>,
    pub relay_miner_error: Option<RelayMinerError>,
}

impl WireMessage for RelayResponse {}

impl RelayResponse {
    /// SHA-256 of the response encoded without its supplier signature.
    ///
    /// # Errors
    ///
    /// Returns [`WireError`] if the response cannot be encoded.
    pub fn signable_bytes_hash(&self) -> Result<[u8; 32], WireError> {
        let mut unsigned = self.clone();
        unsigned.meta.supplier_operator_signature = Vec::new();
        Ok(sha256(&unsigned.encode()?))
    }

    /// Recomputes `payload_hash` from the current payload.
    pub fn update_payload_hash(&mut self) {
        self.payload_hash = sha256(&self.payload).to_vec();
    }
}

/// A served request/response pair, the unit that is hashed and billed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relay {
    pub req: RelayRequest,
    pub res: RelayResponse,
}

impl WireMessage for Relay {}

/// HTTP request semantics carried in [`RelayRequest::payload`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequestPayload {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, Vec<String>>,
    pub body: Vec<u8>,
}

impl WireMessage for HttpRequestPayload {}

impl HttpRequestPayload {
    /// First value of a header, matched case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.first())
            .map(String::as_str)
    }
}

/// HTTP response semantics carried in [`RelayResponse::payload`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponsePayload {
    pub status_code: u32,
    pub headers: BTreeMap<String, Vec<String>>,
    pub body: Vec<u8>,
}

impl WireMessage for HttpResponsePayload {}
