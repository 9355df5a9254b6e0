use crate::types::WireError;
use thiserror::Error;

/// Failures while signing or packaging a served relay.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("no signer for operator {operator} (available: [{available}])")]
    NoSigner { operator: String, available: String },

    #[error("invalid signing key for {operator}: {reason}")]
    InvalidKey { operator: String, reason: String },

    #[error("relay request has no session header")]
    MissingSessionHeader,

    #[error("relay request has no supplier operator address")]
    MissingSupplier,

    #[error("failed to sign relay response: {0}")]
    Signing(String),

    #[error("relay meter is closed")]
    MeterClosed,

    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Reasons a relay request is rejected by validation.
///
/// `SessionLookup` and `SharedParams` are infrastructure failures rather than verdicts on the
/// request; background validation does not punish a session for them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("basic validation failed: {0}")]
    Basic(String),

    #[error("supplier {0} is not allowed by this relayer")]
    SupplierNotAllowed(String),

    #[error("unknown supplier: {0}")]
    UnknownSupplier(String),

    #[error("session is no longer rewardable")]
    NotRewardable,

    #[error("session expired, session end height: {session_end}, current height: {current} (grace period elapsed)")]
    SessionExpired { session_end: u64, current: u64 },

    #[error("ring signature verification failed: {0}")]
    Signature(String),

    #[error("failed to build signing ring: {0}")]
    Ring(String),

    #[error("failed to get session: {0}")]
    SessionLookup(String),

    #[error("failed to get shared params: {0}")]
    SharedParams(String),

    #[error("session ID mismatch, expected: {expected}, got: {got}")]
    SessionMismatch { expected: String, got: String },

    #[error("supplier {0} not found in session")]
    SupplierNotInSession(String),

    #[error("session expired, must be before claim window open height ({claim_window_open}), current height is ({current})")]
    ClaimWindowOpen { claim_window_open: u64, current: u64 },

    #[error("validation timed out")]
    Timeout,
}

impl ValidationError {
    /// Whether the failure says nothing about the request itself.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::SessionLookup(_) | Self::SharedParams(_) | Self::Ring(_) | Self::Timeout
        )
    }

    #[must_use]
    pub fn as_label(&self) -> &'static str {
        match self {
            Self::Basic(_) => "basic",
            Self::SupplierNotAllowed(_) => "supplier_not_allowed",
            Self::UnknownSupplier(_) => "unknown_supplier",
            Self::NotRewardable => "not_rewardable",
            Self::SessionExpired { .. } => "session_expired",
            Self::Signature(_) => "bad_signature",
            Self::Ring(_) => "ring_lookup",
            Self::SessionLookup(_) => "session_query",
            Self::SharedParams(_) => "shared_params",
            Self::SessionMismatch { .. } => "session_mismatch",
            Self::SupplierNotInSession(_) => "supplier_not_in_session",
            Self::ClaimWindowOpen { .. } => "claim_window_open",
            Self::Timeout => "timeout",
        }
    }
}
