//! Relay validation, metering, signing and mining.
//!
//! - [`validator`]: synchronous request validation against chain state
//! - [`session_validator`]: post-response validation worker pool for optimistic services
//! - [`meter`]: per-session stake budgets and over-servicing policy
//! - [`signer`]: supplier response signing
//! - [`difficulty`]: mining difficulty and compute-unit pricing
//! - [`processor`]: turns a served exchange into a [`MinedRelayMessage`](crate::transport::MinedRelayMessage)

pub mod difficulty;
pub mod errors;
pub mod meter;
pub mod processor;
pub mod session_validator;
pub mod signer;
pub mod validator;

pub use difficulty::{
    BaseDifficultyProvider, CachedComputeUnitsProvider, CachedDifficultyProvider,
    ComputeUnitsProvider, DifficultyProvider,
};
pub use errors::{RelayError, ValidationError};
pub use meter::{MeterDecision, RelayMeter, RelayMeterSettings, SessionMeterState};
pub use processor::RelayProcessor;
pub use session_validator::{
    SessionValidationMode, SessionValidationRequest, SessionValidator, SessionValidatorConfig,
    SessionVerdict,
};
pub use signer::ResponseSigner;
pub use validator::{
    EcdsaRingVerifier, RelayValidator, RingVerifier, SessionRelayValidator, ValidatorConfig,
};
