//! HTTP middleware for the relayer listeners.

pub mod correlation_id;

pub use correlation_id::{
    create_request_id_layers, relay_protocol, relay_trace_layer, CorrelationId,
    UuidRequestIdGenerator, X_REQUEST_ID,
};
