//! HTTP surface of the relayer binary: operational routes and shared middleware.

pub mod middleware;
pub mod router;
