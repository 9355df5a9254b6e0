//! Relayer runtime initialization and lifecycle management.
//!
//! The runtime owns every long-lived component and the background tasks they run. Start order
//! is caches, block subscriber (and the elected watcher), backend health checks, relay meter,
//! validation and publish workers, then the proxy; shutdown closes them in reverse.
//!
//! ```no_run
//! use relayer_core::{config::RelayerConfig, runtime::RelayerRuntime};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = RelayerRuntime::builder().with_config(RelayerConfig::load()?).build().await?;
//!
//!     let app = relayer_core::proxy::router(runtime.proxy().clone());
//!     // ... serve `app` ...
//!
//!     runtime.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod builder;
pub mod components;
pub mod lifecycle;

pub use builder::{ChainClients, RelayerRuntimeBuilder, RuntimeError, Substrate, MEMORY_STORE_URL};
pub use components::RelayerComponents;
pub use lifecycle::RelayerRuntime;
