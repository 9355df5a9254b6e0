use anyhow::Result;
use axum::{serve, Router};
use relayer_core::{
    config::{LoggingConfig, RelayerConfig},
    proxy::RelayProxy,
    runtime::RelayerRuntime,
};
use rustls::crypto::{ring::default_provider, CryptoProvider};
use server::{
    middleware,
    router::{self, OpsState},
};
use std::{net::SocketAddr, sync::Arc};
use tokio::{signal, sync::broadcast, task::JoinHandle};
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initializes logging from the `logging` config section. `RUST_LOG` wins when set.
fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_env("RUST_LOG").unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,relayer_core={level},server={level},ha_relayer={level}",
            level = config.level
        ))
    });

    let registry = tracing_subscriber::registry().with(filter);

    if config.format.as_str() == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .pretty()
            .with_file(true)
            .with_line_number(true)
            .with_target(false);
        registry.with(fmt_layer).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    CryptoProvider::install_default(default_provider())
        .map_err(|e| anyhow::anyhow!("Failed to install crypto provider: {e:?}"))?;

    let config =
        RelayerConfig::load().map_err(|e| anyhow::anyhow!("Configuration validation failed: {e}"))?;

    init_logging(&config.logging);
    info!("Starting HA relayer");
    debug!(
        services = config.services.len(),
        listen_addr = %config.listen_addr,
        validation_mode = %config.default_validation_mode,
        meter_enabled = config.relay_meter.enabled,
        "Configuration loaded"
    );

    let listen_addr: SocketAddr = config
        .listen_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen address {}: {e}", config.listen_addr))?;

    let runtime = RelayerRuntime::builder()
        .with_config(config.clone())
        .build()
        .await
        .map_err(|e| anyhow::anyhow!("Relayer initialization failed: {e}"))?;

    let components = runtime.components();
    let ops_state = OpsState {
        metrics: components.metrics_collector().clone(),
        health: components.health_checker().clone(),
        block_height: components.block_height().clone(),
    };

    let mut ops_servers = Vec::new();
    if config.metrics.enabled {
        ops_servers.push(
            spawn_ops_server(
                "metrics",
                &config.metrics.addr,
                router::metrics_router(ops_state.clone()),
                runtime.shutdown_receiver(),
            )
            .await?,
        );
    }
    if config.health_check.enabled {
        ops_servers.push(
            spawn_ops_server(
                "health",
                &config.health_check.addr,
                router::health_router(ops_state),
                runtime.shutdown_receiver(),
            )
            .await?,
        );
    }

    let app = create_app(runtime.proxy().clone());
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    info!(address = %listen_addr, "Relay server listening");

    if let Err(e) = serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %e, "Relay server error occurred");
    }

    runtime.shutdown().await;
    for handle in ops_servers {
        if let Err(e) = handle.await {
            error!(error = %e, "ops server task failed");
        }
    }
    info!("Server shutdown complete");

    Ok(())
}

/// Relay ingress with request correlation applied to every protocol.
fn create_app(proxy: Arc<RelayProxy>) -> Router {
    let (set_request_id, propagate_request_id) = middleware::create_request_id_layers();

    relayer_core::proxy::router(proxy)
        .layer(middleware::relay_trace_layer())
        .layer(propagate_request_id)
        .layer(set_request_id)
}

async fn spawn_ops_server(
    name: &'static str,
    addr: &str,
    app: Router,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<JoinHandle<()>> {
    let addr: SocketAddr =
        addr.parse().map_err(|e| anyhow::anyhow!("Invalid {name} bind address {addr}: {e}"))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(address = %addr, "{name} server listening");

    Ok(tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.recv().await;
        };
        if let Err(e) = serve(listener, app).with_graceful_shutdown(shutdown).await {
            error!(error = %e, server = name, "ops server error occurred");
        }
    }))
}

/// Graceful shutdown timeout in seconds.
/// After this timeout, the server will be forcefully terminated.
const GRACEFUL_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");

                () = std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!(
        "Shutdown signal received, starting graceful shutdown (timeout: {}s)",
        GRACEFUL_SHUTDOWN_TIMEOUT_SECS
    );
}
