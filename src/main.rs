//! tcpd - concurrent TCP connection server
//!
//! Runs the built-in echo handler behind optional TLS, with graceful
//! shutdown on Ctrl-C.

use std::sync::Arc;
use tcpd_server::metrics::{self, Metrics};
use tcpd_server::{tls, Config, Echo, Server, ServerConfig};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if TCPD_CONFIG is set, then env overrides)
    let config = match Config::load() {
        Ok(c) => {
            if let Ok(path) = std::env::var(tcpd_server::config::CONFIG_ENV) {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };

    if let Err(e) = config.validate() {
        tracing::error!("{}", e);
        return Err(e.into());
    }

    tracing::info!("Starting tcpd");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!(
        "  Shutdown grace period: {:?}",
        config.shutdown.grace_period()
    );

    // Per-connection diagnostics go to the same subscriber as everything else.
    let mut server_config = ServerConfig::new(config.network.bind_addr)
        .with_error_log(tracing::dispatcher::get_default(tracing::Dispatch::clone));

    if config.tls.enabled {
        let acceptor = tls::create_tls_acceptor(&config.tls)?;
        tracing::info!("  TLS: enabled");
        if config.tls.require_client_cert {
            tracing::info!("  mTLS: enabled (client certificate required)");
        }
        server_config = server_config.with_tls(acceptor);
    } else {
        tracing::info!("  TLS: disabled");
    }

    let metrics_shutdown = CancellationToken::new();
    let metrics_handle = if config.metrics.enabled {
        let metrics = Arc::new(Metrics::new()?);
        server_config = server_config.with_metrics(metrics.clone());
        let addr = config.metrics.bind_addr;
        let shutdown = metrics_shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = metrics::run_metrics_server(addr, metrics, shutdown).await {
                tracing::error!("Metrics server failed: {}", e);
            }
        }))
    } else {
        None
    };

    let server = Arc::new(Server::new(server_config, Echo::new()));

    // Ctrl-C starts a graceful shutdown; listen_and_serve returns as soon as it begins.
    let grace_period = config.shutdown.grace_period();
    let shutdown_handle = {
        let server = server.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
                return Ok(());
            }
            tracing::info!("Received shutdown signal, draining connections...");
            server.shutdown(grace_period).await
        })
    };

    let served = server.listen_and_serve().await;
    if let Err(ref e) = served {
        tracing::error!("Server failed: {}", e);
        // Tear down whatever is still connected; no one will wait for it.
        server.close();
        shutdown_handle.abort();
    } else {
        match shutdown_handle.await {
            Ok(Ok(())) => tracing::info!("All connections closed"),
            Ok(Err(e)) => tracing::warn!("{}", e),
            Err(e) => tracing::error!("Shutdown task failed: {}", e),
        }
    }

    metrics_shutdown.cancel();
    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }

    tracing::info!("Server stopped");
    served.map_err(Into::into)
}
