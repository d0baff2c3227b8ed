//! Pivot Reconciler - cross-chain pool operation tracking service
//!
//! Serves an HTTP API through which callers open reconciliation sessions for
//! pool deposits, withdrawals and pivots, and read per-hop progress while the
//! service polls bridge indexers in the background.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use pivot_reconciler::api;
use pivot_reconciler::chain::ChainRegistry;
use pivot_reconciler::config::{ChainDirectory, Settings};
use pivot_reconciler::coordination::{Reconciler, ReconcilerContext};
use pivot_reconciler::events::EventCatalog;
use pivot_reconciler::indexer::{ExplorerLogIndexer, HttpMessageIndexer};
use pivot_reconciler::metrics::{self, MetricsServer};

/// Interval between RPC health probes
const HEALTH_CHECK_INTERVAL_SECS: u64 = 60;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Pivot Reconciler v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} chains",
        settings.enabled_chains().len()
    );

    let directory = Arc::new(ChainDirectory::from_settings(&settings)?);
    let catalog = Arc::new(EventCatalog::from_config(&settings.events));

    // Read-only clients
    let chains = Arc::new(ChainRegistry::new(&settings)?);
    let logs = Arc::new(ExplorerLogIndexer::from_settings(&settings)?);
    let messages = Arc::new(HttpMessageIndexer::from_settings(&settings)?);
    info!("Chain and indexer clients initialized");

    let context = Arc::new(ReconcilerContext::new(
        directory,
        catalog,
        chains.clone(),
        logs,
        messages,
        settings.polling.clone(),
    ));
    let reconciler = Arc::new(Reconciler::new(context));

    // Initialize metrics server
    let metrics_server = if settings.metrics.enabled {
        Some(MetricsServer::new(settings.metrics.port))
    } else {
        None
    };

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let reconciler = reconciler.clone();
        let chains = chains.clone();
        async move {
            if let Err(e) = api::run_server(config, reconciler, chains).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = metrics_server.map(|server| {
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        })
    });

    // Session housekeeping
    let reconciler_handle = tokio::spawn({
        let reconciler = reconciler.clone();
        async move {
            if let Err(e) = reconciler.run().await {
                error!("Reconciler error: {}", e);
            }
        }
    });

    // Health check loop
    let health_handle = tokio::spawn({
        let chains = chains.clone();
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(HEALTH_CHECK_INTERVAL_SECS))
                    .await;

                for (chain_id, healthy) in chains.health_check().await {
                    if !healthy {
                        warn!("Chain {} health check failed", chain_id);
                    }
                }
            }
        }
    });

    info!("Pivot Reconciler is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown: cancels every session's timers
    reconciler.shutdown().await;
    metrics::set_active_sessions(0);

    // Abort background tasks
    api_handle.abort();
    reconciler_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Pivot Reconciler stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,pivot_reconciler=debug,hyper=warn,reqwest=warn")
    });

    let json = std::env::var("LOG_FORMAT").map_or(false, |f| f.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
