//! Sendgate server - HTTP front of the sequential send gateway.
//!
//! This binary:
//! - Loads API keys and admission quotas
//! - Admits each request against the general and bulk tiers
//! - Queues admitted sends for the single transport session
//! - Answers once the queued send has settled

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::{net::TcpListener, signal};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sendgate::{router, ApiKeyRegistry, AppState, Config, Gateway, HttpTransport};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("gateway_starting");

    let config = Config::from_env();
    info!(
        port = config.port,
        env_key_configured = config.api_key.is_some(),
        api_keys_file = %config.api_keys_file.display(),
        rate_limit_max = config.rate_limit.max_requests,
        rate_limit_window_ms = config.rate_limit.window_ms,
        bulk_rate_limit_max = config.bulk_rate_limit.max_requests,
        bulk_rate_limit_window_ms = config.bulk_rate_limit.window_ms,
        bulk_threshold = config.bulk_recipient_threshold,
        max_attempts = config.task_max_attempts,
        timeout_ms = config.task_timeout_ms,
        pacing_ms = config.queue_pacing_ms,
        transport_url = %config.transport_url,
        "config_loaded"
    );

    let mut keys = ApiKeyRegistry::load(&config.api_keys_file);
    if let Some(key) = &config.api_key {
        keys = keys.with_env_key(key, config.rate_limit);
    }
    if keys.is_empty() {
        warn!("no_api_keys_configured");
    }
    let keys = Arc::new(keys);

    let gateway = Gateway::from_config(&config, keys.clone());
    let sweep_every = Duration::from_millis(config.rate_window_sweep_ms.max(1));
    let sweeper = gateway.spawn_window_sweeper(sweep_every, sweep_every);

    let transport = HttpTransport::new(config.transport_url.clone())?;
    info!(url = %transport.url(), "transport_client_created");

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let state = AppState::new(config, gateway.clone(), keys, Arc::new(transport));
    let app = router(state);

    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(address = %addr, "gateway_listening");

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    sweeper.abort();
    let discarded = gateway.queue().clear();
    info!(discarded = discarded, "gateway_shutdown_complete");

    Ok(())
}

/// Create a future that completes when a shutdown signal is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "ctrl_c_handler_failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "sigterm_handler_failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }

    info!("gateway_shutting_down");
}
