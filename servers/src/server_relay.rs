//! # Relay Server
//!
//! Holds a periodically refreshed snapshot of topic-tagged records and
//! streams each websocket subscriber the slice matching its topic.
//!
//! ## Execution Flow:
//! 1.  Load `.env`, install the `ring` crypto provider for rustls.
//! 2.  Layer configuration: defaults < `server_relay.conf` < env / CLI.
//! 3.  Initialize tracing (console + timestamped file in the log dir).
//! 4.  Build the relay and its data source, spawn the refresh scheduler.
//! 5.  Serve `/ws`, `/topics`, `/ingest` and friends until Ctrl-C / SIGTERM.
//! 6.  Cancel the shared token, drain sessions, join the scheduler.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

use std::sync::Arc;

use anyhow::Result;
use lib_relay::loggers::init_tracing;
use servers::relay_logic::{config, downstream, state::AppState};
use tokio::signal;
use tokio_util::sync::CancellationToken;

const APP_NAME: &str = "server_relay";

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Rustls 0.23+ requires an explicit process-wide crypto provider.
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let (config, warnings) = config::load_config();
    let _log_guard = init_tracing(APP_NAME, &config.log_dir(), config.log_level(), config.log_json())?;
    for warning in &warnings {
        tracing::warn!("{warning}");
    }
    tracing::info!(
        port = config.port(),
        source = ?config.source(),
        tls = config.tls_paths().is_some(),
        "starting {APP_NAME}"
    );

    let shutdown = CancellationToken::new();
    let app_state = AppState::from_config(&config, shutdown.clone())?;

    let scheduler = Arc::clone(&app_state.scheduler);
    let scheduler_token = shutdown.clone();
    let scheduler_handle = tokio::spawn(async move { scheduler.run(scheduler_token).await });

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::warn!("Shutdown signal received. Closing server gracefully...");
        signal_token.cancel();
    });

    let served = downstream::run(&config, app_state).await;
    if let Err(e) = &served {
        tracing::error!(error = %e, "downstream server failed");
    }

    shutdown.cancel();
    if let Err(e) = scheduler_handle.await {
        tracing::error!(error = %e, "refresh scheduler task failed");
    }
    tracing::info!("{APP_NAME} stopped");
    served
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
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
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
