//! # ControlHub Gateway Server
//!
//! Runs the gateway end to end: one resilient session to the device proxy,
//! a polling loop that keeps the shared state fresh and pushes it to every
//! state subscriber, and a signaling relay for the broadcaster/viewer
//! handshake.
//!
//! ## Endpoints:
//! - `GET /health`, `GET /state`, `POST /control/{deviceId}`
//! - `GET /ws/state`: state subscription socket (auto-joins `default`)
//! - `GET /ws/signaling`: signaling socket

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use hub_common::connections::{SimulatedConnector, SimulatedDevice, StubDeviceSource};
use hub_common::{
    ConnectionResilienceManager, DeviceStateSource, Dispatcher, StateAggregator, StatePollingLoop,
};

mod controlhub_logic;
use controlhub_logic::config::{self, Config, DeviceMode};
use controlhub_logic::{downstream, logger, state::AppState};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Phase 1: Environment ---
    dotenvy::dotenv().ok();

    // --- Phase 2: Configuration ---
    let config = config::load_config(Config::parse())?;
    let settings = config.to_settings()?;

    // --- Phase 3: Logging ---
    // The guard flushes the file writer when main returns.
    let _log_guard = logger::setup_logging(&config.log_dir(), &config.log_level())?;
    tracing::info!(
        endpoint = %settings.device.endpoint_url,
        security_mode = %settings.device.security_mode,
        security_policy = %settings.device.security_policy,
        poll_interval_ms = settings.polling.interval_ms,
        "Configuration loaded"
    );

    // --- Phase 4: Core Engine ---
    let shutdown = CancellationToken::new();
    let dispatcher = Arc::new(Dispatcher::new());
    let aggregator = Arc::new(StateAggregator::new());

    let mut manager: Option<Arc<ConnectionResilienceManager>> = None;
    let source: Arc<dyn DeviceStateSource> = match config.device_mode()? {
        DeviceMode::Simulated => {
            let device = SimulatedDevice::seeded(&settings.device);
            let connector = Arc::new(SimulatedConnector::new(device));
            let m = Arc::new(ConnectionResilienceManager::new(
                settings.device.clone(),
                connector,
                &shutdown,
            ));
            manager = Some(Arc::clone(&m));
            m as Arc<dyn DeviceStateSource>
        }
        DeviceMode::Stub => {
            Arc::new(StubDeviceSource::new(settings.device.device_name())) as Arc<dyn DeviceStateSource>
        }
    };

    // --- Phase 5: Polling Loop ---
    let poll = StatePollingLoop::new(
        Arc::clone(&source),
        Arc::clone(&aggregator),
        dispatcher.clone(),
        settings.polling.clone(),
    );
    let poll_token = shutdown.clone();
    let poll_handle = tokio::spawn(async move { poll.run(poll_token).await });

    // --- Phase 6: Signal Handling ---
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::warn!("Shutdown signal received. Closing gracefully...");
        signal_token.cancel();
    });

    // --- Phase 7: Serve ---
    let app_state = AppState::new(dispatcher, aggregator, source, shutdown.clone());
    let served = downstream::run(config.port(), app_state).await;
    if let Err(e) = &served {
        tracing::error!(error = %e, "Downstream server failed");
    }

    // --- Phase 8: Teardown ---
    shutdown.cancel();
    match poll_handle.await {
        Ok(stats) => tracing::info!(ticks_ok = stats.ticks_ok, ticks_failed = stats.ticks_failed, "Polling loop joined"),
        Err(e) => tracing::warn!(error = %e, "Polling loop task failed"),
    }
    if let Some(manager) = manager {
        manager.close().await;
    }

    tracing::info!("Shutdown complete.");
    served
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
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
