//! # State Polling Ingestor
//!
//! The single long-lived task that keeps the aggregated state fresh. Each tick
//! pulls the device attributes, merges them into the [`StateAggregator`] and
//! pushes the resulting projection to every subscriber of the default group.
//!
//! ## Key Design Principles:
//! - **Self-Scheduling**: the loop sleeps the poll interval after a good tick
//!   and a capped backoff after a failed one.
//! - **Never Dies on Errors**: a failed tick is logged and the loop carries on.
//!   Reconnecting is the connection manager's business, not the loop's.
//! - **Silent Shutdown**: cancellation ends the loop while sleeping or while a
//!   read is in flight, without logging an error.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::configs::config_hub::PollingSettings;
use crate::connections::{DeviceError, DeviceStateSource};
use crate::core::{PushChannel, Snapshot, StateAggregator};

/// Group every state subscriber joins by default.
pub const DEFAULT_GROUP: &str = "default";
/// Event name carried by every state push.
pub const STATE_EVENT: &str = "SystemStateUpdated";

/// # Poll Error
///
/// Why a single tick failed.
#[derive(Debug, Error)]
pub enum PollError {
    /// The device source failed.
    #[error(transparent)]
    Device(#[from] DeviceError),
    /// The new snapshot could not be projected to JSON.
    #[error("Failed to project snapshot: {0}")]
    Projection(#[from] serde_json::Error),
}

impl PollError {
    fn is_cancelled(&self) -> bool {
        matches!(self, PollError::Device(DeviceError::Cancelled))
    }
}

/// # Poll Stats
///
/// Summary returned when the loop exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStats {
    /// Ticks that merged and published a snapshot.
    pub ticks_ok: u64,
    /// Ticks that failed and were followed by a backoff.
    pub ticks_failed: u64,
}

/// # State Polling Loop
///
/// Wires a device source, the aggregator and a push channel together.
pub struct StatePollingLoop {
    source: Arc<dyn DeviceStateSource>,
    aggregator: Arc<StateAggregator>,
    push: Arc<dyn PushChannel>,
    settings: PollingSettings,
}

impl StatePollingLoop {
    /// Creates the loop. Nothing runs until [`StatePollingLoop::run`] is awaited.
    pub fn new(
        source: Arc<dyn DeviceStateSource>,
        aggregator: Arc<StateAggregator>,
        push: Arc<dyn PushChannel>,
        settings: PollingSettings,
    ) -> Self {
        Self {
            source,
            aggregator,
            push,
            settings,
        }
    }

    /// # Tick
    ///
    /// One read, merge and publish cycle. Returns the snapshot that was published.
    pub async fn tick(&self, shutdown: &CancellationToken) -> Result<Arc<Snapshot>, PollError> {
        // --- Phase 1: Pull ---
        let incoming = self.source.read_state(shutdown).await?;

        // --- Phase 2: Merge ---
        let snapshot = self.aggregator.merge(&incoming);

        // --- Phase 3: Fan out ---
        let payload = snapshot.projection()?;
        let delivered = self.push.send_to_group(DEFAULT_GROUP, STATE_EVENT, payload);
        tracing::trace!(
            sequence = snapshot.sequence(),
            delivered,
            "State snapshot published"
        );

        Ok(snapshot)
    }

    /// # Main Execution Loop
    ///
    /// Runs ticks until `shutdown` fires and returns how many succeeded and failed.
    pub async fn run(&self, shutdown: CancellationToken) -> PollStats {
        let mut stats = PollStats::default();
        tracing::info!(
            interval_ms = self.settings.interval_ms,
            backoff_ms = self.settings.backoff().as_millis() as u64,
            "State polling loop started"
        );

        loop {
            let tick = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                res = self.tick(&shutdown) => res,
            };

            let pause: Duration = match tick {
                Ok(_) => {
                    stats.ticks_ok += 1;
                    self.settings.interval()
                }
                Err(e) if e.is_cancelled() => break,
                Err(e) => {
                    stats.ticks_failed += 1;
                    tracing::error!(error = %e, "State poll failed");
                    self.settings.backoff()
                }
            };

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        tracing::info!(
            ticks_ok = stats.ticks_ok,
            ticks_failed = stats.ticks_failed,
            "State polling loop stopped"
        );
        stats
    }
}
