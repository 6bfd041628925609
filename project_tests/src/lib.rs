//! # Integration Test Fixtures
//!
//! Stand-ins shared by the integration tests in this crate:
//!
//! - **`RecordingPush`**: a `PushChannel` that remembers every frame instead of
//!   writing to sockets.
//! - **`ScriptedSource`**: a `DeviceStateSource` that replays queued results and
//!   records when each read happened (on the tokio clock, so paused time works).

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use hub_common::core::{ExtensionMap, ExtensionValue, PushChannel};
use hub_common::{DeviceError, DeviceStateSource};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Builds an extension bag from literal pairs.
pub fn bag(pairs: &[(&str, ExtensionValue)]) -> ExtensionMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Where a recorded frame was addressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Group(String),
    Connection(String),
}

#[derive(Debug, Clone)]
pub struct PushedFrame {
    pub target: Target,
    pub event: String,
    pub payload: Value,
}

/// Push channel that keeps every frame in memory. Every send counts as delivered.
#[derive(Default)]
pub struct RecordingPush {
    frames: Mutex<Vec<PushedFrame>>,
}

impl RecordingPush {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<PushedFrame> {
        lock(&self.frames).clone()
    }

    pub fn to_group(&self, group: &str) -> Vec<PushedFrame> {
        self.filtered(&Target::Group(group.to_string()))
    }

    pub fn to_connection(&self, id: &str) -> Vec<PushedFrame> {
        self.filtered(&Target::Connection(id.to_string()))
    }

    fn filtered(&self, target: &Target) -> Vec<PushedFrame> {
        lock(&self.frames)
            .iter()
            .filter(|f| &f.target == target)
            .cloned()
            .collect()
    }

    fn record(&self, target: Target, event: &str, payload: Value) {
        lock(&self.frames).push(PushedFrame {
            target,
            event: event.to_string(),
            payload,
        });
    }
}

impl PushChannel for RecordingPush {
    fn send_to_group(&self, group: &str, event: &str, payload: Value) -> usize {
        self.record(Target::Group(group.to_string()), event, payload);
        1
    }

    fn send_to_connection(&self, connection_id: &str, event: &str, payload: Value) -> bool {
        self.record(Target::Connection(connection_id.to_string()), event, payload);
        true
    }
}

/// # Scripted Source
///
/// Replays queued read results in order, then keeps answering with the fallback bag.
pub struct ScriptedSource {
    script: Mutex<VecDeque<Result<ExtensionMap, DeviceError>>>,
    fallback: ExtensionMap,
    started: Instant,
    reads: Mutex<Vec<Duration>>,
    writes: Mutex<Vec<(String, String)>>,
}

impl ScriptedSource {
    /// Must be created inside a runtime so the start instant follows the test clock.
    pub fn new(fallback: ExtensionMap) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            started: Instant::now(),
            reads: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
        }
    }

    pub fn push_ok(&self, values: ExtensionMap) {
        lock(&self.script).push_back(Ok(values));
    }

    pub fn push_err(&self, error: DeviceError) {
        lock(&self.script).push_back(Err(error));
    }

    /// Offsets from creation at which each read started.
    pub fn read_offsets(&self) -> Vec<Duration> {
        lock(&self.reads).clone()
    }

    pub fn writes(&self) -> Vec<(String, String)> {
        lock(&self.writes).clone()
    }
}

#[async_trait]
impl DeviceStateSource for ScriptedSource {
    async fn read_state(&self, shutdown: &CancellationToken) -> Result<ExtensionMap, DeviceError> {
        if shutdown.is_cancelled() {
            return Err(DeviceError::Cancelled);
        }
        lock(&self.reads).push(self.started.elapsed());

        let next = lock(&self.script).pop_front();
        next.unwrap_or_else(|| Ok(self.fallback.clone()))
    }

    async fn write_state(&self, device_id: &str, payload: &str) -> Result<(), DeviceError> {
        lock(&self.writes).push((device_id.to_string(), payload.to_string()));
        Ok(())
    }
}
