//! In-process stand-in for the device proxy.
//!
//! A [`SimulatedDevice`] holds a tag table keyed by node id. The
//! [`SimulatedConnector`] opens sessions against it; tests and the demo server
//! flip reachability, inject bad items and inspect writes.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::error::DeviceError;
use super::session::{DeviceSession, EndpointParams, ItemStatus, SessionConnector, TagReading};
use crate::configs::config_hub::DeviceSettings;
use crate::core::snapshot::ExtensionValue;

#[derive(Default)]
struct TagTable {
    tags: HashMap<String, TagReading>,
    read_only: HashSet<String>,
    written: HashMap<String, ExtensionValue>,
    connect_delay: Duration,
    call_delay: Duration,
}

/// A simulated device proxy.
pub struct SimulatedDevice {
    table: Mutex<TagTable>,
    reachable: AtomicBool,
    sever_next_read: AtomicBool,
    // Bumped whenever existing sessions must die.
    epoch: AtomicU64,
    connect_attempts: AtomicU64,
}

impl SimulatedDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            table: Mutex::new(TagTable::default()),
            reachable: AtomicBool::new(true),
            sever_next_read: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            connect_attempts: AtomicU64::new(0),
        })
    }

    /// A device with healthy values on every configured tag.
    pub fn seeded(settings: &DeviceSettings) -> Arc<Self> {
        let device = Self::new();
        let tags = &settings.tags;
        device.set_tag(&settings.node_id(&tags.connected), true);
        device.set_tag(&settings.node_id(&tags.running), true);
        device.set_tag(&settings.node_id(&tags.speed), 0.8);
        device.set_tag(&settings.node_id(&tags.control_command), "");
        device
    }

    fn table(&self) -> MutexGuard<'_, TagTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_tag(&self, node: &str, value: impl Into<ExtensionValue>) {
        self.table()
            .tags
            .insert(node.to_string(), TagReading::good(value));
    }

    /// Marks `node` with a bad per-item status on subsequent reads.
    pub fn set_bad(&self, node: &str, code: &str) {
        self.table().tags.insert(node.to_string(), TagReading::bad(code));
    }

    /// Writes to `node` are answered with `BadNotWritable`.
    pub fn set_read_only(&self, node: &str) {
        self.table().read_only.insert(node.to_string());
    }

    /// Going unreachable kills every open session and fails new connects.
    pub fn set_reachable(&self, reachable: bool) {
        if !reachable {
            self.epoch.fetch_add(1, Ordering::AcqRel);
        }
        self.reachable.store(reachable, Ordering::Release);
    }

    /// The next read drops every open session and fails with a transport
    /// error. The device stays reachable.
    pub fn sever_on_next_read(&self) {
        self.sever_next_read.store(true, Ordering::Release);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.table().connect_delay = delay;
    }

    /// Every read and write on an open session stalls this long first. The
    /// session keeps reporting itself connected meanwhile.
    pub fn set_call_delay(&self, delay: Duration) {
        self.table().call_delay = delay;
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::Acquire)
    }

    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::Relaxed)
    }

    /// Last value written to `node`, if any.
    pub fn written(&self, node: &str) -> Option<ExtensionValue> {
        self.table().written.get(node).cloned()
    }
}

/// Opens [`SimulatedSession`]s against a shared [`SimulatedDevice`].
pub struct SimulatedConnector {
    device: Arc<SimulatedDevice>,
}

impl SimulatedConnector {
    pub fn new(device: Arc<SimulatedDevice>) -> Self {
        Self { device }
    }
}

#[async_trait]
impl SessionConnector for SimulatedConnector {
    async fn connect(&self, params: &EndpointParams) -> Result<Box<dyn DeviceSession>, DeviceError> {
        self.device.connect_attempts.fetch_add(1, Ordering::Relaxed);

        let delay = self.device.table().connect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if !self.device.is_reachable() {
            return Err(DeviceError::Transport(format!(
                "endpoint {} unreachable",
                params.endpoint_url
            )));
        }

        tracing::trace!(session = %params.session_name, "Simulated session opened");
        Ok(Box::new(SimulatedSession {
            device: Arc::clone(&self.device),
            epoch: self.device.epoch.load(Ordering::Acquire),
            closed: AtomicBool::new(false),
        }))
    }
}

/// A session bound to the device epoch it was opened in.
pub struct SimulatedSession {
    device: Arc<SimulatedDevice>,
    epoch: u64,
    closed: AtomicBool,
}

impl SimulatedSession {
    async fn stall(&self) {
        let delay = self.device.table().call_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn check(&self) -> Result<(), DeviceError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(DeviceError::Transport("connection reset by peer".to_string()))
        }
    }
}

#[async_trait]
impl DeviceSession for SimulatedSession {
    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
            && self.device.is_reachable()
            && self.device.epoch.load(Ordering::Acquire) == self.epoch
    }

    async fn read(&self, nodes: &[String]) -> Result<Vec<TagReading>, DeviceError> {
        self.stall().await;
        self.check()?;
        if self.device.sever_next_read.swap(false, Ordering::AcqRel) {
            self.device.epoch.fetch_add(1, Ordering::AcqRel);
            return Err(DeviceError::Transport("connection reset by peer".to_string()));
        }

        let table = self.device.table();
        Ok(nodes
            .iter()
            .map(|node| {
                table
                    .tags
                    .get(node)
                    .cloned()
                    .unwrap_or_else(|| TagReading::bad("BadNodeIdUnknown"))
            })
            .collect())
    }

    async fn write(&self, node: &str, value: ExtensionValue) -> Result<ItemStatus, DeviceError> {
        self.stall().await;
        self.check()?;

        let mut table = self.device.table();
        if table.read_only.contains(node) {
            return Ok(ItemStatus::Bad("BadNotWritable".to_string()));
        }
        if !table.tags.contains_key(node) {
            return Ok(ItemStatus::Bad("BadNodeIdUnknown".to_string()));
        }
        table.tags.insert(node.to_string(), TagReading::good(value.clone()));
        table.written.insert(node.to_string(), value);
        Ok(ItemStatus::Good)
    }

    async fn close(&self) -> Result<(), DeviceError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
