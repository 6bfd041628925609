use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::device_manager::{KEY_CONNECTED, KEY_RUNNING, KEY_SPEED};
use super::device_source::DeviceStateSource;
use super::error::DeviceError;
use crate::core::snapshot::{ExtensionMap, DEVICE_NAME_KEY, DEVICE_STATUS_KEY};

/// # Stub Device Source
///
/// Fixed-value source with no session behind it. Reads always report a
/// healthy running conveyor; writes are logged and counted.
pub struct StubDeviceSource {
    device_name: String,
    writes: AtomicU64,
}

impl StubDeviceSource {
    pub fn new(device_name: impl Into<String>) -> Self {
        Self {
            device_name: device_name.into(),
            writes: AtomicU64::new(0),
        }
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DeviceStateSource for StubDeviceSource {
    async fn read_state(&self, shutdown: &CancellationToken) -> Result<ExtensionMap, DeviceError> {
        if shutdown.is_cancelled() {
            return Err(DeviceError::Cancelled);
        }
        let mut map = ExtensionMap::new();
        map.insert(KEY_CONNECTED.to_string(), true.into());
        map.insert(KEY_RUNNING.to_string(), true.into());
        map.insert(KEY_SPEED.to_string(), 0.8.into());
        map.insert(DEVICE_NAME_KEY.to_string(), self.device_name.clone().into());
        map.insert(DEVICE_STATUS_KEY.to_string(), "Online".into());
        Ok(map)
    }

    async fn write_state(&self, device_id: &str, payload: &str) -> Result<(), DeviceError> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        tracing::info!(device_id = %device_id, bytes = payload.len(), "Stub source accepted control command");
        Ok(())
    }
}
