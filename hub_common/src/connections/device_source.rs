use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::error::DeviceError;
use crate::core::snapshot::ExtensionMap;

/// # Device State Source
///
/// The two operations the engine needs from whatever sits in front of the
/// physical device. `read_state` returns a flat bag of namespaced attributes;
/// `write_state` forwards one opaque command payload unchanged.
#[async_trait]
pub trait DeviceStateSource: Send + Sync {
    /// Reads the current attribute values. Observes `shutdown` and returns
    /// [`DeviceError::Cancelled`] once it fires.
    async fn read_state(&self, shutdown: &CancellationToken) -> Result<ExtensionMap, DeviceError>;

    /// Writes `payload` to the device's control channel.
    async fn write_state(&self, device_id: &str, payload: &str) -> Result<(), DeviceError>;
}
