//! Transport seam under the connection manager.
//!
//! A [`SessionConnector`] opens sessions; a [`DeviceSession`] reads and writes
//! tags by node id. The wire protocol lives entirely behind these traits.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use super::error::DeviceError;
use crate::configs::config_hub::{DeviceSettings, SecurityMode, SecurityPolicy};
use crate::core::snapshot::ExtensionValue;

/// Per-item quality reported by the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemStatus {
    Good,
    Bad(String),
}

impl ItemStatus {
    pub fn is_good(&self) -> bool {
        matches!(self, ItemStatus::Good)
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemStatus::Good => f.write_str("Good"),
            ItemStatus::Bad(code) => f.write_str(code),
        }
    }
}

/// One item of a bulk read.
#[derive(Debug, Clone, PartialEq)]
pub struct TagReading {
    pub status: ItemStatus,
    pub value: Option<ExtensionValue>,
}

impl TagReading {
    pub fn good(value: impl Into<ExtensionValue>) -> Self {
        Self {
            status: ItemStatus::Good,
            value: Some(value.into()),
        }
    }

    pub fn bad(code: impl Into<String>) -> Self {
        Self {
            status: ItemStatus::Bad(code.into()),
            value: None,
        }
    }

    /// The value when the item is good, `None` otherwise.
    pub fn good_value(&self) -> Option<&ExtensionValue> {
        if self.status.is_good() {
            self.value.as_ref()
        } else {
            None
        }
    }
}

/// Connection parameters built from settings on every connect.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointParams {
    pub endpoint_url: String,
    pub session_name: String,
    pub security_mode: SecurityMode,
    pub security_policy: SecurityPolicy,
    pub session_timeout: Duration,
    pub auto_accept_untrusted_certificates: bool,
}

impl From<&DeviceSettings> for EndpointParams {
    fn from(settings: &DeviceSettings) -> Self {
        Self {
            endpoint_url: settings.endpoint_url.clone(),
            session_name: settings.session_name.clone(),
            security_mode: settings.security_mode,
            security_policy: settings.security_policy,
            session_timeout: settings.session_timeout(),
            auto_accept_untrusted_certificates: settings.auto_accept_untrusted_certificates,
        }
    }
}

/// A live session to the device proxy.
#[async_trait]
pub trait DeviceSession: Send + Sync {
    /// Whether the underlying transport still considers itself connected.
    fn is_connected(&self) -> bool;

    /// Bulk read. The result has one reading per requested node, in order.
    async fn read(&self, nodes: &[String]) -> Result<Vec<TagReading>, DeviceError>;

    /// Single write. A returned `Bad` status is a per-item rejection, not a
    /// transport failure.
    async fn write(&self, node: &str, value: ExtensionValue) -> Result<ItemStatus, DeviceError>;

    async fn close(&self) -> Result<(), DeviceError>;
}

/// Opens sessions to the device proxy.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self, params: &EndpointParams) -> Result<Box<dyn DeviceSession>, DeviceError>;
}
