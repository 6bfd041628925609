use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Label prefixed to the device name the proxy reports.
pub const DEFAULT_PROXY_LABEL: &str = "Kepware";

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("{field} must be greater than zero")]
    ZeroDuration { field: &'static str },

    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("Unknown value '{value}' for {field}")]
    UnknownValue { field: &'static str, value: String },

    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Message security requested from the device proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityMode {
    #[default]
    None,
    SignAndEncrypt,
}

impl FromStr for SecurityMode {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "None" | "none" => Ok(SecurityMode::None),
            "SignAndEncrypt" | "signandencrypt" => Ok(SecurityMode::SignAndEncrypt),
            other => Err(ConfigurationError::UnknownValue {
                field: "securityMode",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecurityMode::None => f.write_str("None"),
            SecurityMode::SignAndEncrypt => f.write_str("SignAndEncrypt"),
        }
    }
}

/// Security policy URI family requested from the device proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityPolicy {
    #[default]
    None,
    Basic256Sha256,
}

impl FromStr for SecurityPolicy {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "None" | "none" => Ok(SecurityPolicy::None),
            "Basic256Sha256" | "basic256sha256" => Ok(SecurityPolicy::Basic256Sha256),
            other => Err(ConfigurationError::UnknownValue {
                field: "securityPolicy",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for SecurityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecurityPolicy::None => f.write_str("None"),
            SecurityPolicy::Basic256Sha256 => f.write_str("Basic256Sha256"),
        }
    }
}

/// Tag names under `{channel}.{device}` on the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagBindings {
    pub connected: String,
    pub running: String,
    pub speed: String,
    pub control_command: String,
}

impl Default for TagBindings {
    fn default() -> Self {
        Self {
            connected: "Connected".to_string(),
            running: "Running".to_string(),
            speed: "Speed".to_string(),
            control_command: "ControlCommand".to_string(),
        }
    }
}

/// # Device Settings
///
/// Everything the connection manager needs to reach the device proxy.
/// Durations are stored in milliseconds so the JSON config stays flat.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSettings {
    pub endpoint_url: String,
    pub session_name: String,
    pub security_mode: SecurityMode,
    pub security_policy: SecurityPolicy,
    pub reconnect_interval_ms: u64,
    pub connection_timeout_ms: u64,
    pub session_timeout_ms: u64,
    pub auto_accept_untrusted_certificates: bool,
    pub proxy_label: String,
    pub channel: String,
    pub device: String,
    pub tags: TagBindings,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            endpoint_url: "opc.tcp://127.0.0.1:49320".to_string(),
            session_name: "ControlHub_Client".to_string(),
            security_mode: SecurityMode::None,
            security_policy: SecurityPolicy::None,
            reconnect_interval_ms: 5_000,
            connection_timeout_ms: 15_000,
            session_timeout_ms: 60_000,
            auto_accept_untrusted_certificates: true,
            proxy_label: DEFAULT_PROXY_LABEL.to_string(),
            channel: "Channel1".to_string(),
            device: "Device1".to_string(),
            tags: TagBindings::default(),
        }
    }
}

impl DeviceSettings {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    /// Fully qualified node id for `tag`: `ns=2;s={channel}.{device}.{tag}`.
    pub fn node_id(&self, tag: &str) -> String {
        format!("ns=2;s={}.{}.{}", self.channel, self.device, tag)
    }

    /// The name published as `deviceName`, e.g. `Kepware_Channel1_Device1`.
    pub fn device_name(&self) -> String {
        format!("{}_{}_{}", self.proxy_label, self.channel, self.device)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        non_empty("endpointUrl", &self.endpoint_url)?;
        non_empty("sessionName", &self.session_name)?;
        non_empty("proxyLabel", &self.proxy_label)?;
        non_empty("channel", &self.channel)?;
        non_empty("device", &self.device)?;
        non_empty("tags.connected", &self.tags.connected)?;
        non_empty("tags.running", &self.tags.running)?;
        non_empty("tags.speed", &self.tags.speed)?;
        non_empty("tags.controlCommand", &self.tags.control_command)?;
        non_zero("reconnectIntervalMs", self.reconnect_interval_ms)?;
        non_zero("connectionTimeoutMs", self.connection_timeout_ms)?;
        non_zero("sessionTimeoutMs", self.session_timeout_ms)?;
        Ok(())
    }
}

/// # Polling Settings
///
/// Cadence of the state polling loop and the pause applied after a failed tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollingSettings {
    pub interval_ms: u64,
    pub backoff_ceiling_ms: u64,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            interval_ms: 500,
            backoff_ceiling_ms: 2_000,
        }
    }
}

impl PollingSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Pause after a failed tick: twice the poll interval, capped at the ceiling.
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(
            self.interval_ms
                .saturating_mul(2)
                .min(self.backoff_ceiling_ms),
        )
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        non_zero("pollIntervalMs", self.interval_ms)?;
        non_zero("pollBackoffCeilingMs", self.backoff_ceiling_ms)?;
        Ok(())
    }
}

/// Engine settings as a whole.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HubSettings {
    pub device: DeviceSettings,
    pub polling: PollingSettings,
}

impl HubSettings {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.device.validate()?;
        self.polling.validate()
    }
}

fn non_empty(field: &'static str, value: &str) -> Result<(), ConfigurationError> {
    if value.trim().is_empty() {
        return Err(ConfigurationError::Empty { field });
    }
    Ok(())
}

fn non_zero(field: &'static str, value: u64) -> Result<(), ConfigurationError> {
    if value == 0 {
        return Err(ConfigurationError::ZeroDuration { field });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_complete_and_valid() {
        let settings = HubSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.device.endpoint_url, "opc.tcp://127.0.0.1:49320");
        assert_eq!(settings.device.reconnect_interval(), Duration::from_secs(5));
        assert_eq!(settings.device.connection_timeout(), Duration::from_secs(15));
        assert_eq!(settings.device.session_timeout(), Duration::from_secs(60));
        assert_eq!(settings.polling.interval(), Duration::from_millis(500));
        assert_eq!(settings.device.device_name(), "Kepware_Channel1_Device1");
        assert_eq!(
            settings.device.node_id(&settings.device.tags.speed),
            "ns=2;s=Channel1.Device1.Speed"
        );
    }

    #[test]
    fn backoff_is_twice_the_interval_up_to_the_ceiling() {
        let mut polling = PollingSettings::default();
        assert_eq!(polling.backoff(), Duration::from_millis(1_000));
        polling.interval_ms = 1_500;
        assert_eq!(polling.backoff(), Duration::from_millis(2_000));
        polling.interval_ms = u64::MAX;
        assert_eq!(polling.backoff(), Duration::from_millis(2_000));
    }

    #[test]
    fn validation_rejects_zero_interval_and_empty_tag() {
        let mut settings = HubSettings::default();
        settings.polling.interval_ms = 0;
        assert!(matches!(
            settings.validate(),
            Err(ConfigurationError::ZeroDuration { field: "pollIntervalMs" })
        ));

        let mut settings = HubSettings::default();
        settings.device.tags.speed = "  ".to_string();
        assert!(matches!(
            settings.validate(),
            Err(ConfigurationError::Empty { field: "tags.speed" })
        ));
    }

    #[test]
    fn security_values_parse_or_fail() {
        assert_eq!("Basic256Sha256".parse::<SecurityPolicy>().unwrap(), SecurityPolicy::Basic256Sha256);
        assert_eq!("none".parse::<SecurityMode>().unwrap(), SecurityMode::None);
        assert!(matches!(
            "Sign".parse::<SecurityMode>(),
            Err(ConfigurationError::UnknownValue { field: "securityMode", .. })
        ));
    }
}
