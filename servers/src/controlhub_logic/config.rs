use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use clap::Parser;
use hub_common::ConfigurationError;
use hub_common::HubSettings;
use serde::{Deserialize, Serialize};

const DEFAULT_CONFIG_FILE: &str = "server_controlhub.conf";
const DEFAULT_PORT: u16 = 5080;
const DEFAULT_LOG_DIR: &str = "./logs";
const DEFAULT_LOG_LEVEL: &str = "info";

/// Which device source backs the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceMode {
    /// Connection manager over the in-process simulated proxy.
    Simulated,
    /// Fixed values, no session.
    Stub,
}

impl FromStr for DeviceMode {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "simulated" => Ok(DeviceMode::Simulated),
            "stub" => Ok(DeviceMode::Stub),
            other => Err(ConfigurationError::UnknownValue {
                field: "deviceMode",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[command(about = "ControlHub real-time device gateway", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[arg(long, env = "CONTROLHUB_PORT", help = "Port to listen on for HTTP and WebSocket clients.")]
    pub port: Option<u16>,

    #[arg(long, env = "CONTROLHUB_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[arg(long, env = "CONTROLHUB_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[arg(long, env = "CONTROLHUB_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[arg(long, env = "CONTROLHUB_DEVICE_MODE", help = "Device source: simulated or stub.")]
    pub device_mode: Option<String>,

    #[arg(long, env = "CONTROLHUB_ENDPOINT_URL", help = "Device proxy endpoint URL.")]
    pub endpoint_url: Option<String>,

    #[arg(long, env = "CONTROLHUB_SESSION_NAME", help = "Session name presented to the device proxy.")]
    pub session_name: Option<String>,

    #[arg(long, env = "CONTROLHUB_SECURITY_MODE", help = "None or SignAndEncrypt.")]
    pub security_mode: Option<String>,

    #[arg(long, env = "CONTROLHUB_SECURITY_POLICY", help = "None or Basic256Sha256.")]
    pub security_policy: Option<String>,

    #[arg(long, env = "CONTROLHUB_RECONNECT_INTERVAL_MS", help = "Delay between background reconnect attempts.")]
    pub reconnect_interval_ms: Option<u64>,

    #[arg(long, env = "CONTROLHUB_CONNECTION_TIMEOUT_MS", help = "Timeout for every connect, read, write and close.")]
    pub connection_timeout_ms: Option<u64>,

    #[arg(long, env = "CONTROLHUB_SESSION_TIMEOUT_MS", help = "Session timeout requested from the proxy.")]
    pub session_timeout_ms: Option<u64>,

    #[arg(long, env = "CONTROLHUB_AUTO_ACCEPT_CERTS", help = "Accept untrusted proxy certificates (true/false).")]
    pub auto_accept_untrusted_certificates: Option<bool>,

    #[arg(long, env = "CONTROLHUB_PROXY_LABEL", help = "Label prefixed to the published device name.")]
    pub proxy_label: Option<String>,

    #[arg(long, env = "CONTROLHUB_CHANNEL", help = "Proxy channel holding the device.")]
    pub channel: Option<String>,

    #[arg(long, env = "CONTROLHUB_DEVICE", help = "Device name under the channel.")]
    pub device: Option<String>,

    #[arg(long, env = "CONTROLHUB_TAG_CONNECTED", help = "Tag bound to opc.connected.")]
    pub tag_connected: Option<String>,

    #[arg(long, env = "CONTROLHUB_TAG_RUNNING", help = "Tag bound to opc.conveyor.running.")]
    pub tag_running: Option<String>,

    #[arg(long, env = "CONTROLHUB_TAG_SPEED", help = "Tag bound to opc.conveyor.speed.")]
    pub tag_speed: Option<String>,

    #[arg(long, env = "CONTROLHUB_TAG_CONTROL_COMMAND", help = "Tag receiving control command payloads.")]
    pub tag_control_command: Option<String>,

    #[arg(long, env = "CONTROLHUB_POLL_INTERVAL_MS", help = "Delay between state polls.")]
    pub poll_interval_ms: Option<u64>,

    #[arg(long, env = "CONTROLHUB_POLL_BACKOFF_CEILING_MS", help = "Upper bound of the pause after a failed poll.")]
    pub poll_backoff_ceiling_ms: Option<u64>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            device_mode: other.device_mode.or(self.device_mode),
            endpoint_url: other.endpoint_url.or(self.endpoint_url),
            session_name: other.session_name.or(self.session_name),
            security_mode: other.security_mode.or(self.security_mode),
            security_policy: other.security_policy.or(self.security_policy),
            reconnect_interval_ms: other.reconnect_interval_ms.or(self.reconnect_interval_ms),
            connection_timeout_ms: other.connection_timeout_ms.or(self.connection_timeout_ms),
            session_timeout_ms: other.session_timeout_ms.or(self.session_timeout_ms),
            auto_accept_untrusted_certificates: other
                .auto_accept_untrusted_certificates
                .or(self.auto_accept_untrusted_certificates),
            proxy_label: other.proxy_label.or(self.proxy_label),
            channel: other.channel.or(self.channel),
            device: other.device.or(self.device),
            tag_connected: other.tag_connected.or(self.tag_connected),
            tag_running: other.tag_running.or(self.tag_running),
            tag_speed: other.tag_speed.or(self.tag_speed),
            tag_control_command: other.tag_control_command.or(self.tag_control_command),
            poll_interval_ms: other.poll_interval_ms.or(self.poll_interval_ms),
            poll_backoff_ceiling_ms: other.poll_backoff_ceiling_ms.or(self.poll_backoff_ceiling_ms),
        }
    }

    /// Server-level defaults. Engine knobs stay `None` here; their defaults
    /// live in `HubSettings`.
    fn defaults() -> Config {
        Config {
            port: Some(DEFAULT_PORT),
            log_dir: Some(PathBuf::from(DEFAULT_LOG_DIR)),
            log_level: Some(DEFAULT_LOG_LEVEL.to_string()),
            device_mode: Some("simulated".to_string()),
            ..Default::default()
        }
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR))
    }

    pub fn log_level(&self) -> String {
        self.log_level
            .clone()
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string())
    }

    pub fn device_mode(&self) -> Result<DeviceMode, ConfigurationError> {
        self.device_mode
            .as_deref()
            .unwrap_or("simulated")
            .parse()
    }

    /// Folds the merged values over the engine defaults and validates the result.
    pub fn to_settings(&self) -> Result<HubSettings, ConfigurationError> {
        let mut settings = HubSettings::default();
        let device = &mut settings.device;

        if let Some(v) = &self.endpoint_url {
            device.endpoint_url = v.clone();
        }
        if let Some(v) = &self.session_name {
            device.session_name = v.clone();
        }
        if let Some(v) = &self.security_mode {
            device.security_mode = v.parse()?;
        }
        if let Some(v) = &self.security_policy {
            device.security_policy = v.parse()?;
        }
        if let Some(v) = self.reconnect_interval_ms {
            device.reconnect_interval_ms = v;
        }
        if let Some(v) = self.connection_timeout_ms {
            device.connection_timeout_ms = v;
        }
        if let Some(v) = self.session_timeout_ms {
            device.session_timeout_ms = v;
        }
        if let Some(v) = self.auto_accept_untrusted_certificates {
            device.auto_accept_untrusted_certificates = v;
        }
        if let Some(v) = &self.proxy_label {
            device.proxy_label = v.clone();
        }
        if let Some(v) = &self.channel {
            device.channel = v.clone();
        }
        if let Some(v) = &self.device {
            device.device = v.clone();
        }
        if let Some(v) = &self.tag_connected {
            device.tags.connected = v.clone();
        }
        if let Some(v) = &self.tag_running {
            device.tags.running = v.clone();
        }
        if let Some(v) = &self.tag_speed {
            device.tags.speed = v.clone();
        }
        if let Some(v) = &self.tag_control_command {
            device.tags.control_command = v.clone();
        }
        if let Some(v) = self.poll_interval_ms {
            settings.polling.interval_ms = v;
        }
        if let Some(v) = self.poll_backoff_ceiling_ms {
            settings.polling.backoff_ceiling_ms = v;
        }

        settings.validate()?;
        self.device_mode()?;
        Ok(settings)
    }
}

fn read_config_file(path: &Path) -> Result<Config, ConfigurationError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigurationError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| ConfigurationError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Layers defaults, the JSON config file and the parsed CLI/env values, in
/// that order. A missing file is fine; an unreadable or malformed one is not.
pub fn load_config(cli: Config) -> Result<Config, ConfigurationError> {
    // 1. Load defaults
    let mut current = Config::defaults();

    // 2. Load from config file if present. The CLI may point somewhere else.
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    if config_file_path.exists() {
        current = current.merge(read_config_file(&config_file_path)?);
    } else {
        // Logging is not up yet.
        eprintln!(
            "Config file not found at {}. Using defaults and environment/CLI values.",
            config_file_path.display()
        );
    }

    // 3. Override with environment variables and CLI arguments
    Ok(current.merge(cli))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_common::configs::config_hub::SecurityMode;
    use std::io::Write;

    fn write_conf(json: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file
    }

    fn cli_with(path: &Path) -> Config {
        Config {
            config_path: Some(path.to_path_buf()),
            ..Default::default()
        }
    }

    #[test]
    fn defaults_without_a_file() {
        let missing = tempfile::tempdir().unwrap().path().join("absent.conf");
        let config = load_config(cli_with(&missing)).unwrap();

        assert_eq!(config.port(), 5080);
        assert_eq!(config.device_mode().unwrap(), DeviceMode::Simulated);
        let settings = config.to_settings().unwrap();
        assert_eq!(settings, HubSettings::default());
    }

    #[test]
    fn file_overrides_defaults_and_cli_overrides_file() {
        let file = write_conf(
            r#"{"port": 6000, "channel": "Line2", "pollIntervalMs": 250, "securityMode": "SignAndEncrypt"}"#,
        );
        let mut cli = cli_with(file.path());
        cli.port = Some(7000);

        let config = load_config(cli).unwrap();
        let settings = config.to_settings().unwrap();

        assert_eq!(config.port(), 7000);
        assert_eq!(settings.device.channel, "Line2");
        assert_eq!(settings.device.device, "Device1");
        assert_eq!(settings.device.security_mode, SecurityMode::SignAndEncrypt);
        assert_eq!(settings.polling.interval_ms, 250);
    }

    #[test]
    fn proxy_label_reaches_the_device_name() {
        let file = write_conf(r#"{"proxyLabel": "Ignition", "device": "Press7"}"#);
        let config = load_config(cli_with(file.path())).unwrap();
        let settings = config.to_settings().unwrap();

        assert_eq!(settings.device.proxy_label, "Ignition");
        assert_eq!(settings.device.device_name(), "Ignition_Channel1_Press7");

        let config = Config {
            proxy_label: Some(" ".into()),
            ..Config::defaults()
        };
        assert!(matches!(
            config.to_settings(),
            Err(ConfigurationError::Empty { field: "proxyLabel" })
        ));
    }

    #[test]
    fn malformed_file_is_fatal() {
        let file = write_conf("{ not json");
        let err = load_config(cli_with(file.path())).unwrap_err();
        assert!(matches!(err, ConfigurationError::Parse { .. }));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let config = Config {
            poll_interval_ms: Some(0),
            ..Config::defaults()
        };
        assert!(matches!(
            config.to_settings(),
            Err(ConfigurationError::ZeroDuration { .. })
        ));

        let config = Config {
            device_mode: Some("kepware".into()),
            ..Config::defaults()
        };
        assert!(matches!(
            config.to_settings(),
            Err(ConfigurationError::UnknownValue { field: "deviceMode", .. })
        ));
    }
}
