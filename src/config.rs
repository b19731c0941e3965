//! Configuration module for the tunnel client
//!
//! This module provides TOML-based configuration parsing and validation.
//! The gateway section mirrors what the host application persists (address,
//! port, trust anchor); the tunnel section holds the timing knobs of the
//! handshake, forwarding and reconnect logic.

use crate::error::{Result, VpnError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Gateway port as persisted by the host: either a number or free text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortSetting {
    Number(i64),
    Text(String),
}

impl fmt::Display for PortSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortSetting::Number(n) => write!(f, "{n}"),
            PortSetting::Text(s) => f.write_str(s),
        }
    }
}

impl PortSetting {
    /// Resolve to a usable 16-bit port
    pub fn resolve(&self) -> Result<u16> {
        let port = match self {
            PortSetting::Number(n) => u16::try_from(*n).ok(),
            PortSetting::Text(s) => s.trim().parse::<u16>().ok(),
        };
        match port {
            Some(0) | None => Err(VpnError::Config(format!("Bad port: {self}"))),
            Some(port) => Ok(port),
        }
    }
}

/// Gateway configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Gateway hostname or IP address
    pub address: String,
    /// Gateway UDP port
    pub port: PortSetting,
    /// PEM file holding the root of trust for the secure channel
    pub ca_cert_path: Option<String>,
    /// Session name handed to the interface provisioner
    #[serde(default = "default_session_name")]
    pub session_name: String,
}

/// Timing knobs for handshake, forwarding and reconnect
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSection {
    /// Poll interval of the forwarding and handshake loops in milliseconds
    #[serde(default = "default_idle_interval")]
    pub idle_interval_ms: u64,
    /// Wall-clock interval between keepalive bursts in milliseconds
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_ms: u64,
    /// Redundant keepalive frames per burst
    #[serde(default = "default_keepalive_burst")]
    pub keepalive_burst: u32,
    /// Poll iterations to wait for the parameter frame
    #[serde(default = "default_max_handshake_attempts")]
    pub max_handshake_attempts: u32,
    /// Copies of the parameter request frame
    #[serde(default = "default_repeats")]
    pub request_repeats: u32,
    /// Spacing between request copies in milliseconds
    #[serde(default = "default_spacing")]
    pub request_spacing_ms: u64,
    /// Copies of the raw connect knock sent before the secure handshake
    #[serde(default = "default_repeats")]
    pub knock_repeats: u32,
    /// Spacing between knocks in milliseconds
    #[serde(default = "default_spacing")]
    pub knock_spacing_ms: u64,
    /// Upper bound for the secure channel connect in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Reconnect attempts before giving up
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Copies of the disconnect notice sent on user disconnect
    #[serde(default = "default_repeats")]
    pub disconnect_notice_repeats: u32,
}

impl Default for TunnelSection {
    fn default() -> Self {
        Self {
            idle_interval_ms: default_idle_interval(),
            keepalive_interval_ms: default_keepalive_interval(),
            keepalive_burst: default_keepalive_burst(),
            max_handshake_attempts: default_max_handshake_attempts(),
            request_repeats: default_repeats(),
            request_spacing_ms: default_spacing(),
            knock_repeats: default_repeats(),
            knock_spacing_ms: default_spacing(),
            connect_timeout_secs: default_connect_timeout(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            disconnect_notice_repeats: default_repeats(),
        }
    }
}

/// Network configuration settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Firewall mark applied to the transport socket (Linux)
    pub fwmark: Option<u32>,
    /// TUN interface name; `%d` is replaced by a free index
    pub interface_name: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Gateway configuration
    pub gateway: GatewayConfig,
    /// Tunnel timing configuration
    #[serde(default)]
    pub tunnel: TunnelSection,
    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns [`VpnError::Config`] if the file cannot be read or is not
    /// valid TOML. The result is not validated; see [`Config::validate`].
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| VpnError::Config(format!("Failed to read config file: {e}")))?;

        <Self as FromStr>::from_str(&contents)
    }

    /// Convert configuration to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| VpnError::Config(format!("Failed to serialize config: {e}")))
    }

    /// Gateway port, validated as a non-zero 16-bit value
    pub fn gateway_port(&self) -> Result<u16> {
        self.gateway.port.resolve()
    }

    /// Validate the configuration
    ///
    /// The port is checked per attempt by [`Config::gateway_port`].
    pub fn validate(&self) -> Result<()> {
        if self.gateway.address.trim().is_empty() {
            return Err(VpnError::Config(
                "Gateway address cannot be empty".to_string(),
            ));
        }

        let t = &self.tunnel;
        if t.idle_interval_ms == 0 {
            return Err(VpnError::Config(
                "idle_interval_ms must be greater than zero".to_string(),
            ));
        }
        if t.keepalive_interval_ms < t.idle_interval_ms {
            return Err(VpnError::Config(
                "keepalive_interval_ms must not be shorter than idle_interval_ms".to_string(),
            ));
        }
        if t.max_handshake_attempts == 0 || t.request_repeats == 0 {
            return Err(VpnError::Config(
                "handshake attempts and request repeats must be greater than zero".to_string(),
            ));
        }
        if t.max_reconnect_attempts == 0 {
            return Err(VpnError::Config(
                "max_reconnect_attempts must be greater than zero".to_string(),
            ));
        }
        if t.connect_timeout_secs == 0 {
            return Err(VpnError::Config(
                "connect_timeout_secs must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Configuration for a gateway with default timing
    pub fn for_gateway(address: &str, port: u16) -> Self {
        Self {
            gateway: GatewayConfig {
                address: address.to_string(),
                port: PortSetting::Number(i64::from(port)),
                ca_cert_path: None,
                session_name: default_session_name(),
            },
            tunnel: TunnelSection::default(),
            network: NetworkConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Durations and counters consumed by sessions
    pub fn settings(&self) -> TunnelSettings {
        TunnelSettings::from(&self.tunnel)
    }
}

impl FromStr for Config {
    type Err = VpnError;

    fn from_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| VpnError::Config(format!("Failed to parse TOML: {e}")))
    }
}

/// Tunnel timing converted to [`Duration`]s
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    pub idle_interval: Duration,
    pub keepalive_interval: Duration,
    pub keepalive_burst: u32,
    pub max_handshake_attempts: u32,
    pub request_repeats: u32,
    pub request_spacing: Duration,
    pub knock_repeats: u32,
    pub knock_spacing: Duration,
    pub connect_timeout: Duration,
    pub max_reconnect_attempts: u32,
    pub disconnect_notice_repeats: u32,
}

impl TunnelSettings {
    /// Poll iterations between keepalive bursts
    pub fn keepalive_threshold(&self) -> u64 {
        let idle = self.idle_interval.as_millis().max(1);
        (self.keepalive_interval.as_millis() / idle) as u64
    }
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self::from(&TunnelSection::default())
    }
}

impl From<&TunnelSection> for TunnelSettings {
    fn from(t: &TunnelSection) -> Self {
        Self {
            idle_interval: Duration::from_millis(t.idle_interval_ms),
            keepalive_interval: Duration::from_millis(t.keepalive_interval_ms),
            keepalive_burst: t.keepalive_burst,
            max_handshake_attempts: t.max_handshake_attempts,
            request_repeats: t.request_repeats,
            request_spacing: Duration::from_millis(t.request_spacing_ms),
            knock_repeats: t.knock_repeats,
            knock_spacing: Duration::from_millis(t.knock_spacing_ms),
            connect_timeout: Duration::from_secs(t.connect_timeout_secs),
            max_reconnect_attempts: t.max_reconnect_attempts,
            disconnect_notice_repeats: t.disconnect_notice_repeats,
        }
    }
}

// Default value functions for serde
fn default_session_name() -> String {
    "tunlink".to_string()
}

fn default_idle_interval() -> u64 {
    4
}

fn default_keepalive_interval() -> u64 {
    3000
}

fn default_keepalive_burst() -> u32 {
    3
}

fn default_max_handshake_attempts() -> u32 {
    50
}

fn default_repeats() -> u32 {
    4
}

fn default_spacing() -> u64 {
    100
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_parsing() {
        let toml_content = r#"
[gateway]
address = "vpn.example.com"
port = 4433
ca_cert_path = "/etc/tunlink/ca.pem"

[tunnel]
idle_interval_ms = 10

[logging]
level = "debug"
"#;

        let config = toml_content
            .parse::<Config>()
            .expect("Failed to parse config");
        assert_eq!(config.gateway.address, "vpn.example.com");
        assert_eq!(config.gateway_port().unwrap(), 4433);
        assert_eq!(config.gateway.session_name, "tunlink");
        assert_eq!(config.tunnel.idle_interval_ms, 10);
        assert_eq!(config.tunnel.keepalive_interval_ms, 3000);
        assert_eq!(config.tunnel.max_reconnect_attempts, 10);
        assert_eq!(config.logging.level, "debug");
        assert!(config.network.fwmark.is_none());
    }

    #[test]
    fn test_port_as_text() {
        let config: Config = r#"
[gateway]
address = "10.1.1.1"
port = " 8000 "
"#
        .parse()
        .unwrap();
        assert_eq!(config.gateway_port().unwrap(), 8000);
    }

    #[test]
    fn test_bad_ports_are_config_errors() {
        for port in [
            PortSetting::Text("abc".into()),
            PortSetting::Text(String::new()),
            PortSetting::Number(0),
            PortSetting::Number(70000),
            PortSetting::Number(-1),
        ] {
            let err = port.resolve().unwrap_err();
            assert!(matches!(err, VpnError::Config(_)), "{port} accepted");
        }
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::for_gateway("10.0.0.1", 4433);
        assert!(config.validate().is_ok());

        config.gateway.address = String::new();
        assert!(config.validate().is_err());

        let mut config = Config::for_gateway("10.0.0.1", 4433);
        config.tunnel.keepalive_interval_ms = 1;
        assert!(config.validate().is_err());

        let mut config = Config::for_gateway("10.0.0.1", 4433);
        config.tunnel.max_reconnect_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_keepalive_threshold() {
        let settings = TunnelSettings::default();
        assert_eq!(settings.keepalive_threshold(), 750);
    }

    #[test]
    fn test_from_file_round_trip() {
        let config = Config::for_gateway("gw.example.net", 5555);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(config.to_toml().unwrap().as_bytes()).unwrap();

        let loaded = Config::from_file(file.path()).unwrap();
        assert_eq!(loaded.gateway.address, "gw.example.net");
        assert_eq!(loaded.gateway_port().unwrap(), 5555);
    }
}
