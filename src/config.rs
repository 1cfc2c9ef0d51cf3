//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.

use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::Result;

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub uplink: UplinkConfig,
    pub ingest: IngestConfig,
    pub heartbeat: HeartbeatConfig,
    pub history: HistoryConfig,
    pub audit: AuditConfig,
    pub auth: AuthConfig,
    pub subscribers: SubscriberConfig,
}

/// Reliable command link to the remote unit
#[derive(Debug, Deserialize, Clone)]
pub struct UplinkConfig {
    #[serde(default = "default_uplink_address")]
    pub address: String,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_schema_timeout_ms")]
    pub schema_timeout_ms: u64,

    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

/// Telemetry datagram ingress
#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_ingest_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_max_datagram_bytes")]
    pub max_datagram_bytes: usize,
}

/// Keep-alive command configuration
#[derive(Debug, Deserialize, Clone)]
pub struct HeartbeatConfig {
    #[serde(default = "default_heartbeat_enabled")]
    pub enabled: bool,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub interval_ms: u64,
}

/// Per-leaf history configuration
#[derive(Debug, Deserialize, Clone)]
pub struct HistoryConfig {
    #[serde(default = "default_history_capacity")]
    pub capacity: usize,
}

/// Audit log configuration
#[derive(Debug, Deserialize, Clone)]
pub struct AuditConfig {
    #[serde(default = "default_audit_enabled")]
    pub enabled: bool,

    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    #[serde(default = "default_initial_log")]
    pub initial_log: String,
}

/// Operator authorization configuration
#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    #[serde(default = "default_token_file")]
    pub token_file: String,

    #[serde(default = "default_passphrase")]
    pub passphrase: String,
}

/// Subscriber endpoint configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SubscriberConfig {
    #[serde(default = "default_subscriber_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

// Default value functions
fn default_uplink_address() -> String { "192.168.2.2:1002".to_string() }
fn default_connect_timeout_ms() -> u64 { 5000 }
fn default_schema_timeout_ms() -> u64 { 10000 }
fn default_command_timeout_ms() -> u64 { 2000 }
fn default_reconnect_delay_ms() -> u64 { 2000 }

fn default_ingest_bind_address() -> String { "0.0.0.0:8000".to_string() }
fn default_max_datagram_bytes() -> usize { 65507 }

fn default_heartbeat_enabled() -> bool { true }
fn default_heartbeat_interval_ms() -> u64 { 60000 }

fn default_history_capacity() -> usize { 10000 }

fn default_audit_enabled() -> bool { true }
fn default_log_dir() -> String { "./logs".to_string() }
fn default_initial_log() -> String { "init".to_string() }

fn default_token_file() -> String { "authenticated_cookies.json".to_string() }
fn default_passphrase() -> String { "MAGIC".to_string() }

fn default_subscriber_bind_address() -> String { "0.0.0.0:8080".to_string() }
fn default_event_buffer() -> usize { 1024 }

impl UplinkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn schema_timeout(&self) -> Duration {
        Duration::from_millis(self.schema_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            address: default_uplink_address(),
            connect_timeout_ms: default_connect_timeout_ms(),
            schema_timeout_ms: default_schema_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use slate_gateway::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("uplink.address", &self.uplink.address),
            ("ingest.bind_address", &self.ingest.bind_address),
            ("subscribers.bind_address", &self.subscribers.bind_address),
            ("auth.token_file", &self.auth.token_file),
            ("auth.passphrase", &self.auth.passphrase),
        ] {
            if value.is_empty() {
                return Err(crate::error::GatewayError::Config(
                    toml::de::Error::custom(format!("{} cannot be empty", name))
                ));
            }
        }

        if self.audit.enabled && (self.audit.log_dir.is_empty() || self.audit.initial_log.is_empty()) {
            return Err(crate::error::GatewayError::Config(
                toml::de::Error::custom("audit log_dir and initial_log cannot be empty when enabled")
            ));
        }

        // Validate timing fields
        for (name, value, max) in [
            ("connect_timeout_ms", self.uplink.connect_timeout_ms, 60000),
            ("schema_timeout_ms", self.uplink.schema_timeout_ms, 60000),
            ("command_timeout_ms", self.uplink.command_timeout_ms, 60000),
            ("reconnect_delay_ms", self.uplink.reconnect_delay_ms, 60000),
            ("heartbeat interval_ms", self.heartbeat.interval_ms, 3_600_000),
        ] {
            if value == 0 || value > max {
                return Err(crate::error::GatewayError::Config(
                    toml::de::Error::custom(format!("{} must be between 1 and {}", name, max))
                ));
            }
        }

        if self.ingest.max_datagram_bytes == 0 || self.ingest.max_datagram_bytes > 65507 {
            return Err(crate::error::GatewayError::Config(
                toml::de::Error::custom("max_datagram_bytes must be between 1 and 65507")
            ));
        }

        if self.history.capacity == 0 {
            return Err(crate::error::GatewayError::Config(
                toml::de::Error::custom("history capacity must be greater than 0")
            ));
        }

        if self.subscribers.event_buffer == 0 {
            return Err(crate::error::GatewayError::Config(
                toml::de::Error::custom("event_buffer must be greater than 0")
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_valid_config() -> Config {
        Config {
            uplink: UplinkConfig::default(),
            ingest: IngestConfig {
                bind_address: default_ingest_bind_address(),
                max_datagram_bytes: default_max_datagram_bytes(),
            },
            heartbeat: HeartbeatConfig {
                enabled: default_heartbeat_enabled(),
                interval_ms: default_heartbeat_interval_ms(),
            },
            history: HistoryConfig {
                capacity: default_history_capacity(),
            },
            audit: AuditConfig {
                enabled: default_audit_enabled(),
                log_dir: default_log_dir(),
                initial_log: default_initial_log(),
            },
            auth: AuthConfig {
                token_file: default_token_file(),
                passphrase: default_passphrase(),
            },
            subscribers: SubscriberConfig {
                bind_address: default_subscriber_bind_address(),
                event_buffer: default_event_buffer(),
            },
        }
    }

    #[test]
    fn test_default_config() {
        assert!(create_valid_config().validate().is_ok());
    }

    #[test]
    fn test_shipped_config_loads() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/default.toml");
        let config = Config::load(path).unwrap();
        assert_eq!(config.uplink.address, default_uplink_address());
        assert_eq!(config.heartbeat.interval(), Duration::from_secs(60));
        assert_eq!(config.history.capacity, default_history_capacity());
    }

    #[test]
    fn test_load_config_from_file() {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let toml_content = r#"
[uplink]
address = "127.0.0.1:1002"

[ingest]

[heartbeat]

[history]
capacity = 500

[audit]

[auth]

[subscribers]
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();
        temp_file.flush().unwrap();

        let config = Config::load(temp_file.path()).unwrap();
        assert_eq!(config.uplink.address, "127.0.0.1:1002");
        assert_eq!(config.uplink.command_timeout(), Duration::from_secs(2));
        assert_eq!(config.history.capacity, 500);
        assert_eq!(config.ingest.bind_address, "0.0.0.0:8000");
    }

    #[test]
    fn test_load_rejects_missing_section() {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"[uplink]\n").unwrap();
        temp_file.flush().unwrap();

        let result = Config::load(temp_file.path());
        assert!(matches!(result, Err(crate::error::GatewayError::Config(_))));
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load("/nonexistent/slate-gateway.toml");
        assert!(matches!(result, Err(crate::error::GatewayError::Io(_))));
    }

    #[test]
    fn test_empty_uplink_address() {
        let mut config = create_valid_config();
        config.uplink.address = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_passphrase() {
        let mut config = create_valid_config();
        config.auth.passphrase = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_log_dir_when_enabled() {
        let mut config = create_valid_config();
        config.audit.enabled = true;
        config.audit.log_dir = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_log_dir_when_disabled() {
        let mut config = create_valid_config();
        config.audit.enabled = false;
        config.audit.log_dir = String::new();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_connect_timeout_zero() {
        let mut config = create_valid_config();
        config.uplink.connect_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_command_timeout_too_high() {
        let mut config = create_valid_config();
        config.uplink.command_timeout_ms = 60001;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reconnect_delay_zero() {
        let mut config = create_valid_config();
        config.uplink.reconnect_delay_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_heartbeat_interval_zero() {
        let mut config = create_valid_config();
        config.heartbeat.interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_datagram_size_too_large() {
        let mut config = create_valid_config();
        config.ingest.max_datagram_bytes = 65508;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_history_capacity_zero() {
        let mut config = create_valid_config();
        config.history.capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_event_buffer_zero() {
        let mut config = create_valid_config();
        config.subscribers.event_buffer = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_functions() {
        assert_eq!(default_uplink_address(), "192.168.2.2:1002");
        assert_eq!(default_connect_timeout_ms(), 5000);
        assert_eq!(default_schema_timeout_ms(), 10000);
        assert_eq!(default_command_timeout_ms(), 2000);
        assert_eq!(default_reconnect_delay_ms(), 2000);
        assert_eq!(default_ingest_bind_address(), "0.0.0.0:8000");
        assert_eq!(default_heartbeat_interval_ms(), 60000);
        assert_eq!(default_history_capacity(), 10000);
        assert_eq!(default_log_dir(), "./logs");
        assert_eq!(default_initial_log(), "init");
        assert_eq!(default_token_file(), "authenticated_cookies.json");
        assert_eq!(default_event_buffer(), 1024);
    }
}
