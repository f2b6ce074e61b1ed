//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/checkpoint.toml

use crate::domain::error::ConfigError;
use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "config/checkpoint.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    /// Checkpoint identifier, used in MQTT client id and topics
    #[serde(default = "default_device_id")]
    pub id: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self { id: default_device_id() }
    }
}

fn default_device_id() -> String {
    "RFID-DETECTOR-001".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SerialConfig {
    #[serde(default = "default_serial_device")]
    pub device: String,
    #[serde(default = "default_serial_baud")]
    pub baud: u32,
    /// Register read command for the light-gate inputs
    #[serde(default = "default_status_command")]
    pub status_command: u8,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Total budget for one register read
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Readiness wait between drains
    #[serde(default = "default_inter_byte_timeout_ms")]
    pub inter_byte_timeout_ms: u64,
    /// Extra wait granted once to a response shorter than 8 bytes
    #[serde(default = "default_residual_timeout_ms")]
    pub residual_timeout_ms: u64,
    /// Reject complete responses whose CRC trailer does not match
    #[serde(default = "default_verify_crc")]
    pub verify_crc: bool,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device: default_serial_device(),
            baud: default_serial_baud(),
            status_command: default_status_command(),
            poll_interval_ms: default_poll_interval_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            inter_byte_timeout_ms: default_inter_byte_timeout_ms(),
            residual_timeout_ms: default_residual_timeout_ms(),
            verify_crc: default_verify_crc(),
        }
    }
}

fn default_serial_device() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_serial_baud() -> u32 {
    9600
}

fn default_status_command() -> u8 {
    0x02
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_read_timeout_ms() -> u64 {
    500
}

fn default_inter_byte_timeout_ms() -> u64 {
    20
}

fn default_residual_timeout_ms() -> u64 {
    30
}

fn default_verify_crc() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransitConfig {
    /// Watchdog: max time in a non-idle state without a state change
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Minimum interval between two published reports
    #[serde(default = "default_report_cooldown_ms")]
    pub report_cooldown_ms: u64,
    /// Hard cap on tags held for one transit
    #[serde(default = "default_batch_capacity")]
    pub batch_capacity: usize,
}

impl Default for TransitConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: default_idle_timeout_ms(),
            report_cooldown_ms: default_report_cooldown_ms(),
            batch_capacity: default_batch_capacity(),
        }
    }
}

fn default_idle_timeout_ms() -> u64 {
    10_000
}

fn default_report_cooldown_ms() -> u64 {
    1_000
}

fn default_batch_capacity() -> usize {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReaderConfig {
    #[serde(default = "default_reader_addr")]
    pub addr: String,
    #[serde(default = "default_reader_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    #[serde(default = "default_reader_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            addr: default_reader_addr(),
            dial_timeout_ms: default_reader_dial_timeout_ms(),
            reconnect_delay_ms: default_reader_reconnect_delay_ms(),
        }
    }
}

fn default_reader_addr() -> String {
    "192.168.1.200:2000".to_string()
}

fn default_reader_dial_timeout_ms() -> u64 {
    5_000
}

fn default_reader_reconnect_delay_ms() -> u64 {
    2_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_mqtt_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Per-publish timeout in the publisher task
    #[serde(default = "default_mqtt_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
    /// Bounded report queue between the polling task and the publisher
    #[serde(default = "default_mqtt_queue_size")]
    pub queue_size: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            username: None,
            password: None,
            keep_alive_secs: default_mqtt_keep_alive_secs(),
            publish_timeout_ms: default_mqtt_publish_timeout_ms(),
            queue_size: default_mqtt_queue_size(),
        }
    }
}

fn default_mqtt_host() -> String {
    "192.168.1.100".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_mqtt_keep_alive_secs() -> u64 {
    60
}

fn default_mqtt_publish_timeout_ms() -> u64 {
    2_000
}

fn default_mqtt_queue_size() -> usize {
    64
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval_secs")]
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default = "default_prometheus_port")]
    pub prometheus_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_metrics_interval_secs(),
            prometheus_port: default_prometheus_port(),
        }
    }
}

fn default_metrics_interval_secs() -> u64 {
    30
}

fn default_prometheus_port() -> u16 {
    9100
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub transit: TransitConfig,
    #[serde(default)]
    pub reader: ReaderConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    device_id: String,
    serial_device: String,
    serial_baud: u32,
    status_command: u8,
    poll_interval_ms: u64,
    read_timeout_ms: u64,
    inter_byte_timeout_ms: u64,
    residual_timeout_ms: u64,
    verify_crc: bool,
    idle_timeout_ms: u64,
    report_cooldown_ms: u64,
    batch_capacity: usize,
    reader_addr: String,
    reader_dial_timeout_ms: u64,
    reader_reconnect_delay_ms: u64,
    mqtt_host: String,
    mqtt_port: u16,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    mqtt_keep_alive_secs: u64,
    mqtt_publish_timeout_ms: u64,
    mqtt_queue_size: usize,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        let TomlConfig { device, serial, transit, reader, mqtt, metrics } = toml_config;
        Self {
            device_id: device.id,
            serial_device: serial.device,
            serial_baud: serial.baud,
            status_command: serial.status_command,
            poll_interval_ms: serial.poll_interval_ms,
            read_timeout_ms: serial.read_timeout_ms,
            inter_byte_timeout_ms: serial.inter_byte_timeout_ms,
            residual_timeout_ms: serial.residual_timeout_ms,
            verify_crc: serial.verify_crc,
            idle_timeout_ms: transit.idle_timeout_ms,
            report_cooldown_ms: transit.report_cooldown_ms,
            batch_capacity: transit.batch_capacity,
            reader_addr: reader.addr,
            reader_dial_timeout_ms: reader.dial_timeout_ms,
            reader_reconnect_delay_ms: reader.reconnect_delay_ms,
            mqtt_host: mqtt.host,
            mqtt_port: mqtt.port,
            mqtt_username: mqtt.username,
            mqtt_password: mqtt.password,
            mqtt_keep_alive_secs: mqtt.keep_alive_secs,
            mqtt_publish_timeout_ms: mqtt.publish_timeout_ms,
            mqtt_queue_size: mqtt.queue_size,
            metrics_interval_secs: metrics.interval_secs,
            prometheus_port: metrics.prometheus_port,
            config_file,
        }
    }

    /// Determine config file path from args or environment
    pub fn resolve_config_path(cli_path: Option<&str>) -> String {
        if let Some(path) = cli_path {
            return path.to_string();
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        DEFAULT_CONFIG_PATH.to_string()
    }

    /// Load and validate configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        let config = Self::from_toml(toml_config, path.display().to_string());
        config
            .validate()
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Self {
        match Self::from_file(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_id.trim().is_empty() {
            return Err(ConfigError::invalid("device.id", "must not be empty"));
        }
        if self.serial_device.trim().is_empty() {
            return Err(ConfigError::invalid("serial.device", "must not be empty"));
        }
        if self.serial_baud == 0 {
            return Err(ConfigError::invalid("serial.baud", "must be positive"));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::invalid("serial.poll_interval_ms", "must be positive"));
        }
        if self.read_timeout_ms == 0 {
            return Err(ConfigError::invalid("serial.read_timeout_ms", "must be positive"));
        }
        if self.inter_byte_timeout_ms == 0 || self.inter_byte_timeout_ms > self.read_timeout_ms {
            return Err(ConfigError::invalid(
                "serial.inter_byte_timeout_ms",
                format!("must be in 1..={}", self.read_timeout_ms),
            ));
        }
        if self.idle_timeout_ms == 0 {
            return Err(ConfigError::invalid("transit.idle_timeout_ms", "must be positive"));
        }
        if self.read_timeout_ms >= self.idle_timeout_ms {
            return Err(ConfigError::invalid(
                "serial.read_timeout_ms",
                format!("must be below transit.idle_timeout_ms ({})", self.idle_timeout_ms),
            ));
        }
        if self.batch_capacity == 0 {
            return Err(ConfigError::invalid("transit.batch_capacity", "must be positive"));
        }
        if self.reader_addr.trim().is_empty() {
            return Err(ConfigError::invalid("reader.addr", "must not be empty"));
        }
        if self.mqtt_host.trim().is_empty() {
            return Err(ConfigError::invalid("mqtt.host", "must not be empty"));
        }
        if self.mqtt_queue_size == 0 {
            return Err(ConfigError::invalid("mqtt.queue_size", "must be positive"));
        }
        if self.metrics_interval_secs == 0 {
            return Err(ConfigError::invalid("metrics.interval_secs", "must be positive"));
        }
        Ok(())
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn serial_device(&self) -> &str {
        &self.serial_device
    }

    pub fn serial_baud(&self) -> u32 {
        self.serial_baud
    }

    pub fn status_command(&self) -> u8 {
        self.status_command
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn inter_byte_timeout(&self) -> Duration {
        Duration::from_millis(self.inter_byte_timeout_ms)
    }

    pub fn residual_timeout(&self) -> Duration {
        Duration::from_millis(self.residual_timeout_ms)
    }

    pub fn verify_crc(&self) -> bool {
        self.verify_crc
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn report_cooldown(&self) -> Duration {
        Duration::from_millis(self.report_cooldown_ms)
    }

    pub fn batch_capacity(&self) -> usize {
        self.batch_capacity
    }

    pub fn reader_addr(&self) -> &str {
        &self.reader_addr
    }

    pub fn reader_dial_timeout(&self) -> Duration {
        Duration::from_millis(self.reader_dial_timeout_ms)
    }

    pub fn reader_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reader_reconnect_delay_ms)
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt_host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt_port
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt_username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt_password.as_deref()
    }

    pub fn mqtt_keep_alive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keep_alive_secs)
    }

    pub fn mqtt_publish_timeout(&self) -> Duration {
        Duration::from_millis(self.mqtt_publish_timeout_ms)
    }

    pub fn mqtt_queue_size(&self) -> usize {
        self.mqtt_queue_size
    }

    pub fn mqtt_client_id(&self) -> String {
        format!("RFID_DETECTOR_{}", self.device_id)
    }

    /// Topic reports are published to
    pub fn mqtt_command_topic(&self) -> String {
        format!("DEVICE/COMMAND/DTU/{}", self.device_id)
    }

    /// Production/status pushes from the backend
    pub fn mqtt_data_topic(&self) -> String {
        format!("DEVICE/DATA/DTU/{}", self.device_id)
    }

    /// Command responses from the backend
    pub fn mqtt_response_topic(&self) -> String {
        format!("DEVICE/RESPONSE/DTU/{}", self.device_id)
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to shorten the watchdog
    pub fn with_idle_timeout_ms(mut self, ms: u64) -> Self {
        self.idle_timeout_ms = ms;
        self
    }

    /// Builder method for tests to shrink the batch cap
    pub fn with_batch_capacity(mut self, capacity: usize) -> Self {
        self.batch_capacity = capacity;
        self
    }
}
