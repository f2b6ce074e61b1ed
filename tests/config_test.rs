//! Integration tests for configuration loading

use rfid_checkpoint::infra::Config;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(content.as_bytes()).unwrap();
    temp_file.flush().unwrap();
    temp_file
}

#[test]
fn test_load_config_from_file() {
    let temp_file = write_config(
        r#"
[device]
id = "DOCK-3"

[serial]
device = "/dev/ttyAMA0"
baud = 19200
status_command = 3
poll_interval_ms = 40
read_timeout_ms = 300

[transit]
idle_timeout_ms = 8000
report_cooldown_ms = 1500
batch_capacity = 500

[reader]
addr = "10.0.0.20:2000"
reconnect_delay_ms = 500

[mqtt]
host = "broker.local"
port = 1884
username = "dock"
password = "pw"

[metrics]
interval_secs = 15
prometheus_port = 9091
"#,
    );

    let config = Config::from_file(temp_file.path()).unwrap();

    assert_eq!(config.device_id(), "DOCK-3");
    assert_eq!(config.serial_device(), "/dev/ttyAMA0");
    assert_eq!(config.serial_baud(), 19200);
    assert_eq!(config.status_command(), 0x03);
    assert_eq!(config.poll_interval(), Duration::from_millis(40));
    assert_eq!(config.read_timeout(), Duration::from_millis(300));
    assert_eq!(config.idle_timeout(), Duration::from_secs(8));
    assert_eq!(config.report_cooldown(), Duration::from_millis(1500));
    assert_eq!(config.batch_capacity(), 500);
    assert_eq!(config.reader_addr(), "10.0.0.20:2000");
    assert_eq!(config.reader_reconnect_delay(), Duration::from_millis(500));
    assert_eq!(config.mqtt_host(), "broker.local");
    assert_eq!(config.mqtt_port(), 1884);
    assert_eq!(config.mqtt_username(), Some("dock"));
    assert_eq!(config.mqtt_command_topic(), "DEVICE/COMMAND/DTU/DOCK-3");
    assert_eq!(config.prometheus_port(), 9091);
    assert_eq!(config.config_file(), temp_file.path().display().to_string());
}

#[test]
fn test_missing_sections_use_defaults() {
    let temp_file = write_config(
        r#"
[device]
id = "GATE-1"
"#,
    );

    let config = Config::from_file(temp_file.path()).unwrap();
    assert_eq!(config.device_id(), "GATE-1");
    assert_eq!(config.serial_device(), "/dev/ttyUSB0");
    assert_eq!(config.poll_interval(), Duration::from_millis(50));
    assert_eq!(config.idle_timeout(), Duration::from_secs(10));
    assert_eq!(config.mqtt_username(), None);
}

#[test]
fn test_invalid_config_is_rejected() {
    let temp_file = write_config(
        r#"
[serial]
read_timeout_ms = 12000

[transit]
idle_timeout_ms = 10000
"#,
    );

    let err = Config::from_file(temp_file.path()).unwrap_err();
    assert!(format!("{err:#}").contains("serial.read_timeout_ms"));
}

#[test]
fn test_malformed_toml_is_rejected() {
    let temp_file = write_config("[serial\nbaud = ");
    assert!(Config::from_file(temp_file.path()).is_err());
}

#[test]
fn test_load_from_path_fallback() {
    let config = Config::load_from_path("/nonexistent/config.toml");
    assert_eq!(config.device_id(), "RFID-DETECTOR-001");
    assert_eq!(config.mqtt_host(), "192.168.1.100");
    assert_eq!(config.mqtt_port(), 1883);
}

#[test]
fn test_shipped_config_loads() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/checkpoint.toml");
    let config = Config::from_file(path).unwrap();
    let defaults = Config::default();
    assert_eq!(config.device_id(), defaults.device_id());
    assert_eq!(config.poll_interval(), defaults.poll_interval());
    assert_eq!(config.idle_timeout(), defaults.idle_timeout());
    assert_eq!(config.reader_addr(), defaults.reader_addr());
    assert_eq!(config.prometheus_port(), defaults.prometheus_port());
}
