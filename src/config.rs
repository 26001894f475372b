use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};

/// Serial line and Modbus node settings. The line is always 8 data bits,
/// no parity, 1 stop bit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialSettings {
    #[serde(default = "default_port")]
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Modbus node (slave) address of the machine
    #[serde(default = "default_slave_id")]
    pub slave_id: u8,
    /// Per-request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_port() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_slave_id() -> u8 {
    1
}

fn default_timeout_ms() -> u64 {
    2000
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud_rate: default_baud_rate(),
            slave_id: default_slave_id(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl SerialSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Copy with the port and/or baud rate replaced.
    pub fn with_overrides(&self, port: Option<&str>, baud_rate: Option<u32>) -> Self {
        Self {
            port: port.map(str::to_string).unwrap_or_else(|| self.port.clone()),
            baud_rate: baud_rate.unwrap_or(self.baud_rate),
            ..self.clone()
        }
    }
}

/// Time-to-live of each cached snapshot kind, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_info_ttl")]
    pub info_ttl_secs: u64,
    #[serde(default = "default_status_ttl")]
    pub status_ttl_secs: u64,
    #[serde(default = "default_health_ttl")]
    pub health_ttl_secs: u64,
    /// Used while the last known connection state is "connected"
    #[serde(default = "default_connected_ttl")]
    pub connected_ttl_secs: u64,
    /// Used while the last known connection state is "disconnected"
    #[serde(default = "default_disconnected_ttl")]
    pub disconnected_ttl_secs: u64,
}

fn default_info_ttl() -> u64 {
    300
}

fn default_status_ttl() -> u64 {
    30
}

fn default_health_ttl() -> u64 {
    60
}

fn default_connected_ttl() -> u64 {
    300
}

fn default_disconnected_ttl() -> u64 {
    60
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            info_ttl_secs: default_info_ttl(),
            status_ttl_secs: default_status_ttl(),
            health_ttl_secs: default_health_ttl(),
            connected_ttl_secs: default_connected_ttl(),
            disconnected_ttl_secs: default_disconnected_ttl(),
        }
    }
}

/// Background work: periodic health checks and delivery completion tracking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// 0 disables the in-process health check task
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,
    #[serde(default = "default_delivery_timeout")]
    pub delivery_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_health_interval() -> u64 {
    300
}

fn default_delivery_timeout() -> u64 {
    120
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            health_interval_secs: default_health_interval(),
            delivery_timeout_secs: default_delivery_timeout(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpSettings {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default)]
    pub serial: SerialSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub http: HttpSettings,
    /// Drive the built-in machine simulator instead of a serial port
    #[serde(default)]
    pub simulate: bool,
}

impl ControllerConfig {
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).context("Failed to parse TOML configuration")
    }

    /// Read configuration from a file; `.json` files are parsed as JSON, anything else as TOML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        if path.extension().is_some_and(|ext| ext == "json") {
            Self::from_json(&content)
        } else {
            Self::from_toml(&content)
        }
    }

    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str).context("Failed to parse JSON configuration")
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Apply `BREWCTL_*` environment overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(port) = lookup("BREWCTL_PORT") {
            self.serial.port = port;
        }
        if let Some(baud) = lookup("BREWCTL_BAUD") {
            self.serial.baud_rate = parse_var("BREWCTL_BAUD", &baud)?;
        }
        if let Some(id) = lookup("BREWCTL_SLAVE_ID") {
            self.serial.slave_id = parse_var("BREWCTL_SLAVE_ID", &id)?;
        }
        if let Some(timeout) = lookup("BREWCTL_TIMEOUT_MS") {
            self.serial.timeout_ms = parse_var("BREWCTL_TIMEOUT_MS", &timeout)?;
        }
        if let Some(bind) = lookup("BREWCTL_BIND") {
            self.http.bind = bind;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.serial.port.trim().is_empty() {
            return Err(anyhow!("serial.port must not be empty"));
        }
        if self.serial.baud_rate == 0 {
            return Err(anyhow!("serial.baud_rate must be positive"));
        }
        if self.serial.slave_id == 0 || self.serial.slave_id > 247 {
            return Err(anyhow!(
                "serial.slave_id must be 1-247, got {}",
                self.serial.slave_id
            ));
        }
        if self.serial.timeout_ms < 1000 {
            log::warn!(
                "serial.timeout_ms={} is below the usual RS-232/RS-485 turnaround",
                self.serial.timeout_ms
            );
        }
        if self.scheduler.poll_interval_ms == 0 {
            return Err(anyhow!("scheduler.poll_interval_ms must be positive"));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|err| anyhow!("Invalid value for {name} ({value:?}): {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = ControllerConfig::default();
        assert_eq!(config.serial.port, "/dev/ttyUSB0");
        assert_eq!(config.serial.baud_rate, 9600);
        assert_eq!(config.serial.slave_id, 1);
        assert_eq!(config.serial.timeout(), Duration::from_secs(2));
        assert_eq!(config.cache.info_ttl_secs, 300);
        assert_eq!(config.cache.status_ttl_secs, 30);
        assert_eq!(config.cache.health_ttl_secs, 60);
        assert!(!config.simulate);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = ControllerConfig::from_toml(
            r#"
            simulate = true

            [serial]
            port = "/dev/ttyUSB1"

            [scheduler]
            health_interval_secs = 60
            "#,
        )
        .unwrap();
        assert!(config.simulate);
        assert_eq!(config.serial.port, "/dev/ttyUSB1");
        assert_eq!(config.serial.baud_rate, 9600);
        assert_eq!(config.scheduler.health_interval_secs, 60);
        assert_eq!(config.scheduler.delivery_timeout_secs, 120);
    }

    #[test]
    fn test_env_overrides() {
        let vars = HashMap::from([
            ("BREWCTL_PORT", "COM4"),
            ("BREWCTL_BAUD", "19200"),
            ("BREWCTL_SLAVE_ID", "3"),
        ]);
        let mut config = ControllerConfig::default();
        config
            .apply_env_with(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.serial.port, "COM4");
        assert_eq!(config.serial.baud_rate, 19200);
        assert_eq!(config.serial.slave_id, 3);
        assert_eq!(config.serial.timeout_ms, 2000);
    }

    #[test]
    fn test_bad_env_value_is_reported() {
        let mut config = ControllerConfig::default();
        let err = config
            .apply_env_with(|key| (key == "BREWCTL_BAUD").then(|| "fast".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("BREWCTL_BAUD"));
    }

    #[test]
    fn test_json_round_trip_and_validation() {
        let mut config = ControllerConfig::default();
        config.serial.slave_id = 0;
        assert!(config.validate().is_err());

        config.serial.slave_id = 2;
        let json = config.to_json().unwrap();
        let parsed = ControllerConfig::from_json(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_serial_overrides() {
        let base = SerialSettings::default();
        let moved = base.with_overrides(Some("/dev/ttyS1"), None);
        assert_eq!(moved.port, "/dev/ttyS1");
        assert_eq!(moved.baud_rate, base.baud_rate);
        assert_eq!(base.with_overrides(None, Some(4800)).baud_rate, 4800);
    }
}
