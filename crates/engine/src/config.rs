//! Process configuration: a TOML file on disk with environment-variable
//! overrides layered on top, read once at startup.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

fn default_total_valves() -> u8 {
    8
}

fn default_total_sensors() -> u8 {
    8
}

fn default_relay_vendor_id() -> u16 {
    0x16C0
}

fn default_relay_product_id() -> u16 {
    0x05DF
}

fn default_sensor_serial_port_prefix() -> String {
    "/dev/ttyUSB".to_string()
}

fn default_simulation_mode() -> bool {
    true
}

fn default_diagnostics_bind_addr() -> String {
    "127.0.0.1:8787".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server_url: String,
    pub family_code: String,
    #[serde(default = "default_total_valves")]
    pub total_valves: u8,
    #[serde(default = "default_total_sensors")]
    pub total_sensors: u8,
    #[serde(default = "default_relay_vendor_id")]
    pub relay_vendor_id: u16,
    #[serde(default = "default_relay_product_id")]
    pub relay_product_id: u16,
    #[serde(default = "default_sensor_serial_port_prefix")]
    pub sensor_serial_port_prefix: String,
    #[serde(default = "default_simulation_mode")]
    pub simulation_mode: bool,
    #[serde(default = "default_diagnostics_bind_addr")]
    pub diagnostics_bind_addr: String,
}

impl Config {
    /// Load from a TOML file, then apply any of the documented environment
    /// variable overrides on top.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::parse(&raw)
    }

    /// Parse TOML text directly and apply environment overrides. Split out
    /// from `load` so config tests don't need to touch the filesystem.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(raw).context("parsing config")?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(v) = std::env::var("SERVER_URL") {
            self.server_url = v;
        }
        if let Ok(v) = std::env::var("FAMILY_CODE") {
            self.family_code = v;
        }
        if let Ok(v) = std::env::var("TOTAL_VALVES") {
            self.total_valves = v.parse().context("TOTAL_VALVES must be an integer")?;
        }
        if let Ok(v) = std::env::var("TOTAL_SENSORS") {
            self.total_sensors = v.parse().context("TOTAL_SENSORS must be an integer")?;
        }
        if let Ok(v) = std::env::var("RELAY_VENDOR_ID") {
            self.relay_vendor_id = parse_maybe_hex(&v).context("RELAY_VENDOR_ID must be an integer")?;
        }
        if let Ok(v) = std::env::var("RELAY_PRODUCT_ID") {
            self.relay_product_id = parse_maybe_hex(&v).context("RELAY_PRODUCT_ID must be an integer")?;
        }
        if let Ok(v) = std::env::var("SENSOR_SERIAL_PORT_PREFIX") {
            self.sensor_serial_port_prefix = v;
        }
        if let Ok(v) = std::env::var("SIMULATION_MODE") {
            self.simulation_mode = matches!(v.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        Ok(())
    }

    /// The N sensor ports this config implies: `{prefix}0 .. {prefix}{n-1}`.
    pub fn sensor_ports(&self) -> Vec<String> {
        (0..self.total_sensors)
            .map(|i| format!("{}{}", self.sensor_serial_port_prefix, i))
            .collect()
    }
}

fn parse_maybe_hex(raw: &str) -> std::result::Result<u16, std::num::ParseIntError> {
    match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => raw.parse(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_applies_defaults_for_missing_optional_fields() {
        let config = Config::parse(
            r#"
            server_url = "wss://example.test"
            family_code = "ABC123"
            "#,
        )
        .unwrap();
        assert_eq!(config.total_valves, 8);
        assert_eq!(config.total_sensors, 8);
        assert!(config.simulation_mode);
    }

    #[test]
    fn sensor_ports_enumerates_prefix_plus_index() {
        let config = Config::parse(
            r#"
            server_url = "wss://example.test"
            family_code = "ABC123"
            total_sensors = 3
            sensor_serial_port_prefix = "/dev/ttyUSB"
            "#,
        )
        .unwrap();
        assert_eq!(
            config.sensor_ports(),
            vec!["/dev/ttyUSB0", "/dev/ttyUSB1", "/dev/ttyUSB2"]
        );
    }

    #[test]
    fn parse_rejects_missing_required_fields() {
        assert!(Config::parse("total_valves = 4").is_err());
    }

    #[test]
    fn parse_maybe_hex_accepts_0x_prefixed_and_decimal() {
        assert_eq!(parse_maybe_hex("0x16C0").unwrap(), 0x16C0);
        assert_eq!(parse_maybe_hex("5824").unwrap(), 5824);
    }
}
