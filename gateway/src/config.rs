use crate::discovery::{DEFAULT_FALLBACK_PORTS, DEFAULT_VENDOR_HINTS};
use simulator::telemetry::{DEFAULT_INFRASTRUCTURE_ID, DEFAULT_LOCATION};
use simulator::Site;
use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

const DEFAULT_CORS_ORIGINS: &[&str] = &[
    "http://localhost:8080",
    "http://localhost:8081",
    "http://localhost:3000",
];

/// Gateway settings, read from the environment
#[derive(Debug, Clone)]
pub struct Config {
    pub http_addr: String,
    pub ws_addr: String,
    /// Skips port discovery when set
    pub serial_port: Option<String>,
    pub baud_rate: u32,
    pub sim_interval: Duration,
    pub site: Site,
    pub vendor_hints: Vec<String>,
    pub fallback_ports: Vec<String>,
    pub cors_origins: Vec<String>,
    pub broadcast_capacity: usize,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let string = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let list = |key: &str, default: &[&str]| match lookup(key) {
            Some(value) => split_list(&value),
            None => default.iter().map(|s| s.to_string()).collect(),
        };

        let sim_interval_ms: u64 = parse_or(&lookup, "SIM_INTERVAL_MS", 2000);
        let broadcast_capacity: usize = parse_or(&lookup, "BROADCAST_CAPACITY", 64);

        Self {
            http_addr: string("HTTP_ADDR", "0.0.0.0:3001"),
            ws_addr: string("WS_ADDR", "0.0.0.0:8080"),
            serial_port: lookup("SERIAL_PORT").filter(|p| !p.trim().is_empty()),
            baud_rate: parse_or(&lookup, "SERIAL_BAUD", 115200),
            sim_interval: Duration::from_millis(sim_interval_ms.max(1)),
            site: Site::new(
                string("INFRASTRUCTURE_ID", DEFAULT_INFRASTRUCTURE_ID),
                string("LOCATION", DEFAULT_LOCATION),
            ),
            vendor_hints: list("VENDOR_HINTS", DEFAULT_VENDOR_HINTS),
            fallback_ports: list("FALLBACK_PORTS", DEFAULT_FALLBACK_PORTS),
            cors_origins: list("CORS_ORIGINS", DEFAULT_CORS_ORIGINS),
            broadcast_capacity: broadcast_capacity.max(1),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + Display,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|e| {
            warn!("Invalid {}={:?} ({}), using {}", key, raw, e, default);
            default
        }),
        None => default,
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_with(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.http_addr, "0.0.0.0:3001");
        assert_eq!(config.ws_addr, "0.0.0.0:8080");
        assert_eq!(config.serial_port, None);
        assert_eq!(config.baud_rate, 115200);
        assert_eq!(config.sim_interval, Duration::from_millis(2000));
        assert_eq!(config.site, Site::default());
        assert_eq!(config.vendor_hints.len(), 4);
        assert_eq!(config.fallback_ports.first().map(String::as_str), Some("COM3"));
        assert_eq!(config.cors_origins.len(), 3);
    }

    #[test]
    fn test_overrides() {
        let config = config_with(&[
            ("SERIAL_PORT", "/dev/ttyACM0"),
            ("SERIAL_BAUD", "9600"),
            ("SIM_INTERVAL_MS", "250"),
            ("LOCATION", "Signature Bridge"),
            ("VENDOR_HINTS", "wch, raspberry pi ,"),
        ]);
        assert_eq!(config.serial_port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.sim_interval, Duration::from_millis(250));
        assert_eq!(config.site.location, "Signature Bridge");
        assert_eq!(config.vendor_hints, vec!["wch", "raspberry pi"]);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = config_with(&[
            ("SERIAL_BAUD", "fast"),
            ("SIM_INTERVAL_MS", "0"),
            ("BROADCAST_CAPACITY", "0"),
            ("SERIAL_PORT", "  "),
        ]);
        assert_eq!(config.baud_rate, 115200);
        assert_eq!(config.sim_interval, Duration::from_millis(1));
        assert_eq!(config.broadcast_capacity, 1);
        assert_eq!(config.serial_port, None);
    }
}
