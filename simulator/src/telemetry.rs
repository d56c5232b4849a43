use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const STRAIN_CRITICAL: f64 = 2000.0;
pub const VIBRATION_CRITICAL: f64 = 10.0;
pub const TEMPERATURE_CRITICAL: f64 = 60.0;
pub const STRAIN_WARNING: f64 = 1000.0;
pub const VIBRATION_WARNING: f64 = 5.0;
pub const TEMPERATURE_WARNING: f64 = 45.0;

pub const DEFAULT_INFRASTRUCTURE_ID: &str = "BRIDGE_001";
pub const DEFAULT_LOCATION: &str = "Delhi Metro Bridge";

/// Structural health classification of a reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Normal,
    Warning,
    Critical,
}

impl Status {
    /// Classify raw sensor values. Critical thresholds win over warning ones.
    pub fn classify(strain: f64, vibration: f64, temperature: f64) -> Self {
        if strain > STRAIN_CRITICAL
            || vibration > VIBRATION_CRITICAL
            || temperature > TEMPERATURE_CRITICAL
        {
            Status::Critical
        } else if strain > STRAIN_WARNING
            || vibration > VIBRATION_WARNING
            || temperature > TEMPERATURE_WARNING
        {
            Status::Warning
        } else {
            Status::Normal
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Normal => "normal",
            Status::Warning => "warning",
            Status::Critical => "critical",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "normal" => Ok(Status::Normal),
            "warning" => Ok(Status::Warning),
            "critical" => Ok(Status::Critical),
            other => Err(format!("unknown status '{}'", other)),
        }
    }
}

/// The monitored structure a reading belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Site {
    pub infrastructure_id: String,
    pub location: String,
}

impl Site {
    pub fn new(infrastructure_id: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            infrastructure_id: infrastructure_id.into(),
            location: location.into(),
        }
    }

    /// Same structure, labelled as synthetic data
    pub fn simulated(&self) -> Self {
        Self {
            infrastructure_id: self.infrastructure_id.clone(),
            location: format!("{} (Simulated)", self.location),
        }
    }
}

impl Default for Site {
    fn default() -> Self {
        Self::new(DEFAULT_INFRASTRUCTURE_ID, DEFAULT_LOCATION)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Accelerometer {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub z: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Sensors {
    /// Micro-strain
    pub strain: f64,
    /// Hz
    pub vibration: f64,
    /// Degrees Celsius
    pub temperature: f64,
    pub accelerometer: Accelerometer,
}

/// Device health, advisory only
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemHealth {
    pub uptime: u64,
    pub free_memory: u64,
    pub battery_level: f64,
}

/// One complete snapshot of a structure's sensors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub infrastructure_id: String,
    pub location: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub status: Status,
    pub sensors: Sensors,
    pub system: SystemHealth,
}

impl SensorReading {
    /// The reading served before any device line or simulator tick arrives
    pub fn baseline(site: &Site, timestamp: DateTime<Utc>) -> Self {
        Self {
            infrastructure_id: site.infrastructure_id.clone(),
            location: site.location.clone(),
            timestamp,
            status: Status::Normal,
            sensors: Sensors {
                strain: 800.0,
                vibration: 1.2,
                temperature: 25.0,
                accelerometer: Accelerometer::default(),
            },
            system: SystemHealth {
                uptime: 0,
                free_memory: 1500,
                battery_level: 95.0,
            },
        }
    }

    pub fn derived_status(&self) -> Status {
        Status::classify(
            self.sensors.strain,
            self.sensors.vibration,
            self.sensors.temperature,
        )
    }
}
