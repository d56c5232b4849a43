use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Body of `POST /api/arduino/command`
#[derive(Debug, Clone, Deserialize)]
pub struct CommandRequest {
    pub command: String,
}

/// Body of `POST /api/arduino/calibrate`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CalibrateRequest {
    #[serde(default)]
    pub weight: Option<f64>,
}

/// Outcome of a device command. "Not connected" is a normal response, not an HTTP error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResponse {
    pub fn sent(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            error: None,
        }
    }

    pub fn failed(error: impl ToString) -> Self {
        Self {
            success: false,
            message: None,
            error: Some(error.to_string()),
        }
    }
}

/// A point of the placeholder history series
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryPoint {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub strain: f64,
    pub vibration: f64,
    pub temperature: f64,
}

/// `GET /api/status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub server: String,
    pub arduino_connected: bool,
    pub source_state: String,
    pub websocket_clients: usize,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_data_update: DateTime<Utc>,
    /// Seconds since the gateway started
    pub uptime: f64,
}
