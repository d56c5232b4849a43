//! The device path: newline-delimited JSON from the sensor node, and commands back to it.

use crate::errors::{Error, Result};
use crate::hub::TelemetryHub;
use crate::metrics::{COMMANDS_TOTAL, DISCARDED_LINES_TOTAL, READINGS_TOTAL};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use simulator::{SensorReading, Sensors, Site, Status, SystemHealth};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const TARE_COMMAND: &str = "TARE";
pub const CALIBRATE_COMMAND: &str = "CALIBRATE";

/// A command write that takes longer than this is abandoned
pub const COMMAND_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Why a device line did not become the current reading
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LineRejected {
    #[error("not JSON")]
    NotJson,

    #[error("missing sensors or timestamp")]
    NotTelemetry,

    #[error("malformed telemetry: {0}")]
    Malformed(String),
}

impl LineRejected {
    fn reason(&self) -> &'static str {
        match self {
            LineRejected::NotJson => "not_json",
            LineRejected::NotTelemetry => "not_telemetry",
            LineRejected::Malformed(_) => "malformed",
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DeviceRecord {
    infrastructure_id: Value,
    location: Value,
    timestamp: Value,
    status: Value,
    sensors: Value,
    system: Value,
}

/// Turn one line from the device into a reading stamped with `received_at`.
///
/// Only `sensors` and `timestamp` are load-bearing: both must be present and
/// truthy (not null, false, 0 or ""), and `sensors` must decode. Identity,
/// status and health fields of the wrong type fall back to the site defaults
/// or the derived status. The device clock is not trusted, so its timestamp is
/// replaced.
pub fn parse_device_line(
    line: &str,
    site: &Site,
    received_at: DateTime<Utc>,
) -> std::result::Result<SensorReading, LineRejected> {
    let value: Value = serde_json::from_str(line.trim()).map_err(|_| LineRejected::NotJson)?;
    if !value.is_object() {
        return Err(LineRejected::NotTelemetry);
    }

    let record: DeviceRecord =
        serde_json::from_value(value).map_err(|e| LineRejected::Malformed(e.to_string()))?;
    if !is_truthy(&record.sensors) || !is_truthy(&record.timestamp) {
        return Err(LineRejected::NotTelemetry);
    }

    let sensors: Sensors = serde_json::from_value(record.sensors)
        .map_err(|e| LineRejected::Malformed(e.to_string()))?;

    let status = record
        .status
        .as_str()
        .and_then(|s| s.parse::<Status>().ok())
        .unwrap_or_else(|| {
            Status::classify(sensors.strain, sensors.vibration, sensors.temperature)
        });

    Ok(SensorReading {
        infrastructure_id: text(record.infrastructure_id)
            .unwrap_or_else(|| site.infrastructure_id.clone()),
        location: text(record.location).unwrap_or_else(|| site.location.clone()),
        timestamp: received_at,
        status,
        sensors,
        system: system_health(&record.system),
    })
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Strings pass through, numbers are printed, anything else is absent
fn text(value: Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Health fields are advisory: each one that is not a usable number keeps its default
fn system_health(value: &Value) -> SystemHealth {
    let number = |key: &str| value.get(key).and_then(Value::as_f64).filter(|v| v.is_finite());
    let count = |key: &str| number(key).filter(|v| *v >= 0.0).map(|v| v as u64);

    let defaults = SystemHealth::default();
    SystemHealth {
        uptime: count("uptime").unwrap_or(defaults.uptime),
        free_memory: count("free_memory").unwrap_or(defaults.free_memory),
        battery_level: number("battery_level").unwrap_or(defaults.battery_level),
    }
}

/// Boot banners and other chatter worth echoing to the log
fn is_device_chatter(line: &str) -> bool {
    let lower = line.to_lowercase();
    lower.contains("setu ai") || lower.contains("sensor")
}

fn handle_line(line: &str, hub: &TelemetryHub, site: &Site) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    match parse_device_line(line, site, Utc::now()) {
        Ok(reading) => {
            debug!(
                "Sensor data: strain={}µε vibration={}Hz temp={}°C status={}",
                reading.sensors.strain,
                reading.sensors.vibration,
                reading.sensors.temperature,
                reading.status
            );
            READINGS_TOTAL.with_label_values(&["device"]).inc();
            hub.publish(reading);
        }
        Err(rejected) => {
            DISCARDED_LINES_TOTAL
                .with_label_values(&[rejected.reason()])
                .inc();
            if rejected == LineRejected::NotJson && is_device_chatter(line) {
                info!("Device: {}", line);
            } else {
                debug!("Discarded device line ({}): {}", rejected, line);
            }
        }
    }
}

/// How the device stream ended
#[derive(Debug)]
pub enum StreamEnd {
    Closed,
    Faulted(io::Error),
}

/// Read lines from an open device until it closes or errors.
///
/// The write half is handed to `commands` for the lifetime of the stream.
pub async fn stream_device<S>(
    stream: S,
    hub: &TelemetryHub,
    commands: &DeviceCommands,
    site: &Site,
) -> StreamEnd
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    commands.attach(writer).await;

    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(512);

    let end = loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break StreamEnd::Closed,
            Ok(_) => handle_line(&String::from_utf8_lossy(&buf), hub, site),
            Err(e) => break StreamEnd::Faulted(e),
        }
    };

    commands.detach().await;
    end
}

type CommandWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Write side of the device connection, shared with the HTTP handlers.
///
/// `connected` is tracked apart from the writer lock, so a stalled write never
/// holds up status queries.
#[derive(Clone, Default)]
pub struct DeviceCommands {
    writer: Arc<Mutex<Option<CommandWriter>>>,
    connected: Arc<AtomicBool>,
}

impl DeviceCommands {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn attach(&self, writer: impl AsyncWrite + Send + Unpin + 'static) {
        *self.writer.lock().await = Some(Box::new(writer));
        self.connected.store(true, Ordering::SeqCst);
    }

    /// Waits at most `COMMAND_WRITE_TIMEOUT` for an in-flight command
    pub async fn detach(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.writer.lock().await.take();
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Send `command` followed by a newline. Success means the bytes were
    /// written, not that the device acted on them.
    pub async fn send_raw(&self, command: &str) -> Result<()> {
        let result = self.write_line(command).await;
        let outcome = match &result {
            Ok(()) => "sent",
            Err(Error::DeviceNotConnected) => "not_connected",
            Err(_) => "failed",
        };
        COMMANDS_TOTAL.with_label_values(&[outcome]).inc();
        result
    }

    async fn write_line(&self, command: &str) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::DeviceNotConnected);
        }
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(Error::DeviceNotConnected)?;

        let line = format!("{}\n", command);
        let write = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        };
        match tokio::time::timeout(COMMAND_WRITE_TIMEOUT, write).await {
            Ok(result) => result.map_err(|e| {
                warn!("Failed to write command to device: {}", e);
                Error::Io(e)
            }),
            Err(_) => {
                warn!("Device did not accept {:?} within {:?}", command, COMMAND_WRITE_TIMEOUT);
                Err(Error::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "device write timed out",
                )))
            }
        }
    }

    /// Zero the strain gauge
    pub async fn tare(&self) -> Result<()> {
        self.send_raw(TARE_COMMAND).await
    }

    /// Enter calibration mode, or set the known calibration weight
    pub async fn calibrate(&self, weight: Option<f64>) -> Result<()> {
        self.send_raw(&calibration_command(weight)).await
    }
}

pub fn calibration_command(weight: Option<f64>) -> String {
    match weight {
        Some(w) if w != 0.0 => format!("WEIGHT:{}", w),
        _ => CALIBRATE_COMMAND.to_string(),
    }
}
