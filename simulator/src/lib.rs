//! Bridge sensor telemetry model and synthetic waveform generation.
//!
//! Shared by the gateway (which falls back to synthetic data when no device is
//! attached) and the `simulator` binary, which emulates the sensor node's
//! firmware on a serial port or stdout.

pub mod synth;
pub mod telemetry;

pub use synth::{round_to, synthesize};
pub use telemetry::{Accelerometer, SensorReading, Sensors, Site, Status, SystemHealth};
