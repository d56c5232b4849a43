//! Serial port discovery.
//!
//! Picks the port most likely to be the sensor node's microcontroller. The
//! heuristic is a [`DeviceClassifier`] so it can be swapped per platform without
//! touching the source state machine.

use tokio_serial::{SerialPortInfo, SerialPortType};

/// Manufacturer substrings of common microcontroller boards and USB-serial bridges
pub const DEFAULT_VENDOR_HINTS: &[&str] = &["arduino", "ch340", "ftdi", "silicon labs"];

/// Conventional Windows port names tried when no manufacturer matches
pub const DEFAULT_FALLBACK_PORTS: &[&str] = &["COM3", "COM4", "COM5", "COM6", "COM7", "COM8"];

/// A serial device as reported by the OS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub path: String,
    pub manufacturer: Option<String>,
}

impl PortInfo {
    pub fn new(path: impl Into<String>, manufacturer: Option<&str>) -> Self {
        Self {
            path: path.into(),
            manufacturer: manufacturer.map(str::to_string),
        }
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let manufacturer = match info.port_type {
            SerialPortType::UsbPort(usb) => usb.manufacturer,
            _ => None,
        };
        Self {
            path: info.port_name,
            manufacturer,
        }
    }
}

/// Decides which enumerated port looks like the sensor node
pub trait DeviceClassifier: Send + Sync {
    fn is_microcontroller(&self, port: &PortInfo) -> bool;

    /// Port names to try, in order, when no port is classified as a microcontroller
    fn fallback_paths(&self) -> &[String];
}

/// Matches on the USB manufacturer string, case-insensitively
#[derive(Debug, Clone)]
pub struct VendorHints {
    hints: Vec<String>,
    fallback: Vec<String>,
}

impl VendorHints {
    pub fn new(hints: Vec<String>, fallback: Vec<String>) -> Self {
        Self {
            hints: hints.into_iter().map(|h| h.to_lowercase()).collect(),
            fallback,
        }
    }
}

impl Default for VendorHints {
    fn default() -> Self {
        Self::new(
            DEFAULT_VENDOR_HINTS.iter().map(|s| s.to_string()).collect(),
            DEFAULT_FALLBACK_PORTS.iter().map(|s| s.to_string()).collect(),
        )
    }
}

impl DeviceClassifier for VendorHints {
    fn is_microcontroller(&self, port: &PortInfo) -> bool {
        let Some(manufacturer) = &port.manufacturer else {
            return false;
        };
        let manufacturer = manufacturer.to_lowercase();
        self.hints.iter().any(|hint| manufacturer.contains(hint.as_str()))
    }

    fn fallback_paths(&self) -> &[String] {
        &self.fallback
    }
}

/// First classified port in enumeration order, else the first fallback name that exists
pub fn select_port(ports: &[PortInfo], classifier: &dyn DeviceClassifier) -> Option<String> {
    if let Some(port) = ports.iter().find(|p| classifier.is_microcontroller(p)) {
        return Some(port.path.clone());
    }

    classifier
        .fallback_paths()
        .iter()
        .find(|path| ports.iter().any(|p| &p.path == *path))
        .cloned()
}

/// `path - manufacturer` pairs for logging
pub fn describe(ports: &[PortInfo]) -> Vec<String> {
    ports
        .iter()
        .map(|p| format!("{} - {}", p.path, p.manufacturer.as_deref().unwrap_or("Unknown")))
        .collect()
}
