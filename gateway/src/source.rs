//! Telemetry source selection.
//!
//! Runs once per process: discover a port, try to open it, stream from the
//! device until it goes away, then simulate for the rest of the process
//! lifetime. A returning device is not picked up again.

use crate::config::Config;
use crate::device::{stream_device, DeviceCommands, StreamEnd};
use crate::discovery::{describe, select_port, DeviceClassifier, PortInfo};
use crate::errors::Result;
use crate::hub::TelemetryHub;
use crate::metrics::{DEVICE_FAULTS_TOTAL, READINGS_TOTAL, SOURCE_STATE};
use async_trait::async_trait;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use simulator::{synthesize, Site};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio_serial::SerialPortBuilderExt;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Discovering,
    Connecting,
    DeviceStreaming,
    Simulating,
}

impl SourceState {
    pub fn can_transition_to(self, next: SourceState) -> bool {
        use SourceState::*;
        matches!(
            (self, next),
            (Discovering, Connecting)
                | (Discovering, Simulating)
                | (Connecting, DeviceStreaming)
                | (Connecting, Simulating)
                | (DeviceStreaming, Simulating)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceState::Discovering => "discovering",
            SourceState::Connecting => "connecting",
            SourceState::DeviceStreaming => "device_streaming",
            SourceState::Simulating => "simulating",
        }
    }

    fn gauge_value(&self) -> i64 {
        match self {
            SourceState::Discovering => 0,
            SourceState::Connecting => 1,
            SourceState::DeviceStreaming => 2,
            SourceState::Simulating => 3,
        }
    }
}

impl fmt::Display for SourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A byte stream to an opened device
pub trait DeviceStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> DeviceStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// OS access to serial devices
#[async_trait]
pub trait PortBackend: Send + Sync {
    async fn list_ports(&self) -> Result<Vec<PortInfo>>;

    async fn open(&self, path: &str, baud_rate: u32) -> Result<Box<dyn DeviceStream>>;
}

/// Real serial ports via tokio-serial
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialBackend;

#[async_trait]
impl PortBackend for SerialBackend {
    async fn list_ports(&self) -> Result<Vec<PortInfo>> {
        // Enumeration walks sysfs or the registry
        let ports = tokio::task::spawn_blocking(tokio_serial::available_ports).await??;
        Ok(ports.into_iter().map(PortInfo::from).collect())
    }

    async fn open(&self, path: &str, baud_rate: u32) -> Result<Box<dyn DeviceStream>> {
        let stream = tokio_serial::new(path, baud_rate).open_native_async()?;
        Ok(Box::new(stream))
    }
}

#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// Skips discovery when set
    pub port_override: Option<String>,
    pub baud_rate: u32,
    pub sim_interval: Duration,
    pub site: Site,
}

impl From<&Config> for SourceConfig {
    fn from(config: &Config) -> Self {
        Self {
            port_override: config.serial_port.clone(),
            baud_rate: config.baud_rate,
            sim_interval: config.sim_interval,
            site: config.site.clone(),
        }
    }
}

pub struct TelemetrySource<B> {
    backend: B,
    classifier: Box<dyn DeviceClassifier>,
    config: SourceConfig,
    hub: Arc<TelemetryHub>,
    commands: DeviceCommands,
    state: watch::Sender<SourceState>,
}

impl<B: PortBackend> TelemetrySource<B> {
    pub fn new(
        backend: B,
        classifier: Box<dyn DeviceClassifier>,
        config: SourceConfig,
        hub: Arc<TelemetryHub>,
        commands: DeviceCommands,
    ) -> Self {
        let (state, _) = watch::channel(SourceState::Discovering);
        SOURCE_STATE.set(SourceState::Discovering.gauge_value());
        Self {
            backend,
            classifier,
            config,
            hub,
            commands,
            state,
        }
    }

    pub fn state(&self) -> watch::Receiver<SourceState> {
        self.state.subscribe()
    }

    fn transition(&self, next: SourceState) {
        let current = *self.state.borrow();
        if !current.can_transition_to(next) {
            warn!("Ignoring source transition {} -> {}", current, next);
            return;
        }
        info!("Telemetry source: {} -> {}", current, next);
        SOURCE_STATE.set(next.gauge_value());
        self.state.send_replace(next);
    }

    /// Drive the source for the rest of the process. Never returns.
    pub async fn run(self) {
        let Some(path) = self.discover().await else {
            info!("No Arduino found, using simulated data");
            self.transition(SourceState::Simulating);
            return self.simulate().await;
        };

        self.transition(SourceState::Connecting);
        match self.backend.open(&path, self.config.baud_rate).await {
            Ok(stream) => {
                info!("Connected to Arduino on {}", path);
                self.transition(SourceState::DeviceStreaming);

                let end = stream_device(stream, &self.hub, &self.commands, &self.config.site).await;
                DEVICE_FAULTS_TOTAL.inc();
                match end {
                    StreamEnd::Closed => warn!("Serial connection closed, switching to simulation"),
                    StreamEnd::Faulted(e) => {
                        error!("Serial port error: {}, switching to simulation", e)
                    }
                }
            }
            Err(e) => {
                error!("Error opening serial port {}: {}", path, e);
                info!("Falling back to simulated data");
            }
        }

        self.transition(SourceState::Simulating);
        self.simulate().await
    }

    async fn discover(&self) -> Option<String> {
        if let Some(path) = &self.config.port_override {
            info!("Using configured serial port {}", path);
            return Some(path.clone());
        }

        let ports = match self.backend.list_ports().await {
            Ok(ports) => ports,
            Err(e) => {
                error!("Error listing ports: {}", e);
                Vec::new()
            }
        };
        info!("Available ports: {:?}", describe(&ports));

        let selected = select_port(&ports, self.classifier.as_ref());
        if let Some(path) = &selected {
            info!("Selected serial port {}", path);
        }
        selected
    }

    async fn simulate(&self) {
        run_simulation(&self.hub, &self.config.site, self.config.sim_interval).await
    }
}

/// Publish a synthetic reading every `period`, forever
pub async fn run_simulation(hub: &TelemetryHub, site: &Site, period: Duration) {
    info!("Starting simulation mode, one reading every {:?}", period);

    let site = site.simulated();
    let mut rng = StdRng::from_entropy();
    let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));

    loop {
        ticker.tick().await;
        let reading = synthesize(Utc::now(), &mut rng, &site);
        READINGS_TOTAL.with_label_values(&["simulator"]).inc();
        hub.publish(reading);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::VendorHints;
    use crate::errors::Error;
    use crate::hub::Subscription;
    use simulator::SensorReading;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncWriteExt, DuplexStream, ReadBuf};
    use tokio::sync::Mutex;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    struct FakeBackend {
        ports: Option<Vec<PortInfo>>,
        device: Mutex<Option<Box<dyn DeviceStream>>>,
        opened: Mutex<Vec<String>>,
    }

    impl FakeBackend {
        fn new(ports: Option<Vec<PortInfo>>, device: Option<DuplexStream>) -> Self {
            Self::with_device(ports, device.map(|d| Box::new(d) as Box<dyn DeviceStream>))
        }

        fn with_device(
            ports: Option<Vec<PortInfo>>,
            device: Option<Box<dyn DeviceStream>>,
        ) -> Self {
            Self {
                ports,
                device: Mutex::new(device),
                opened: Mutex::new(Vec::new()),
            }
        }
    }

    /// Delivers one line, then fails every read like an unplugged adapter
    struct FaultyDevice {
        line: Option<&'static [u8]>,
    }

    impl AsyncRead for FaultyDevice {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            match self.line.take() {
                Some(line) => {
                    buf.put_slice(line);
                    Poll::Ready(Ok(()))
                }
                None => Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "cable pulled"))),
            }
        }
    }

    impl AsyncWrite for FaultyDevice {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[async_trait]
    impl PortBackend for Arc<FakeBackend> {
        async fn list_ports(&self) -> Result<Vec<PortInfo>> {
            self.ports.clone().ok_or_else(|| {
                Error::Io(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no udev"))
            })
        }

        async fn open(&self, path: &str, _baud_rate: u32) -> Result<Box<dyn DeviceStream>> {
            self.opened.lock().await.push(path.to_string());
            match self.device.lock().await.take() {
                Some(stream) => Ok(stream),
                None => Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "port in use",
                ))),
            }
        }
    }

    fn config(port_override: Option<&str>) -> SourceConfig {
        SourceConfig {
            port_override: port_override.map(str::to_string),
            baud_rate: 115200,
            sim_interval: Duration::from_millis(20),
            site: Site::default(),
        }
    }

    fn source(
        backend: Arc<FakeBackend>,
        config: SourceConfig,
    ) -> (TelemetrySource<Arc<FakeBackend>>, Arc<TelemetryHub>, DeviceCommands) {
        let hub = Arc::new(TelemetryHub::new(
            SensorReading::baseline(&Site::default(), Utc::now()),
            64,
        ));
        let commands = DeviceCommands::new();
        let source = TelemetrySource::new(
            backend,
            Box::new(VendorHints::default()),
            config,
            hub.clone(),
            commands.clone(),
        );
        (source, hub, commands)
    }

    async fn wait_for_state(state: &mut watch::Receiver<SourceState>, want: SourceState) {
        timeout(WAIT, state.wait_for(|s| *s == want))
            .await
            .expect("timed out waiting for state")
            .expect("source dropped");
    }

    async fn next_simulated(updates: &mut Subscription) -> Arc<SensorReading> {
        timeout(WAIT, async {
            loop {
                let reading = updates.recv().await.expect("hub closed");
                if reading.location.ends_with("(Simulated)") {
                    return reading;
                }
            }
        })
        .await
        .expect("no simulated reading")
    }

    #[test]
    fn test_transition_table() {
        use SourceState::*;
        assert!(Discovering.can_transition_to(Connecting));
        assert!(Discovering.can_transition_to(Simulating));
        assert!(Connecting.can_transition_to(DeviceStreaming));
        assert!(Connecting.can_transition_to(Simulating));
        assert!(DeviceStreaming.can_transition_to(Simulating));

        assert!(!Simulating.can_transition_to(DeviceStreaming));
        assert!(!Simulating.can_transition_to(Connecting));
        assert!(!Simulating.can_transition_to(Discovering));
        assert!(!DeviceStreaming.can_transition_to(Connecting));
        assert!(!Discovering.can_transition_to(DeviceStreaming));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_serial_enumeration_leaves_runtime_responsive() {
        let ticker = tokio::spawn(async {
            tokio::time::sleep(Duration::from_millis(1)).await;
        });
        // Hosts without serial ports or udev may report an error; either is fine here
        let _ = timeout(WAIT, SerialBackend.list_ports())
            .await
            .expect("enumeration hung");
        timeout(WAIT, ticker).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_no_device_simulates() {
        let backend = Arc::new(FakeBackend::new(
            Some(vec![PortInfo::new("/dev/ttyS0", None)]),
            None,
        ));
        let (source, hub, commands) = source(backend.clone(), config(None));
        let mut state = source.state();
        let mut updates = hub.subscribe();
        tokio::spawn(source.run());

        wait_for_state(&mut state, SourceState::Simulating).await;
        let first = next_simulated(&mut updates).await;
        let second = next_simulated(&mut updates).await;

        assert!(second.timestamp > first.timestamp);
        assert!(backend.opened.lock().await.is_empty());
        assert!(commands.send_raw("PING").await.is_err());
    }

    #[tokio::test]
    async fn test_enumeration_failure_simulates() {
        let backend = Arc::new(FakeBackend::new(None, None));
        let (source, hub, _) = source(backend, config(None));
        let mut state = source.state();
        let mut updates = hub.subscribe();
        tokio::spawn(source.run());

        wait_for_state(&mut state, SourceState::Simulating).await;
        next_simulated(&mut updates).await;
    }

    #[tokio::test]
    async fn test_open_failure_simulates_without_rediscovery() {
        let backend = Arc::new(FakeBackend::new(
            Some(vec![PortInfo::new("/dev/ttyACM0", Some("Arduino LLC"))]),
            None,
        ));
        let (source, hub, _) = source(backend.clone(), config(None));
        let mut state = source.state();
        let mut updates = hub.subscribe();
        tokio::spawn(source.run());

        wait_for_state(&mut state, SourceState::Simulating).await;
        next_simulated(&mut updates).await;
        next_simulated(&mut updates).await;

        assert_eq!(*backend.opened.lock().await, vec!["/dev/ttyACM0".to_string()]);
    }

    #[tokio::test]
    async fn test_port_override_skips_discovery() {
        let (mut device, gateway_side) = tokio::io::duplex(1024);
        let backend = Arc::new(FakeBackend::new(None, Some(gateway_side)));
        let (source, hub, _) = source(backend.clone(), config(Some("/dev/ttyUSB3")));
        let mut state = source.state();
        let mut updates = hub.subscribe();
        tokio::spawn(source.run());

        wait_for_state(&mut state, SourceState::DeviceStreaming).await;
        assert_eq!(*backend.opened.lock().await, vec!["/dev/ttyUSB3".to_string()]);

        device
            .write_all(b"{\"sensors\":{\"strain\":42},\"timestamp\":1}\n")
            .await
            .unwrap();
        updates.recv().await.unwrap();
        let reading = timeout(WAIT, updates.recv()).await.unwrap().unwrap();
        assert_eq!(reading.sensors.strain, 42.0);
    }

    #[tokio::test]
    async fn test_device_then_fault_falls_back_to_simulation() {
        let (mut device, gateway_side) = tokio::io::duplex(1024);
        let backend = Arc::new(FakeBackend::new(
            Some(vec![
                PortInfo::new("/dev/ttyS0", None),
                PortInfo::new("/dev/ttyUSB0", Some("FTDI")),
            ]),
            Some(gateway_side),
        ));
        let (source, hub, commands) = source(backend.clone(), config(None));
        let mut state = source.state();
        let mut updates = hub.subscribe();
        tokio::spawn(source.run());

        wait_for_state(&mut state, SourceState::DeviceStreaming).await;
        updates.recv().await.unwrap();

        device
            .write_all(b"not json\n{\"foo\":1}\n{\"sensors\":{\"strain\":10},\"timestamp\":123}\n")
            .await
            .unwrap();
        let reading = timeout(WAIT, updates.recv()).await.unwrap().unwrap();
        assert_eq!(reading.sensors.strain, 10.0);
        assert_ne!(reading.timestamp.timestamp_millis(), 123);
        assert_eq!(reading.location, "Delhi Metro Bridge");
        assert!(commands.is_connected());

        drop(device);

        wait_for_state(&mut state, SourceState::Simulating).await;
        let first = next_simulated(&mut updates).await;
        let second = next_simulated(&mut updates).await;
        assert!(second.timestamp > first.timestamp);
        assert!(!commands.is_connected());
        assert_eq!(*backend.opened.lock().await, vec!["/dev/ttyUSB0".to_string()]);
    }

    #[tokio::test]
    async fn test_read_error_falls_back_to_simulation() {
        let device = FaultyDevice {
            line: Some(b"{\"sensors\":{\"strain\":42},\"timestamp\":9}\n"),
        };
        let backend = Arc::new(FakeBackend::with_device(
            Some(vec![PortInfo::new("/dev/ttyACM0", Some("Arduino LLC"))]),
            Some(Box::new(device)),
        ));
        let (source, hub, commands) = source(backend.clone(), config(None));
        let mut state = source.state();
        let mut updates = hub.subscribe();
        updates.recv().await.unwrap();
        tokio::spawn(source.run());

        wait_for_state(&mut state, SourceState::Simulating).await;

        // The line read before the fault came from the device path
        let from_device = timeout(WAIT, updates.recv()).await.unwrap().unwrap();
        assert_eq!(from_device.sensors.strain, 42.0);
        assert!(!from_device.location.ends_with("(Simulated)"));

        let first = next_simulated(&mut updates).await;
        let second = next_simulated(&mut updates).await;
        assert!(second.timestamp > first.timestamp);
        assert!(!commands.is_connected());
        assert_eq!(*backend.opened.lock().await, vec!["/dev/ttyACM0".to_string()]);
    }
}
