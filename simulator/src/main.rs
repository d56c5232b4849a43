use chrono::{DateTime, Utc};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use simulator::{synthesize, SensorReading, Site};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_serial::SerialPortBuilderExt;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Lines the firmware prints before it starts streaming JSON
const BOOT_BANNER: &[&str] = &[
    "Setu AI bridge sensor node",
    "Initializing HX711 strain sensor...",
    "MPU6050 accelerometer ready",
];

/// Emulates a Setu sensor node: line-delimited JSON readings on a serial port or stdout
#[derive(Debug, Parser)]
#[command(name = "simulator", version)]
struct Args {
    /// Milliseconds between readings
    #[arg(long, env = "RATE_MS", default_value_t = 1000)]
    rate_ms: u64,

    /// Serial port to write to; stdout when absent
    #[arg(long, env = "SERIAL_PORT")]
    port: Option<String>,

    #[arg(long, env = "SERIAL_BAUD", default_value_t = 115200)]
    baud: u32,

    #[arg(long = "id", env = "INFRASTRUCTURE_ID", default_value = "BRIDGE_001")]
    infrastructure_id: String,

    #[arg(long, env = "LOCATION", default_value = "Delhi Metro Bridge")]
    location: String,

    /// Print the firmware boot banner before streaming
    #[arg(long)]
    banner: bool,

    /// Stop after this many readings
    #[arg(long)]
    count: Option<u64>,
}

type Reader = Box<dyn AsyncRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // stdout carries the data stream, so logs go to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting sensor node emulator");
    info!(
        "Site: {} ({}), Rate: every {} ms, Output: {}",
        args.infrastructure_id,
        args.location,
        args.rate_ms,
        args.port.as_deref().unwrap_or("stdout")
    );

    let (reader, writer): (Reader, Writer) = match &args.port {
        Some(port) => match tokio_serial::new(port, args.baud).open_native_async() {
            Ok(stream) => {
                let (reader, writer) = tokio::io::split(stream);
                let reader: Reader = Box::new(reader);
                let writer: Writer = Box::new(writer);
                (reader, writer)
            }
            Err(e) => {
                error!("Failed to open serial port {}: {}", port, e);
                std::process::exit(1);
            }
        },
        None => {
            let reader: Reader = Box::new(tokio::io::stdin());
            let writer: Writer = Box::new(tokio::io::stdout());
            (reader, writer)
        }
    };

    tokio::spawn(log_commands(reader));

    if let Err(e) = run(writer, &args).await {
        error!("Emulator stopped: {}", e);
        std::process::exit(1);
    }
}

async fn run(mut out: impl AsyncWrite + Unpin, args: &Args) -> std::io::Result<()> {
    if args.banner {
        for line in BOOT_BANNER {
            out.write_all(format!("{}\n", line).as_bytes()).await?;
        }
        out.flush().await?;
    }

    let site = Site::new(args.infrastructure_id.clone(), args.location.clone());
    let boot = Instant::now();
    let mut rng = StdRng::from_entropy();
    let mut ticker = tokio::time::interval(Duration::from_millis(args.rate_ms.max(1)));
    let mut sent = 0u64;

    loop {
        ticker.tick().await;

        let reading = device_frame(&mut rng, &site, boot.elapsed());
        let mut line = serde_json::to_string(&reading)?;
        line.push('\n');

        out.write_all(line.as_bytes()).await?;
        out.flush().await?;
        sent += 1;

        if args.count.is_some_and(|limit| sent >= limit) {
            info!("Emitted {} readings, stopping", sent);
            return Ok(());
        }
        if sent % 100 == 0 {
            info!("Emitted {} readings", sent);
        }
    }
}

/// A synthetic reading stamped the way the firmware stamps it: milliseconds since boot.
///
/// The gateway treats a zero timestamp as missing, so the first frame reads 1.
fn device_frame(rng: &mut impl Rng, site: &Site, uptime: Duration) -> SensorReading {
    let mut reading = synthesize(Utc::now(), rng, site);
    let millis = (uptime.as_millis() as i64).max(1);
    reading.timestamp = DateTime::from_timestamp_millis(millis).unwrap_or_default();
    reading.system.uptime = uptime.as_secs();
    reading
}

async fn log_commands(reader: Reader) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match line.trim() {
                "" => {}
                "TARE" => info!("Tare requested, zeroing strain gauge"),
                "CALIBRATE" => info!("Calibration mode activated"),
                cmd if cmd.starts_with("WEIGHT:") => {
                    info!("Calibration weight set: {}", &cmd["WEIGHT:".len()..])
                }
                other => info!("Command received: {}", other),
            },
            Ok(None) => break,
            Err(e) => {
                warn!("Command input closed: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["simulator", "--rate-ms", "1"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[tokio::test]
    async fn test_emits_requested_readings() {
        let mut out = Vec::new();
        run(&mut out, &args(&["--count", "3", "--id", "BRIDGE_007"]))
            .await
            .unwrap();

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);

        for line in lines {
            let reading: SensorReading = serde_json::from_str(line).unwrap();
            assert_eq!(reading.infrastructure_id, "BRIDGE_007");
            assert!(reading.sensors.strain >= 0.0);
        }
    }

    #[tokio::test]
    async fn test_banner_precedes_json() {
        let mut out = Vec::new();
        run(&mut out, &args(&["--count", "1", "--banner"])).await.unwrap();

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), BOOT_BANNER.len() + 1);
        assert!(serde_json::from_str::<serde_json::Value>(lines[0]).is_err());
        assert!(serde_json::from_str::<SensorReading>(lines[BOOT_BANNER.len()]).is_ok());
    }

    #[test]
    fn test_device_frame_uses_uptime_clock() {
        let mut rng = StdRng::seed_from_u64(3);
        let reading = device_frame(&mut rng, &Site::default(), Duration::from_millis(42_500));

        assert_eq!(reading.timestamp.timestamp_millis(), 42_500);
        assert_eq!(reading.system.uptime, 42);
        assert_eq!(reading.infrastructure_id, "BRIDGE_001");

        let first = device_frame(&mut rng, &Site::default(), Duration::ZERO);
        assert_eq!(first.timestamp.timestamp_millis(), 1);
    }
}
