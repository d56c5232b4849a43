use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref READINGS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("gateway_readings_total", "Readings published, by source"),
        &["source"]
    )
    .unwrap();
    pub static ref DISCARDED_LINES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "gateway_discarded_lines_total",
            "Device lines discarded without updating the current reading"
        ),
        &["reason"]
    )
    .unwrap();
    pub static ref DEVICE_FAULTS_TOTAL: IntCounter = IntCounter::with_opts(Opts::new(
        "gateway_device_faults_total",
        "Device connections lost to an error or close"
    ))
    .unwrap();
    pub static ref COMMANDS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("gateway_commands_total", "Device commands, by outcome"),
        &["result"]
    )
    .unwrap();
    pub static ref WEBSOCKET_CLIENTS: IntGauge = IntGauge::with_opts(Opts::new(
        "gateway_websocket_clients",
        "Open WebSocket connections"
    ))
    .unwrap();
    pub static ref SOURCE_STATE: IntGauge = IntGauge::with_opts(Opts::new(
        "gateway_source_state",
        "Telemetry source: 0 discovering, 1 connecting, 2 device streaming, 3 simulating"
    ))
    .unwrap();
}

pub fn init_metrics() -> Result<(), prometheus::Error> {
    REGISTRY.register(Box::new(READINGS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DISCARDED_LINES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DEVICE_FAULTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(COMMANDS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(WEBSOCKET_CLIENTS.clone()))?;
    REGISTRY.register(Box::new(SOURCE_STATE.clone()))?;
    Ok(())
}

pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
