use axum::{routing::get, Router};
use chrono::Utc;
use gateway::config::Config;
use gateway::device::DeviceCommands;
use gateway::discovery::VendorHints;
use gateway::hub::TelemetryHub;
use gateway::rest::{self, AppState};
use gateway::source::{SerialBackend, SourceConfig, TelemetrySource};
use gateway::{metrics, ws};
use simulator::SensorReading;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();

    info!("Starting Setu telemetry gateway");
    info!("HTTP server: {}", config.http_addr);
    info!("WebSocket server: {}", config.ws_addr);
    match &config.serial_port {
        Some(port) => info!("Serial port: {} @ {} baud", port, config.baud_rate),
        None => info!("Serial port: auto-detect @ {} baud", config.baud_rate),
    }

    if let Err(e) = metrics::init_metrics() {
        error!("Failed to register metrics: {}", e);
    }

    let hub = Arc::new(TelemetryHub::new(
        SensorReading::baseline(&config.site, Utc::now()),
        config.broadcast_capacity,
    ));
    let commands = DeviceCommands::new();

    let classifier = VendorHints::new(config.vendor_hints.clone(), config.fallback_ports.clone());
    let source = TelemetrySource::new(
        SerialBackend,
        Box::new(classifier),
        SourceConfig::from(&config),
        hub.clone(),
        commands.clone(),
    );
    let state = AppState::new(hub, commands, source.state(), config.cors_origins.clone());

    let source_handle = tokio::spawn(source.run());

    let app = Router::new()
        .route("/metrics", get(rest::metrics_handler))
        .merge(rest::create_router(state.clone()));
    let ws_app = ws::create_router(state);

    let http_listener = bind(&config.http_addr).await;
    let ws_listener = bind(&config.ws_addr).await;

    info!("HTTP server listening on {}", config.http_addr);
    info!("WebSocket server listening on {}", config.ws_addr);

    let server_handle = tokio::spawn(async move {
        axum::serve(http_listener, app).await.unwrap_or_else(|e| {
            error!("HTTP server error: {}", e);
        });
    });
    let ws_handle = tokio::spawn(async move {
        axum::serve(ws_listener, ws_app).await.unwrap_or_else(|e| {
            error!("WebSocket server error: {}", e);
        });
    });

    tokio::select! {
        _ = source_handle => {
            error!("Telemetry source terminated");
        }
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = ws_handle => {
            error!("WebSocket server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down");
}

async fn bind(addr: &str) -> TcpListener {
    TcpListener::bind(addr).await.unwrap_or_else(|e| {
        error!("Failed to bind to {}: {}", addr, e);
        std::process::exit(1);
    })
}
