use crate::device::DeviceCommands;
use crate::errors::Error;
use crate::hub::TelemetryHub;
use crate::metrics::gather_metrics;
use crate::model::{CalibrateRequest, CommandRequest, CommandResponse, HistoryPoint, StatusResponse};
use crate::source::SourceState;
use axum::{
    extract::{Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use simulator::SensorReading;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{error, info, warn};

const HISTORY_POINTS: i64 = 20;

/// Shared by the REST and WebSocket routers
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<TelemetryHub>,
    pub commands: DeviceCommands,
    pub source_state: watch::Receiver<SourceState>,
    pub websocket_clients: Arc<AtomicUsize>,
    pub cors_origins: Arc<Vec<String>>,
    pub started: Instant,
}

impl AppState {
    pub fn new(
        hub: Arc<TelemetryHub>,
        commands: DeviceCommands,
        source_state: watch::Receiver<SourceState>,
        cors_origins: Vec<String>,
    ) -> Self {
        Self {
            hub,
            commands,
            source_state,
            websocket_clients: Arc::new(AtomicUsize::new(0)),
            cors_origins: Arc::new(cors_origins),
            started: Instant::now(),
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/sensor-data", get(get_sensor_data))
        .route("/api/sensor-data/history", get(get_history))
        .route("/api/arduino/command", post(send_command))
        .route("/api/arduino/tare", post(tare))
        .route("/api/arduino/calibrate", post(calibrate))
        .route("/api/status", get(get_status))
        .layer(middleware::from_fn_with_state(state.clone(), cors))
        .with_state(state)
}

async fn get_sensor_data(State(state): State<AppState>) -> Json<SensorReading> {
    Json(state.hub.latest().as_ref().clone())
}

async fn get_history() -> Json<Vec<HistoryPoint>> {
    Json(mock_history(Utc::now(), &mut rand::thread_rng()))
}

/// Placeholder series, one point per minute, oldest first
fn mock_history(now: DateTime<Utc>, rng: &mut impl Rng) -> Vec<HistoryPoint> {
    (0..HISTORY_POINTS)
        .rev()
        .map(|minutes_ago| HistoryPoint {
            timestamp: now - Duration::minutes(minutes_ago),
            strain: 800.0 + rng.gen_range(0.0..400.0),
            vibration: 1.0 + rng.gen_range(0.0..3.0),
            temperature: 22.0 + rng.gen_range(0.0..8.0),
        })
        .collect()
}

async fn send_command(
    State(state): State<AppState>,
    Json(request): Json<CommandRequest>,
) -> Json<CommandResponse> {
    let result = state.commands.send_raw(&request.command).await;
    Json(respond(result, || format!("Command sent: {}", request.command)))
}

async fn tare(State(state): State<AppState>) -> Json<CommandResponse> {
    let result = state.commands.tare().await;
    Json(respond(result, || "Tare command sent to strain gauge".to_string()))
}

async fn calibrate(
    State(state): State<AppState>,
    body: Option<Json<CalibrateRequest>>,
) -> Json<CommandResponse> {
    let weight = body.and_then(|Json(request)| request.weight).filter(|w| *w != 0.0);
    let result = state.commands.calibrate(weight).await;
    Json(respond(result, || match weight {
        Some(w) => format!("Calibration weight set: {}", w),
        None => "Calibration mode activated".to_string(),
    }))
}

fn respond(result: Result<(), Error>, message: impl FnOnce() -> String) -> CommandResponse {
    match result {
        Ok(()) => {
            let message = message();
            info!("{}", message);
            CommandResponse::sent(message)
        }
        Err(Error::DeviceNotConnected) => CommandResponse::failed(Error::DeviceNotConnected),
        Err(e) => {
            warn!("Device command failed: {}", e);
            CommandResponse::failed(e)
        }
    }
}

async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let source_state = *state.source_state.borrow();
    Json(StatusResponse {
        server: "running".to_string(),
        arduino_connected: state.commands.is_connected(),
        source_state: source_state.to_string(),
        websocket_clients: state.websocket_clients.load(Ordering::Relaxed),
        last_data_update: state.hub.latest().timestamp,
        uptime: state.started.elapsed().as_secs_f64(),
    })
}

pub async fn metrics_handler() -> Result<String, AppError> {
    Ok(gather_metrics()?)
}

/// Lets the dashboard's dev servers call the API from another origin
async fn cors(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let origin = request
        .headers()
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .filter(|origin| state.cors_origins.iter().any(|allowed| allowed == origin))
        .and_then(|origin| HeaderValue::from_str(origin).ok());

    let mut response = if request.method() == Method::OPTIONS {
        StatusCode::NO_CONTENT.into_response()
    } else {
        next.run(request).await
    };

    if let Some(origin) = origin {
        let headers = response.headers_mut();
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, POST, OPTIONS"),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("content-type"),
        );
        headers.insert(header::VARY, HeaderValue::from_static("origin"));
    }

    response
}

/// Unexpected failures surface as a 500 with the error text
pub struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!("API error: {}", self.0);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": "Internal server error" })),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
