use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use dotenvy::dotenv;
use prometheus::{Encoder, IntCounter, IntGauge, TextEncoder};
use serde::Deserialize;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pumplab_core::calc::blend_by_ratio;
use pumplab_core::topics::status_wildcard_all;
use pumplab_core::{PumpCommand, PumpId};
use pumplab_mqtt::{MqttConfig, MqttService};

mod config;
mod controller;

use config::ControllerConfig;
use controller::{ControllerError, ControllerHandle};

#[derive(Clone)]
struct AppState {
    mqtt: MqttService,
    controller: ControllerHandle,
    metrics: Arc<Metrics>,
    // Reservoir concentrations of the pump pair, for the ratio endpoint.
    reservoir: (f64, f64),
}

pub struct Metrics {
    pub mqtt_connected: IntGauge,
    pub commands_published_total: IntCounter,
    pub status_messages_total: IntCounter,
    pub status_dropped_total: IntCounter,
    pub ws_clients: IntGauge,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        let mqtt_connected = IntGauge::new(
            "pumplab_mqtt_connected",
            "MQTT connection status (1 connected, 0 otherwise)",
        )
        .unwrap();
        let commands_published_total = IntCounter::new(
            "pumplab_commands_published_total",
            "Total pump commands published",
        )
        .unwrap();
        let status_messages_total = IntCounter::new(
            "pumplab_status_messages_total",
            "Total pump status messages reconciled",
        )
        .unwrap();
        let status_dropped_total = IntCounter::new(
            "pumplab_status_dropped_total",
            "Total malformed or unroutable status messages dropped",
        )
        .unwrap();
        let ws_clients =
            IntGauge::new("pumplab_ws_clients", "Number of connected WebSocket clients").unwrap();

        let registry = prometheus::default_registry();
        let _ = registry.register(Box::new(mqtt_connected.clone()));
        let _ = registry.register(Box::new(commands_published_total.clone()));
        let _ = registry.register(Box::new(status_messages_total.clone()));
        let _ = registry.register(Box::new(status_dropped_total.clone()));
        let _ = registry.register(Box::new(ws_clients.clone()));

        Arc::new(Self {
            mqtt_connected,
            commands_published_total,
            status_messages_total,
            status_dropped_total,
            ws_clients,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    init_tracing();

    let mqtt_cfg = MqttConfig::from_env();
    info!(host = %mqtt_cfg.host, port = mqtt_cfg.port, "configuring MQTT client");
    let mqtt = MqttService::connect(mqtt_cfg)
        .await
        .context("failed to initialize MQTT")?;

    if let Err(err) = mqtt
        .subscribe(status_wildcard_all(), rumqttc::QoS::AtMostOnce)
        .await
    {
        tracing::warn!(?err, "failed to subscribe to status wildcard");
    }

    let controller_cfg = ControllerConfig::from_env()?;
    let metrics = Metrics::new();
    let reservoir = reservoir_pair(&controller_cfg);
    let handle = controller::spawn(
        controller_cfg,
        mqtt.clone(),
        mqtt.events(),
        metrics.clone(),
    );

    let state = AppState {
        mqtt: mqtt.clone(),
        controller: handle,
        metrics,
        reservoir,
    };

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/version", get(version))
        .route("/metrics", get(metrics_handler))
        // Pump control
        .route("/api/pump/:pump_id/command", post(api_pump_command))
        .route("/api/pump/:pump_id/status", get(api_pump_status))
        .route("/api/pumps", get(api_pumps))
        // Output profiles
        .route("/api/profiles", get(api_profiles))
        .route("/api/profiles/:id/select", post(api_profile_select))
        .route("/api/profile/start", post(api_profile_start))
        .route("/api/profile/stop", post(api_profile_stop))
        .route("/api/profile/schedule", get(api_profile_schedule))
        // Flow/blend readouts
        .route("/api/concentration", get(api_concentration))
        .route("/api/blend/ratio", post(api_blend_ratio))
        // Status stream
        .route("/ws/status", get(ws_status))
        .with_state(state);

    let addr: SocketAddr = std::env::var("PUMPLAB_HTTP_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        .parse()
        .context("invalid PUMPLAB_HTTP_ADDR")?;

    info!(%addr, "starting HTTP server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Clean DISCONNECT so the broker drops our session instead of timing
    // out a dead socket.
    if let Err(err) = mqtt.disconnect().await {
        tracing::warn!(?err, "MQTT disconnect on shutdown failed");
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,axum=info,hyper=info,rumqttc=warn"))
        .unwrap();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("failed to install signal handler");
        term.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(state): State<AppState>) -> StatusCode {
    if state.mqtt.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn version() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn metrics_handler() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buf = Vec::new();
    if encoder.encode(&metric_families, &mut buf).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "encode failed").into_response();
    }
    Response::builder()
        .status(StatusCode::OK)
        .header(axum::http::header::CONTENT_TYPE, encoder.format_type())
        .body(axum::body::Body::from(buf))
        .unwrap()
}

fn error_response(err: ControllerError) -> Response {
    let status = match &err {
        ControllerError::InvalidCommand(_)
        | ControllerError::UnknownPump(_)
        | ControllerError::NoProfileSelected => StatusCode::BAD_REQUEST,
        ControllerError::UnknownProfile(_) => StatusCode::NOT_FOUND,
        ControllerError::AlreadyRunning => StatusCode::CONFLICT,
        ControllerError::Backend(_) => StatusCode::BAD_GATEWAY,
        ControllerError::Closed => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, err.to_string()).into_response()
}

// ----- Pump control -----

async fn api_pump_command(
    Path(pump_id): Path<u8>,
    State(state): State<AppState>,
    Json(command): Json<PumpCommand>,
) -> Response {
    match state.controller.dispatch(PumpId(pump_id), command).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(err),
    }
}

async fn api_pump_status(Path(pump_id): Path<u8>, State(state): State<AppState>) -> Response {
    match state.controller.read_status(PumpId(pump_id)).await {
        Ok(status) => Json(status).into_response(),
        Err(err) => error_response(err),
    }
}

async fn api_pumps(State(state): State<AppState>) -> Response {
    match state.controller.read_all().await {
        Ok(statuses) => Json(statuses).into_response(),
        Err(err) => error_response(err),
    }
}

// ----- Output profiles -----

async fn api_profiles(State(state): State<AppState>) -> Response {
    match state.controller.profiles().await {
        Ok(profiles) => Json(profiles).into_response(),
        Err(err) => error_response(err),
    }
}

async fn api_profile_select(Path(id): Path<String>, State(state): State<AppState>) -> Response {
    match state.controller.select_profile(id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(err),
    }
}

async fn api_profile_start(State(state): State<AppState>) -> Response {
    match state.controller.start_profile().await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(err),
    }
}

async fn api_profile_stop(State(state): State<AppState>) -> Response {
    match state.controller.stop_profile().await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(err),
    }
}

async fn api_profile_schedule(State(state): State<AppState>) -> Response {
    match state.controller.schedule().await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(err) => error_response(err),
    }
}

// ----- Flow/blend readouts -----

async fn api_concentration(State(state): State<AppState>) -> Response {
    match state.controller.concentration().await {
        Ok(reading) => Json(reading).into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Deserialize)]
struct BlendRatioPayload {
    ratio: f64,
    conc1: Option<f64>,
    conc2: Option<f64>,
}

async fn api_blend_ratio(
    State(state): State<AppState>,
    Json(body): Json<BlendRatioPayload>,
) -> Response {
    let conc1 = body.conc1.unwrap_or(state.reservoir.0);
    let conc2 = body.conc2.unwrap_or(state.reservoir.1);
    match blend_by_ratio(body.ratio, conc1, conc2) {
        Ok(concentration) => Json(serde_json::json!({
            "ratio": body.ratio,
            "concentration": concentration,
        }))
        .into_response(),
        Err(err) => (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    }
}

// ----- WebSocket status stream -----

async fn ws_status(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| status_ws_loop(state, socket))
}

async fn status_ws_loop(state: AppState, mut socket: WebSocket) {
    state.metrics.ws_clients.inc();
    let mut updates = state.controller.updates();
    loop {
        match updates.recv().await {
            Ok(update) => {
                let Ok(text) = serde_json::to_string(&update) else {
                    continue;
                };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "WebSocket client fell behind status stream");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    let _ = socket.close().await;
    state.metrics.ws_clients.dec();
}

fn reservoir_pair(config: &ControllerConfig) -> (f64, f64) {
    let first = config.pump_ids.first().copied();
    let second = config.pump_ids.get(1).copied();
    (
        first.map_or(0.0, |id| config.concentration_for(id)),
        second.map_or(0.0, |id| config.concentration_for(id)),
    )
}
