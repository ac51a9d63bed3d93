mod capture;
mod cli;
mod config;
mod hub;
mod session;
mod telemetry;
mod websocket;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use serde_json::json;
use tokio::signal;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::capture::CaptureRelay;
use crate::cli::Cli;
use crate::config::RelayConfig;
use crate::hub::Hub;

/// Shared handles for the HTTP layer. Cloned per request; every field is
/// cheap to clone.
#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) hub: Hub,
    pub(crate) capture: CaptureRelay,
    pub(crate) config: RelayConfig,
    pub(crate) metrics: PrometheusHandle,
}

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = telemetry::Telemetry::init()?;

    let mut cli = Cli::parse();
    if let Some(command) = cli.command.take() {
        return cli::run(command).await;
    }
    let config = RelayConfig::try_from(&cli)?;
    info!(
        listen_addr = %config.listen_addr,
        max_students = config.max_students,
        "starting lectern relay"
    );

    run(config, telemetry.metrics_handle()).await
}

async fn run(config: RelayConfig, metrics: PrometheusHandle) -> Result<()> {
    let hub = Hub::new(&config);
    let capture = CaptureRelay::new(hub.clone());
    let state = AppState {
        hub,
        capture,
        config: config.clone(),
        metrics,
    };

    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;

    info!("lectern relay listening on {}", config.listen_addr);

    let graceful = axum::serve(listener, router).with_graceful_shutdown(shutdown_signal());
    graceful.await.context("server shutdown with error")?;

    info!("shutdown complete");
    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(websocket::websocket_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsResponse {
    teacher_connected: bool,
    student_count: usize,
    students: Vec<StudentStats>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StudentStats {
    client_id: String,
    email: String,
    last_active_ms: u64,
}

async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    let students = state
        .hub
        .students()
        .into_iter()
        .map(|session| StudentStats {
            client_id: session.client_id().unwrap_or_default(),
            email: session.email(),
            last_active_ms: session.last_active_ms(),
        })
        .collect::<Vec<_>>();
    Json(StatsResponse {
        teacher_connected: state.hub.has_teacher(),
        student_count: students.len(),
        students,
    })
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}
