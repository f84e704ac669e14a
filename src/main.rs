use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use prometheus::TextEncoder;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, signal};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use story_admission::{
    config::{load_settings, AdmissionSettings, RateLimitStats},
    limiter::AdmissionController,
    metrics::Metrics,
    middleware::AdmissionLayer,
    store::InMemoryCounterStore,
};

#[derive(Clone)]
struct AppState {
    settings: Arc<AdmissionSettings>,
    metrics: Arc<Metrics>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "story_admission=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting story admission service");

    let config_path = std::env::var("CONFIG_PATH").ok();
    if let Some(path) = &config_path {
        info!("Loading configuration from: {}", path);
    }
    let settings = Arc::new(load_settings(config_path.as_deref())?);
    info!(stats = %serde_json::to_string(&settings.stats())?, "Rate limiting module loaded");

    let metrics = Arc::new(Metrics::new()?);
    let store = Arc::new(InMemoryCounterStore::new().with_metrics(metrics.clone()));
    let controller = AdmissionController::from_settings(&settings, store)?
        .with_metrics(metrics.clone());

    let state = AppState { settings, metrics };

    let http_addr = std::env::var("HTTP_PORT")
        .unwrap_or_else(|_| "0.0.0.0:8000".to_string())
        .parse::<SocketAddr>()?;

    info!("HTTP server listening on {}", http_addr);
    start_http_server(state, Arc::new(controller), http_addr).await?;

    info!("Service stopped");
    Ok(())
}

fn router(state: AppState, controller: Arc<AdmissionController>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/api/rate-limit-status", get(rate_limit_status))
        .fallback(not_found)
        .with_state(state)
        .layer(AdmissionLayer::new(controller))
}

async fn start_http_server(
    state: AppState,
    controller: Arc<AdmissionController>,
    addr: SocketAddr,
) -> Result<()> {
    let app = router(state, controller);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

async fn shutdown_signal() {
    if signal::ctrl_c().await.is_ok() {
        info!("Received Ctrl+C, shutting down");
    }
}

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn rate_limit_status(State(state): State<AppState>) -> Json<RateLimitStats> {
    Json(state.settings.stats())
}

async fn not_found() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "Not found" })))
}

async fn metrics_handler(State(state): State<AppState>) -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = state.metrics.registry().gather();

    match encoder.encode_to_string(&metric_families) {
        Ok(metrics) => Ok(metrics),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}
