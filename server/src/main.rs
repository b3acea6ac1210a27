mod api;
mod config;
mod error;
mod hardware;

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use shade_mixer::ColorEstimator;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_scalar::{Scalar, Servable};

use crate::api::{
    AnalyzeRequest, AnalyzeResponse, ChannelStatus, DispenseRequest, DispenseResponse,
    ExtractRequest, PigmentShare, StatusResponse,
};
use crate::config::Config;
use crate::error::AppError;
use crate::hardware::Dispenser;

/// Application state shared across handlers
#[derive(Clone)]
struct AppState {
    estimator: Arc<ColorEstimator>,
    dispenser: Arc<dyn Dispenser>,
    /// Cycles dispensed when a request names no budget
    default_budget: u32,
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Shade Mixer API",
        description = "Skin color analysis and pigment dispensing",
        version = "0.1.0"
    ),
    tags(
        (name = "Color", description = "Skin color estimation"),
        (name = "Dispenser", description = "Pigment mixing and motor control")
    ),
    paths(ping, analyze, dispense, extract, stop),
    components(schemas(
        StatusResponse,
        AnalyzeRequest,
        AnalyzeResponse,
        DispenseRequest,
        DispenseResponse,
        PigmentShare,
        ChannelStatus,
        ExtractRequest
    ))
)]
struct ApiDoc;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    if let Err(e) = run().await {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;
    let core = config.mixer.build()?;
    tracing::info!(
        "Mix model {:?}, step budget {}, skin filter {}",
        config.mixer.mix_model,
        config.mixer.dispense.step_budget,
        config.mixer.skin_filter
    );

    let dispenser = hardware::open(&config.mixer, core.solver)?;

    let state = AppState {
        estimator: Arc::new(core.estimator),
        dispenser: Arc::clone(&dispenser),
        default_budget: config.mixer.dispense.step_budget,
    };

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Leave no coil energized on the way out
    dispenser.disable_all().await?;
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/analyze", post(analyze))
        .route("/dispense", post(dispense))
        .route("/extract", post(extract))
        .route("/stop", post(stop))
        .merge(Scalar::with_url("/docs", ApiDoc::openapi()))
        .route("/openapi.json", get(openapi_json))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}

/// Health check endpoint
///
/// Never waits on the dispenser, even mid-job.
#[utoipa::path(
    get,
    path = "/ping",
    responses(
        (status = 200, description = "Service is healthy", body = StatusResponse)
    )
)]
async fn ping() -> Json<StatusResponse> {
    Json(StatusResponse::new("ok"))
}

/// Get OpenAPI JSON specification
async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Estimate skin color
///
/// Corrects the skin samples for lighting using the reference chart, when
/// one is given, and returns their median L*a*b*.
#[utoipa::path(
    post,
    path = "/analyze",
    tag = "Color",
    request_body = AnalyzeRequest,
    responses(
        (status = 200, description = "Estimated color", body = AnalyzeResponse),
        (status = 400, description = "No skin samples")
    )
)]
async fn analyze(
    State(state): State<AppState>,
    Json(req): Json<AnalyzeRequest>,
) -> Result<Json<AnalyzeResponse>, AppError> {
    let estimate = state
        .estimator
        .estimate(&req.skin, req.reference.as_deref())?;
    Ok(Json(estimate.into()))
}

/// Mix and dispense a color
///
/// Blocks until every channel has run. A hardware failure on one channel is
/// reported in its status and skips the channels after it.
#[utoipa::path(
    post,
    path = "/dispense",
    tag = "Dispenser",
    request_body = DispenseRequest,
    responses(
        (status = 200, description = "Per-channel results", body = DispenseResponse),
        (status = 400, description = "Invalid target or budget")
    )
)]
async fn dispense(
    State(state): State<AppState>,
    Json(req): Json<DispenseRequest>,
) -> Result<Json<DispenseResponse>, AppError> {
    let budget = req.budget.unwrap_or(state.default_budget);
    tracing::info!(
        "Dispense request: L*a*b* ({:.2}, {:.2}, {:.2}), budget {}",
        req.lab.l,
        req.lab.a,
        req.lab.b,
        budget
    );

    let report = state.dispenser.dispense(req.lab, budget).await?;
    Ok(Json(report.into()))
}

/// Pull pigment back into a dispenser
#[utoipa::path(
    post,
    path = "/extract",
    tag = "Dispenser",
    request_body = ExtractRequest,
    responses(
        (status = 200, description = "Channel result", body = ChannelStatus),
        (status = 503, description = "GPIO failure")
    )
)]
async fn extract(
    State(state): State<AppState>,
    Json(req): Json<ExtractRequest>,
) -> Result<Json<ChannelStatus>, AppError> {
    let result = state.dispenser.extract(req.pigment, req.preset).await?;
    Ok(Json(result.into()))
}

/// Emergency stop
///
/// Interrupts any running job and drives every coil low.
#[utoipa::path(
    post,
    path = "/stop",
    tag = "Dispenser",
    responses(
        (status = 200, description = "All channels released", body = StatusResponse),
        (status = 503, description = "GPIO failure")
    )
)]
async fn stop(State(state): State<AppState>) -> Result<Json<StatusResponse>, AppError> {
    state.dispenser.disable_all().await?;
    Ok(Json(StatusResponse::new("stopped")))
}
