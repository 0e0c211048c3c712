mod jobs;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use eyre::WrapErr;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::Lazy;
use serde::Serialize;
use serde_json::json;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;
use valuer_images::{
    config::PipelineConfig,
    lots::{self, IngestSettings, LotsError},
    metrics,
    models::{AcquisitionOutcome, BatchSummary},
    pipeline::{Pipeline, PipelineError, PipelineErrorKind},
    scheduler::BatchScheduler,
};

static PROMETHEUS: Lazy<Option<PrometheusHandle>> = Lazy::new(|| {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|err| warn!(target = "valuer.api", error = %err, "prometheus_unavailable"))
        .ok()
});

#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "valuer.api", "server crashed: {err:?}");
        std::process::exit(1);
    }
}

async fn run() -> eyre::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();
    Lazy::force(&PROMETHEUS);

    let config = load_config()?;
    let pipeline = Pipeline::from_config(&config).wrap_err("building pipeline")?;
    info!(
        target = "valuer.api",
        chain = ?pipeline.chain().names(),
        concurrency = config.max_concurrency.get(),
        development = config.mode.is_development(),
        "pipeline_ready"
    );
    let scheduler = BatchScheduler::new(pipeline, config.max_concurrency);
    let shutdown = CancellationToken::new();
    let (queue, _worker) = jobs::JobQueue::spawn(scheduler.clone(), shutdown.clone());

    let state = AppState {
        scheduler,
        queue,
        ingest: IngestSettings::from_config(&config),
        shutdown: shutdown.clone(),
    };
    let app = router(state).layer(DefaultBodyLimit::max(body_limit_from_env()));

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "valuer.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;
    Ok(())
}

/// `PIPELINE_CONFIG` points at an optional YAML file layered over the
/// environment.
fn load_config() -> eyre::Result<PipelineConfig> {
    let config = match std::env::var("PIPELINE_CONFIG") {
        Ok(path) if !path.trim().is_empty() => PipelineConfig::from_yaml_file(path.trim())
            .wrap_err_with(|| format!("loading {path}"))?,
        _ => PipelineConfig::from_env().wrap_err("reading environment")?,
    };
    Ok(config)
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(target = "valuer.api", error = %err, "signal_handler_failed");
    }
    info!(target = "valuer.api", "shutdown_requested");
    shutdown.cancel();
}

#[derive(Clone)]
struct AppState {
    scheduler: BatchScheduler,
    queue: jobs::JobQueue,
    ingest: IngestSettings,
    shutdown: CancellationToken,
}

fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/process", post(process_batch))
        .nest(
            "/jobs",
            Router::new()
                .route("/process", post(enqueue_batch_job))
                .route("/{id}", get(get_job_status)),
        )
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
///
/// Reports the configured strategy order alongside `status`.
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let chain = state.scheduler.pipeline().chain().names();
    Json(json!({
        "status": "ok",
        "service": "valuer-images",
        "strategies": chain,
        "concurrency": state.scheduler.concurrency(),
    }))
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(8 * 1024 * 1024)
}

async fn metrics_endpoint(headers: HeaderMap) -> Response {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("x-metrics-key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    match PROMETHEUS.as_ref() {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder unavailable").into_response(),
    }
}

#[derive(Debug, Serialize)]
struct ProcessResponse {
    batch_id: String,
    summary: BatchSummary,
    outcomes: Vec<AcquisitionOutcome>,
}

/// Run one batch to completion.
///
/// - Method: `POST`
/// - Path: `/process`
/// - Body: auction export JSON (`{"results":[{"hits":[...]}]}`)
/// - Response: `ProcessResponse`, one outcome per accepted hit
async fn process_batch(
    State(state): State<AppState>,
    body: String,
) -> Result<Json<ProcessResponse>, AppError> {
    metrics::inc_requests("/process");
    let references = lots::parse_export(&body, &state.ingest)?;
    let batch_id = Uuid::new_v4().to_string();
    info!(
        target = "valuer.api",
        batch_id = %batch_id,
        items = references.len(),
        "batch_requested"
    );

    let started = std::time::Instant::now();
    let outcomes = state
        .scheduler
        .run_with_cancel(references, state.shutdown.child_token())
        .await?;
    let summary = BatchSummary::from_outcomes(&outcomes, started.elapsed());
    Ok(Json(ProcessResponse {
        batch_id,
        summary,
        outcomes,
    }))
}

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    job_id: String,
}

async fn enqueue_batch_job(
    State(state): State<AppState>,
    body: String,
) -> Result<Json<EnqueueResponse>, AppError> {
    metrics::inc_requests("/jobs/process");
    let references = lots::parse_export(&body, &state.ingest)?;
    let id = state
        .queue
        .enqueue_batch(references)
        .await
        .map_err(|err| AppError::Pipeline(PipelineError::internal("enqueue", err.error)))?;
    Ok(Json(EnqueueResponse {
        job_id: id.to_string(),
    }))
}

async fn get_job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<jobs::JobInfo>, AppError> {
    let Ok(uuid) = Uuid::parse_str(&id) else {
        return Err(AppError::Pipeline(PipelineError::invalid_input(
            "jobs",
            "invalid_job_id",
        )));
    };
    match state.queue.get(uuid).await {
        Some(info) => Ok(Json(info)),
        None => Err(AppError::NotFound("job")),
    }
}

#[derive(Debug)]
enum AppError {
    Pipeline(PipelineError),
    Export(LotsError),
    NotFound(&'static str),
}

impl From<PipelineError> for AppError {
    fn from(value: PipelineError) -> Self {
        Self::Pipeline(value)
    }
}

impl From<LotsError> for AppError {
    fn from(value: LotsError) -> Self {
        Self::Export(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, payload) = match self {
            AppError::Pipeline(err) => {
                let status = match err.kind() {
                    PipelineErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                    PipelineErrorKind::Config | PipelineErrorKind::Internal => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                let payload = ApiError {
                    error: err.stage().to_string(),
                    detail: Some(err.detail().to_string()),
                };
                (status, payload)
            }
            AppError::Export(err) => (
                StatusCode::BAD_REQUEST,
                ApiError {
                    error: "parse_export".into(),
                    detail: Some(err.to_string()),
                },
            ),
            AppError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                ApiError {
                    error: "not_found".into(),
                    detail: Some(what.into()),
                },
            ),
        };
        (status, Json(payload)).into_response()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
