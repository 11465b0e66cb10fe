//! Apoia batch service - batch job lifecycle, precedent search and service health.

mod api;
mod batch;
mod config;
mod monitor;
mod pangea;
mod pricing;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::header,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use api::{parse_id, ApiError, CurrentUser, JsonBody};
use batch::{BatchJob, BatchService, BatchSummary, InMemoryBatchStore, JobPage, JobStatus};
use config::AppConfig;
use monitor::ServiceMonitor;
use pangea::{PangeaClient, SearchOutcome, SearchRequest};
use pricing::TokenUsage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    batches: BatchService,
    pangea: Arc<PangeaClient>,
    pangea_monitor: Arc<ServiceMonitor>,
}

impl AppState {
    fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let store = Arc::new(InMemoryBatchStore::new());
        Ok(Self {
            batches: BatchService::new(store, config.batch.prices.clone(), config.batch.page_size),
            pangea: Arc::new(PangeaClient::new(&config.pangea)?),
            pangea_monitor: Arc::new(ServiceMonitor::from_config("pangea", &config.monitor)),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "apoia_batch=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env()?;
    info!(
        "Pangea endpoint: {} (monitor window {:?}, threshold {} users)",
        config.pangea.api_url, config.monitor.window, config.monitor.threshold_users
    );

    let state = AppState::from_config(&config)?;
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!("Server listening on http://{}", config.bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(service_status))
        .route("/pangea/search", post(search_pangea))
        .route("/batches", get(list_batches).post(create_batch))
        .route("/batches/{id}", get(get_batch))
        .route("/batches/{id}/pause", post(pause_batch))
        .route("/batches/{id}/play", post(play_batch))
        .route(
            "/batches/{id}/jobs",
            get(list_jobs).post(add_jobs).delete(delete_jobs),
        )
        .route("/batches/{id}/jobs/retry-errors", post(retry_all_errors))
        .route("/batches/{id}/jobs/{job_id}/retry", post(retry_job))
        .route("/batches/{id}/jobs/{job_id}/stop", post(stop_job))
        .route("/batches/{id}/errors.csv", get(errors_csv))
        .route("/internal/batches/{id}/next", get(next_pending))
        .route("/internal/batches/{id}/jobs/{job_id}/complete", post(complete_job))
        .route("/internal/batches/{id}/jobs/{job_id}/fail", post(fail_job))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint.
async fn health() -> &'static str {
    "ok"
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ServiceStatus {
    pangea_down: bool,
    pangea_failing_users: usize,
}

/// Degraded-service signal for the UI banner.
async fn service_status(State(state): State<AppState>) -> Json<ServiceStatus> {
    let snapshot = state.pangea_monitor.snapshot();
    Json(ServiceStatus {
        pangea_down: snapshot.down,
        pangea_failing_users: snapshot.failing_users,
    })
}

/// Search precedents. Always answers 200 with a typed status.
async fn search_pangea(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    body: Result<Json<SearchRequest>, JsonRejection>,
) -> Json<SearchOutcome> {
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => return Json(SearchOutcome::error(rejection.body_text(), None)),
    };
    let outcome = state.pangea.search(&request).await;

    // Only upstream outcomes say anything about Pangea's health.
    if pangea::validate(&request).is_ok() {
        if outcome.is_ok() {
            state.pangea_monitor.record_success();
        } else {
            state.pangea_monitor.record_failure(&user);
        }
    }

    Json(outcome)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateBatchBody {
    name: String,
    #[serde(default)]
    dossier_codes: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DossierCodesBody {
    dossier_codes: Vec<String>,
}

#[derive(Serialize)]
struct CountResponse {
    count: usize,
}

async fn list_batches(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> Result<Json<Vec<BatchSummary>>, ApiError> {
    Ok(Json(state.batches.list_batches(&user).await?))
}

async fn create_batch(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    JsonBody(body): JsonBody<CreateBatchBody>,
) -> Result<Json<BatchSummary>, ApiError> {
    let summary = state
        .batches
        .create_batch(&user, &body.name, &body.dossier_codes)
        .await?;
    Ok(Json(summary))
}

async fn get_batch(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<String>,
) -> Result<Json<BatchSummary>, ApiError> {
    let batch_id = parse_id(&id, "batch")?;
    Ok(Json(state.batches.get_summary(&user, batch_id).await?))
}

async fn pause_batch(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<String>,
) -> Result<Json<BatchSummary>, ApiError> {
    let batch_id = parse_id(&id, "batch")?;
    Ok(Json(state.batches.set_paused(&user, batch_id, true).await?))
}

async fn play_batch(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<String>,
) -> Result<Json<BatchSummary>, ApiError> {
    let batch_id = parse_id(&id, "batch")?;
    Ok(Json(state.batches.set_paused(&user, batch_id, false).await?))
}

#[derive(Deserialize)]
struct JobsQuery {
    status: Option<String>,
    page: Option<usize>,
}

async fn list_jobs(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<String>,
    Query(query): Query<JobsQuery>,
) -> Result<Json<JobPage>, ApiError> {
    let batch_id = parse_id(&id, "batch")?;
    let status = query
        .status
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .map(str::parse::<JobStatus>)
        .transpose()?;

    let page = state
        .batches
        .list_jobs(&user, batch_id, status, query.page.unwrap_or(1))
        .await?;
    Ok(Json(page))
}

async fn add_jobs(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<String>,
    JsonBody(body): JsonBody<DossierCodesBody>,
) -> Result<Json<CountResponse>, ApiError> {
    let batch_id = parse_id(&id, "batch")?;
    let count = state
        .batches
        .add_jobs(&user, batch_id, &body.dossier_codes)
        .await?;
    Ok(Json(CountResponse { count }))
}

async fn delete_jobs(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<String>,
    JsonBody(body): JsonBody<DossierCodesBody>,
) -> Result<Json<CountResponse>, ApiError> {
    let batch_id = parse_id(&id, "batch")?;
    let count = state
        .batches
        .delete_jobs(&user, batch_id, &body.dossier_codes)
        .await?;
    Ok(Json(CountResponse { count }))
}

async fn retry_all_errors(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<String>,
) -> Result<Json<CountResponse>, ApiError> {
    let batch_id = parse_id(&id, "batch")?;
    let count = state.batches.retry_all_errors(&user, batch_id).await?;
    Ok(Json(CountResponse { count }))
}

async fn retry_job(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path((id, job_id)): Path<(String, String)>,
) -> Result<Json<BatchJob>, ApiError> {
    let batch_id = parse_id(&id, "batch")?;
    let job_id = parse_id(&job_id, "job")?;
    Ok(Json(state.batches.retry_job(&user, batch_id, job_id).await?))
}

async fn stop_job(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path((id, job_id)): Path<(String, String)>,
) -> Result<Json<BatchJob>, ApiError> {
    let batch_id = parse_id(&id, "batch")?;
    let job_id = parse_id(&job_id, "job")?;
    Ok(Json(state.batches.stop_job(&user, batch_id, job_id).await?))
}

/// Failed jobs as a CSV download.
async fn errors_csv(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let batch_id = parse_id(&id, "batch")?;
    let csv = state.batches.errors_csv(&user, batch_id).await?;

    let headers = [
        (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"batch-{}-errors.csv\"", batch_id),
        ),
    ];
    Ok((headers, csv))
}

// ============================================================================
// Executor hooks
// ============================================================================

async fn next_pending(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Option<BatchJob>>, ApiError> {
    let batch_id = parse_id(&id, "batch")?;
    Ok(Json(state.batches.next_pending(batch_id).await?))
}

#[derive(Deserialize)]
struct CompleteJobBody {
    model: Option<String>,
    #[serde(default)]
    usage: TokenUsage,
}

async fn complete_job(
    State(state): State<AppState>,
    Path((id, job_id)): Path<(String, String)>,
    JsonBody(body): JsonBody<CompleteJobBody>,
) -> Result<Json<BatchJob>, ApiError> {
    let batch_id = parse_id(&id, "batch")?;
    let job_id = parse_id(&job_id, "job")?;
    let job = state
        .batches
        .complete_job(batch_id, job_id, body.model, body.usage)
        .await?;
    Ok(Json(job))
}

#[derive(Deserialize)]
struct FailJobBody {
    message: String,
}

async fn fail_job(
    State(state): State<AppState>,
    Path((id, job_id)): Path<(String, String)>,
    JsonBody(body): JsonBody<FailJobBody>,
) -> Result<Json<BatchJob>, ApiError> {
    let batch_id = parse_id(&id, "batch")?;
    let job_id = parse_id(&job_id, "job")?;
    Ok(Json(state.batches.fail_job(batch_id, job_id, &body.message).await?))
}
