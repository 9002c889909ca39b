mod catalog;
mod config;
mod db;
mod events;
mod folder_name;
mod http;
mod image_service;
mod jobs;
mod matcher;
mod metrics;
mod models;
mod mount;
mod orchestrator;
mod security;
mod service;
mod stabilizer;
mod storage;
mod uploader;
mod watch_log;
mod watcher;
mod workflow;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    middleware,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, KeepAliveStream, Sse},
    },
    routing::{delete, get, post},
};
use catalog::ShopifyClient;
use config::Settings;
use events::JobEvent;
use futures::stream::{self, BoxStream, StreamExt};
use image_service::ImageServiceClient;
use jobs::{JobError, JobStore, WORKFLOW_STEPS};
use matcher::ProductMatcher;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, PipelineJob, WatchLogEntry, WatchStats};
use orchestrator::FolderPipeline;
use security::{AuthState, Operator, require_api_auth};
use serde::{Deserialize, Serialize};
use serde_json::json;
use service::{ServiceError, WatchService, WatchStatusReport};
use stabilizer::Stabilizer;
use std::{convert::Infallible, net::SocketAddr, sync::Arc};
use storage::SignedUrlResolver;
use tokio::sync::broadcast;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use uploader::ImageUploader;
use watch_log::WatchLog;
use workflow::{WorkflowError, WorkflowRunner};

const DEFAULT_LIST_LIMIT: i64 = 50;
const MAX_LIST_LIMIT: i64 = 500;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "ingest.api", "server crashed: {err}");
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();
    init_tracing();

    let settings = Settings::from_env();
    let prometheus_handle = PrometheusBuilder::new().install_recorder()?;
    let auth_state = AuthState::from_env();

    let pool = db::connect(&settings.database_url).await?;
    let watch_log = WatchLog::new(pool.clone());
    let recovered = watch_log.recover_interrupted().await?;
    if recovered > 0 {
        warn!(
            target = "ingest.api",
            recovered, "rolled interrupted uploads back to matched"
        );
    }

    let catalog = Arc::new(ShopifyClient::new(&settings.shopify));
    let watch_settings = Arc::new(settings.watch.clone());
    let signer = match (&settings.mirror, &watch_settings.root) {
        (Some(mirror), Some(root)) => SignedUrlResolver::from_env(root, mirror.clone()),
        _ => None,
    };
    let stabilizer = Stabilizer::new(watch_settings.stabilize_window);
    let pipeline = FolderPipeline::new(
        watch_log.clone(),
        stabilizer.clone(),
        ProductMatcher::new(catalog.clone(), settings.match_threshold),
        ImageUploader::new(catalog.clone(), signer),
        watch_settings.clone(),
    );
    let watcher = WatchService::new(
        pipeline,
        stabilizer,
        watch_log,
        catalog.clone(),
        watch_settings.clone(),
    );

    let jobs = JobStore::new(
        settings.jobs.capacity,
        WORKFLOW_STEPS,
        Arc::new(events::EventBus::new()),
        Some(pool),
    );
    let _sweeper = jobs.spawn_sweeper(settings.jobs.sweep_interval, settings.jobs.stale_after);
    let image_service = ImageServiceClient::new(&settings.image_service_url);
    let (runner, _worker) = WorkflowRunner::spawn(
        jobs.clone(),
        catalog,
        Arc::new(image_service.clone()),
        settings.jobs.queue_capacity,
    );

    if watch_settings.autostart {
        match watcher.start().await {
            Ok(status) => info!(
                target = "ingest.api",
                connected = status.connected,
                "watcher autostarted"
            ),
            Err(err) => warn!(target = "ingest.api", error = %err, "watcher autostart failed"),
        }
    }

    let state = AppState {
        watcher: watcher.clone(),
        jobs,
        runner,
        image_service,
        prometheus_handle,
    };

    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/watcher/start", post(watcher_start))
        .route("/watcher/stop", post(watcher_stop))
        .route("/watcher/rescan", post(watcher_rescan))
        .route("/watcher/status", get(watcher_status))
        .route("/watcher/stats", get(watcher_stats))
        .route("/watcher/unmatched", get(watcher_unmatched))
        .route("/watcher/recent", get(watcher_recent))
        .route("/watcher/entries/{id}/link", post(watcher_link))
        .route("/watcher/entries/{id}", delete(watcher_delete))
        .route("/jobs", post(create_job).get(list_jobs))
        .route("/jobs/events", get(all_job_events))
        .route("/jobs/{id}", get(get_job))
        .route("/jobs/{id}/cancel", post(cancel_job))
        .route("/jobs/{id}/events", get(job_events))
        .route_layer(middleware::from_fn_with_state(auth_state, require_api_auth));

    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = ([0, 0, 0, 0], settings.port).into();
    info!(target = "ingest.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal(watcher))
        .await?;
    Ok(())
}

async fn shutdown_signal(watcher: WatchService<ShopifyClient>) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(target = "ingest.api", error = %err, "cannot listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!(target = "ingest.api", "shutting down");
    watcher.shutdown().await;
}

#[derive(Clone)]
struct AppState {
    watcher: WatchService<ShopifyClient>,
    jobs: JobStore,
    runner: WorkflowRunner,
    image_service: ImageServiceClient,
    prometheus_handle: PrometheusHandle,
}

/// Liveness plus a probe of the image-processing service.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let (status, image_service) = match state.image_service.health().await {
        Ok(health) if health.is_ok() => ("ok", json!(health)),
        Ok(health) => ("degraded", json!(health)),
        Err(err) => (
            "degraded",
            json!({ "status": "unreachable", "error": err.to_string() }),
        ),
    };
    Json(json!({
        "status": status,
        "service": "studio-ingest-rs",
        "image_service": image_service,
    }))
}

async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4",
        )],
        state.prometheus_handle.render(),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    limit: Option<i64>,
}

impl ListQuery {
    fn limit(&self) -> i64 {
        self.limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT)
    }
}

async fn watcher_start(State(state): State<AppState>) -> Result<Json<WatchStatusReport>, AppError> {
    crate::metrics::inc_requests("/watcher/start");
    Ok(Json(state.watcher.start().await?))
}

async fn watcher_stop(State(state): State<AppState>) -> Result<Json<WatchStatusReport>, AppError> {
    crate::metrics::inc_requests("/watcher/stop");
    state.watcher.stop().await?;
    Ok(Json(state.watcher.status().await))
}

async fn watcher_rescan(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    crate::metrics::inc_requests("/watcher/rescan");
    let queued = state.watcher.rescan().await?;
    Ok(Json(json!({ "queued": queued })))
}

async fn watcher_status(State(state): State<AppState>) -> Json<WatchStatusReport> {
    crate::metrics::inc_requests("/watcher/status");
    Json(state.watcher.status().await)
}

async fn watcher_stats(State(state): State<AppState>) -> Result<Json<WatchStats>, AppError> {
    crate::metrics::inc_requests("/watcher/stats");
    Ok(Json(state.watcher.stats().await?))
}

async fn watcher_unmatched(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<WatchLogEntry>>, AppError> {
    crate::metrics::inc_requests("/watcher/unmatched");
    Ok(Json(state.watcher.unmatched(query.limit()).await?))
}

async fn watcher_recent(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<WatchLogEntry>>, AppError> {
    crate::metrics::inc_requests("/watcher/recent");
    Ok(Json(state.watcher.recent(query.limit()).await?))
}

#[derive(Debug, Deserialize)]
struct LinkRequest {
    product_id: String,
}

async fn watcher_link(
    State(state): State<AppState>,
    Extension(operator): Extension<Operator>,
    Path(id): Path<i64>,
    Json(payload): Json<LinkRequest>,
) -> Result<Json<WatchLogEntry>, AppError> {
    crate::metrics::inc_requests("/watcher/entries/link");
    let product_id = payload.product_id.trim();
    if product_id.is_empty() {
        return Err(AppError::BadRequest("product_id is required".into()));
    }
    let entry = state.watcher.link_manual(id, product_id).await?;
    info!(
        target = "ingest.api",
        operator = %operator.name,
        entry_id = id,
        product_id,
        "folder linked by operator"
    );
    Ok(Json(entry))
}

async fn watcher_delete(
    State(state): State<AppState>,
    Extension(operator): Extension<Operator>,
    Path(id): Path<i64>,
) -> Result<StatusCode, AppError> {
    crate::metrics::inc_requests("/watcher/entries/delete");
    state.watcher.delete(id).await?;
    info!(
        target = "ingest.api",
        operator = %operator.name,
        entry_id = id,
        "watch log entry deleted"
    );
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct CreateJobRequest {
    product_id: String,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateJobResponse {
    job_id: String,
}

async fn create_job(
    State(state): State<AppState>,
    Json(payload): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<CreateJobResponse>), AppError> {
    crate::metrics::inc_requests("/jobs");
    let product_id = payload.product_id.trim();
    if product_id.is_empty() {
        return Err(AppError::BadRequest("product_id is required".into()));
    }
    let job_id = state.runner.submit(product_id, payload.title).await?;
    Ok((StatusCode::ACCEPTED, Json(CreateJobResponse { job_id })))
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Json<Vec<PipelineJob>> {
    crate::metrics::inc_requests("/jobs/list");
    Json(state.jobs.list(query.limit() as usize).await)
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PipelineJob>, AppError> {
    crate::metrics::inc_requests("/jobs/get");
    state
        .jobs
        .get(&id)
        .await?
        .map(Json)
        .ok_or(AppError::Job(JobError::NotFound(id)))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    crate::metrics::inc_requests("/jobs/cancel");
    let cancelled = state.jobs.cancel_job(&id).await?;
    Ok(Json(json!({ "job_id": id, "cancelled": cancelled })))
}

type EventStream = BoxStream<'static, Result<Event, Infallible>>;

/// Live step and progress events for one job. Starts with a `snapshot` of the
/// job and ends once the job finishes.
async fn job_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<KeepAliveStream<EventStream>>, AppError> {
    crate::metrics::inc_requests("/jobs/events");
    let known = state.jobs.get(&id).await?;
    if known.is_none() {
        return Err(AppError::Job(JobError::NotFound(id)));
    }
    // Snapshot after subscribing so no transition falls between the two.
    let rx = state.jobs.bus().subscribe_job(&id).await;
    let job = state
        .jobs
        .get(&id)
        .await?
        .ok_or(AppError::Job(JobError::NotFound(id)))?;

    let snapshot = Event::default()
        .event("snapshot")
        .json_data(&job)
        .unwrap_or_else(|_| Event::default().event("snapshot"));
    let head = stream::once(async move { Ok::<_, Infallible>(snapshot) });
    let stream: EventStream = if job.status.is_terminal() {
        head.boxed()
    } else {
        head.chain(event_stream(rx, true)).boxed()
    };
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Every job's events, for a global activity feed.
async fn all_job_events(State(state): State<AppState>) -> Sse<KeepAliveStream<EventStream>> {
    crate::metrics::inc_requests("/jobs/events/all");
    let rx = state.jobs.bus().subscribe_all();
    Sse::new(event_stream(rx, false)).keep_alive(KeepAlive::default())
}

fn event_stream(rx: broadcast::Receiver<JobEvent>, end_on_terminal: bool) -> EventStream {
    stream::unfold(Some(rx), move |rx| async move {
        let mut rx = rx?;
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let finished = end_on_terminal
                        && matches!(
                            &event,
                            JobEvent::StepUpdated { job_status, .. } if job_status.is_terminal()
                        );
                    let Ok(sse) = Event::default().event(event.name()).json_data(&event) else {
                        continue;
                    };
                    let next = if finished { None } else { Some(rx) };
                    return Some((Ok::<_, Infallible>(sse), next));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(target = "ingest.api", skipped, "event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

#[derive(Debug)]
enum AppError {
    BadRequest(String),
    Service(ServiceError),
    Job(JobError),
    Workflow(WorkflowError),
}

impl From<ServiceError> for AppError {
    fn from(value: ServiceError) -> Self {
        Self::Service(value)
    }
}

impl From<JobError> for AppError {
    fn from(value: JobError) -> Self {
        Self::Job(value)
    }
}

impl From<WorkflowError> for AppError {
    fn from(value: WorkflowError) -> Self {
        Self::Workflow(value)
    }
}

impl AppError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "invalid_input"),
            AppError::Service(err) => match err {
                ServiceError::NoRoot => (StatusCode::BAD_REQUEST, "watch_root_missing"),
                ServiceError::AlreadyRunning | ServiceError::NotRunning => {
                    (StatusCode::CONFLICT, "watcher_state")
                }
                ServiceError::EntryNotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
                ServiceError::ProductNotFound(_) => (StatusCode::NOT_FOUND, "product_not_found"),
                ServiceError::NotLinkable(_) => (StatusCode::CONFLICT, "not_linkable"),
                ServiceError::Catalog(_) => (StatusCode::BAD_GATEWAY, "catalog_error"),
                ServiceError::WatchLog(_) | ServiceError::Io(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "internal")
                }
            },
            AppError::Job(err) | AppError::Workflow(WorkflowError::Job(err)) => match err {
                JobError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
                JobError::UnknownStep { .. } => (StatusCode::BAD_REQUEST, "unknown_step"),
                JobError::Database(_) | JobError::Corrupt(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "internal")
                }
            },
            AppError::Workflow(WorkflowError::QueueClosed) => {
                (StatusCode::SERVICE_UNAVAILABLE, "queue_unavailable")
            }
        }
    }

    fn detail(&self) -> String {
        match self {
            AppError::BadRequest(message) => message.clone(),
            AppError::Service(err) => err.to_string(),
            AppError::Job(err) => err.to_string(),
            AppError::Workflow(err) => err.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            error!(target = "ingest.api", error = %self.detail(), "request failed");
        }
        let payload = ApiError {
            error: code.to_string(),
            detail: Some(self.detail()),
        };
        (status, Json(payload)).into_response()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use config::{ShopifySettings, WatchSettings};
    use tower::ServiceExt;

    async fn test_state() -> AppState {
        let pool = db::memory_pool().await;
        let watch_log = WatchLog::new(pool.clone());
        let catalog = Arc::new(ShopifyClient::new(&ShopifySettings {
            store_domain: String::new(),
            access_token: String::new(),
            api_version: "2024-10".into(),
        }));
        let settings = Arc::new(WatchSettings::default());
        let stabilizer = Stabilizer::new(settings.stabilize_window);
        let pipeline = FolderPipeline::new(
            watch_log.clone(),
            stabilizer.clone(),
            ProductMatcher::new(catalog.clone(), matcher::DEFAULT_THRESHOLD),
            ImageUploader::new(catalog.clone(), None),
            settings.clone(),
        );
        let watcher = WatchService::new(pipeline, stabilizer, watch_log, catalog.clone(), settings);
        let jobs = JobStore::new(10, WORKFLOW_STEPS, Arc::new(events::EventBus::new()), Some(pool));
        let image_service = ImageServiceClient::new("http://127.0.0.1:9");
        let (runner, _worker) =
            WorkflowRunner::spawn(jobs.clone(), catalog, Arc::new(image_service.clone()), 4);
        AppState {
            watcher,
            jobs,
            runner,
            image_service,
            prometheus_handle: PrometheusBuilder::new().build_recorder().handle(),
        }
    }

    fn event_routes(state: AppState) -> Router {
        Router::new()
            .route("/jobs/events", get(all_job_events))
            .route("/jobs/{id}/events", get(job_events))
            .with_state(state)
    }

    async fn read(app: Router, uri: &str) -> (StatusCode, Option<String>, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).expect("request"))
            .await
            .expect("response");
        let status = response.status();
        let content_type = response
            .headers()
            .get(axum::http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = axum::body::to_bytes(response.into_body(), 256 * 1024)
            .await
            .expect("body");
        (status, content_type, String::from_utf8_lossy(&bytes).into_owned())
    }

    #[tokio::test]
    async fn unknown_job_stream_is_not_found_and_opens_no_topic() {
        let state = test_state().await;
        let bus = state.jobs.bus().clone();

        for n in 0..20 {
            let uri = format!("/jobs/nope-{n}/events");
            let (status, _, body) = read(event_routes(state.clone()), &uri).await;
            assert_eq!(status, StatusCode::NOT_FOUND);
            assert!(body.contains("not_found"));
        }
        assert_eq!(bus.topic_count().await, 0);
    }

    #[tokio::test]
    async fn finished_job_stream_sends_snapshot_and_ends() {
        let state = test_state().await;
        let id = state.jobs.create_job("42", None).await.expect("create");
        assert!(state.jobs.cancel_job(&id).await.expect("cancel"));

        let (status, content_type, body) =
            read(event_routes(state), &format!("/jobs/{id}/events")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some("text/event-stream"));
        assert!(body.contains("event: snapshot"));
        assert!(body.contains("\"status\":\"failed\""));
    }
}
