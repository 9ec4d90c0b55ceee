//! Axum + Askama ops surface: HTML dashboard plus JSON endpoints for queue
//! health, recovery actions and enqueueing.

use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use offerwatch_core::{
    NewJob, DEFAULT_MAX_ATTEMPTS, JOB_KIND_HYDRATE_IMAGES, JOB_KIND_OFFER_REFRESH, JOB_KIND_REFRESH_STALE,
};
use offerwatch_sync::{IngestionStore, JobQueue, OpsActionRequest, OpsService, OpsSnapshot, SyncConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "offerwatch-web";

const KNOWN_JOB_KINDS: [&str; 3] = [JOB_KIND_OFFER_REFRESH, JOB_KIND_REFRESH_STALE, JOB_KIND_HYDRATE_IMAGES];

#[derive(Clone)]
pub struct AppState {
    pub ops: OpsService,
    pub queue: JobQueue,
}

impl AppState {
    pub fn new(store: Arc<dyn IngestionStore>, ops: OpsService) -> Self {
        Self {
            queue: JobQueue::new(store),
            ops,
        }
    }

    pub fn from_store(store: Arc<dyn IngestionStore>) -> Self {
        let ops = OpsService::new(store.clone());
        Self::new(store, ops)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotQuery {
    pub stale_queued_minutes: Option<i64>,
    pub stuck_running_minutes: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueRequest {
    pub kind: String,
    #[serde(default)]
    pub payload: JsonValue,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub max_attempts: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueResponse {
    pub job_id: i64,
    pub deduped: bool,
}

struct RunRow {
    id: i64,
    job_kind: String,
    status: String,
    started_at: String,
    finished_at: String,
    scanned: i32,
    updated: i32,
    changed: i32,
    failed: i32,
}

#[derive(Template)]
#[template(path = "ops.html")]
struct OpsTemplate {
    snapshot: OpsSnapshot,
    generated_at: String,
    runs: Vec<RunRow>,
}

fn display_time(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/ops/snapshot", get(snapshot_handler))
        .route("/ops/actions", post(action_handler))
        .route("/ops/jobs", post(enqueue_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: &SyncConfig) -> anyhow::Result<()> {
    let port: u16 = std::env::var("OFFERWATCH_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let store: Arc<dyn IngestionStore> = offerwatch_sync::connect_store(config).await?;
    let state = AppState::new(store.clone(), offerwatch_sync::build_ops(config, store));
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "ops web listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.ops.snapshot(None, None).await {
        Ok(snapshot) => {
            let runs = snapshot
                .recent_runs
                .iter()
                .map(|run| RunRow {
                    id: run.id,
                    job_kind: run.job_kind.clone(),
                    status: run.status.to_string(),
                    started_at: display_time(run.started_at),
                    finished_at: run.finished_at.map(display_time).unwrap_or_else(|| "-".into()),
                    scanned: run.counters.scanned,
                    updated: run.counters.updated,
                    changed: run.counters.changed,
                    failed: run.counters.failed,
                })
                .collect();
            render_html(OpsTemplate {
                generated_at: display_time(snapshot.generated_at),
                snapshot,
                runs,
            })
        }
        Err(err) => server_error(err.into()),
    }
}

async fn snapshot_handler(State(state): State<Arc<AppState>>, Query(query): Query<SnapshotQuery>) -> Response {
    match state
        .ops
        .snapshot(query.stale_queued_minutes, query.stuck_running_minutes)
        .await
    {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(err) => json_error(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

async fn action_handler(State(state): State<Arc<AppState>>, Json(request): Json<OpsActionRequest>) -> Response {
    match state.ops.run_action(&request).await {
        Ok(result) => Json(result).into_response(),
        Err(err) => {
            error!(action = request.action.as_str(), error = %err, "ops action failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
        }
    }
}

async fn enqueue_handler(State(state): State<Arc<AppState>>, Json(request): Json<EnqueueRequest>) -> Response {
    if !KNOWN_JOB_KINDS.contains(&request.kind.as_str()) {
        return json_error(StatusCode::BAD_REQUEST, &format!("unsupported job kind: {}", request.kind));
    }
    let mut job = NewJob::new(request.kind, request.payload)
        .with_max_attempts(request.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS));
    if let Some(priority) = request.priority {
        job = job.with_priority(priority);
    }
    if let Some(key) = request.idempotency_key.filter(|k| !k.trim().is_empty()) {
        job = job.with_idempotency_key(key);
    }
    match state.queue.enqueue(job).await {
        Ok(outcome) => {
            let status = if outcome.deduped {
                StatusCode::OK
            } else {
                StatusCode::CREATED
            };
            (
                status,
                Json(EnqueueResponse {
                    job_id: outcome.job_id,
                    deduped: outcome.deduped,
                }),
            )
                .into_response()
        }
        Err(err) => json_error(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}
