//! Queue health snapshot and operator recovery actions.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use offerwatch_core::{minute_bucket_key, EnqueueOutcome, IngestionRun, NewJob, FRESHNESS_REFRESH_KINDS};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::config::{
    clamp_window_hours, DEFAULT_FRESHNESS_WINDOW_HOURS, DEFAULT_OPS_LIMIT, DEFAULT_STALE_QUEUED_MINUTES,
    DEFAULT_STUCK_RUNNING_MINUTES, FRESHNESS_SLO_PERCENT, MAX_OPS_LIMIT, MAX_THRESHOLD_MINUTES,
};
use crate::store::{IngestionStore, QueueCounts, StoreError};

const RECENT_RUNS: i64 = 10;

pub fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_OPS_LIMIT).clamp(1, MAX_OPS_LIMIT)
}

pub fn clamp_minutes(minutes: Option<i64>, default: i64) -> i64 {
    minutes.unwrap_or(default).clamp(1, MAX_THRESHOLD_MINUTES)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpsThresholds {
    pub stale_queued_minutes: i64,
    pub stuck_running_minutes: i64,
    pub freshness_window_hours: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpsSnapshot {
    pub generated_at: DateTime<Utc>,
    pub queued: i64,
    pub running: i64,
    pub success: i64,
    pub failed: i64,
    pub ready_now: i64,
    pub stale_queued: i64,
    pub stuck_running: i64,
    pub active_offers: i64,
    pub fresh_offers: i64,
    pub freshness_percent: f64,
    pub freshness_slo_percent: f64,
    pub slo_met: bool,
    pub thresholds: OpsThresholds,
    pub recent_runs: Vec<IngestionRun>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpsAction {
    RetryFailedJobs,
    RequeueStaleQueuedJobs,
    RecoverStuckRunningJobs,
    EnqueueFreshnessRefresh,
}

impl OpsAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RetryFailedJobs => "retry_failed_jobs",
            Self::RequeueStaleQueuedJobs => "requeue_stale_queued_jobs",
            Self::RecoverStuckRunningJobs => "recover_stuck_running_jobs",
            Self::EnqueueFreshnessRefresh => "enqueue_freshness_refresh",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpsActionRequest {
    pub action: OpsAction,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub stale_queued_minutes: Option<i64>,
    #[serde(default)]
    pub stuck_running_minutes: Option<i64>,
}

impl OpsActionRequest {
    pub fn new(action: OpsAction) -> Self {
        Self {
            action,
            limit: None,
            stale_queued_minutes: None,
            stuck_running_minutes: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpsActionResult {
    pub action: OpsAction,
    pub limit: i64,
    /// Rows moved, or jobs newly created for enqueue actions.
    pub affected: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enqueued: Vec<EnqueuedJob>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueuedJob {
    pub kind: String,
    pub job_id: i64,
    pub deduped: bool,
}

#[derive(Clone)]
pub struct OpsService {
    store: Arc<dyn IngestionStore>,
    freshness_window_hours: i64,
}

impl OpsService {
    pub fn new(store: Arc<dyn IngestionStore>) -> Self {
        Self {
            store,
            freshness_window_hours: DEFAULT_FRESHNESS_WINDOW_HOURS,
        }
    }

    pub fn with_freshness_window_hours(mut self, hours: i64) -> Self {
        self.freshness_window_hours = clamp_window_hours(hours);
        self
    }

    pub async fn snapshot(
        &self,
        stale_queued_minutes: Option<i64>,
        stuck_running_minutes: Option<i64>,
    ) -> Result<OpsSnapshot, StoreError> {
        self.snapshot_at(Utc::now(), stale_queued_minutes, stuck_running_minutes)
            .await
    }

    pub async fn snapshot_at(
        &self,
        now: DateTime<Utc>,
        stale_queued_minutes: Option<i64>,
        stuck_running_minutes: Option<i64>,
    ) -> Result<OpsSnapshot, StoreError> {
        let thresholds = OpsThresholds {
            stale_queued_minutes: clamp_minutes(stale_queued_minutes, DEFAULT_STALE_QUEUED_MINUTES),
            stuck_running_minutes: clamp_minutes(stuck_running_minutes, DEFAULT_STUCK_RUNNING_MINUTES),
            freshness_window_hours: self.freshness_window_hours,
        };
        let QueueCounts {
            queued,
            running,
            success,
            failed,
            ready_now,
            stale_queued,
            stuck_running,
        } = self
            .store
            .queue_counts(
                now,
                now - Duration::minutes(thresholds.stale_queued_minutes),
                now - Duration::minutes(thresholds.stuck_running_minutes),
            )
            .await?;
        let freshness = self
            .store
            .offer_freshness(now - Duration::hours(thresholds.freshness_window_hours))
            .await?;
        let freshness_percent = if freshness.active == 0 {
            100.0
        } else {
            let pct = freshness.fresh as f64 * 100.0 / freshness.active as f64;
            (pct * 100.0).round() / 100.0
        };
        let recent_runs = self.store.recent_runs(RECENT_RUNS).await?;

        Ok(OpsSnapshot {
            generated_at: now,
            queued,
            running,
            success,
            failed,
            ready_now,
            stale_queued,
            stuck_running,
            active_offers: freshness.active,
            fresh_offers: freshness.fresh,
            freshness_percent,
            freshness_slo_percent: FRESHNESS_SLO_PERCENT,
            slo_met: freshness_percent >= FRESHNESS_SLO_PERCENT,
            thresholds,
            recent_runs,
        })
    }

    pub async fn run_action(&self, request: &OpsActionRequest) -> Result<OpsActionResult, StoreError> {
        match request.action {
            OpsAction::RetryFailedJobs => self.retry_failed_jobs(request.limit).await,
            OpsAction::RequeueStaleQueuedJobs => {
                self.requeue_stale_queued_jobs(request.limit, request.stale_queued_minutes)
                    .await
            }
            OpsAction::RecoverStuckRunningJobs => {
                self.recover_stuck_running_jobs(request.limit, request.stuck_running_minutes)
                    .await
            }
            OpsAction::EnqueueFreshnessRefresh => self.enqueue_freshness_refresh(request.limit).await,
        }
    }

    pub async fn retry_failed_jobs(&self, limit: Option<i64>) -> Result<OpsActionResult, StoreError> {
        let limit = clamp_limit(limit);
        let affected = self.store.retry_failed_jobs(limit, Utc::now()).await?;
        Ok(self.moved(OpsAction::RetryFailedJobs, limit, affected))
    }

    pub async fn requeue_stale_queued_jobs(
        &self,
        limit: Option<i64>,
        stale_queued_minutes: Option<i64>,
    ) -> Result<OpsActionResult, StoreError> {
        let limit = clamp_limit(limit);
        let minutes = clamp_minutes(stale_queued_minutes, DEFAULT_STALE_QUEUED_MINUTES);
        let now = Utc::now();
        let affected = self
            .store
            .requeue_stale_queued_jobs(limit, now - Duration::minutes(minutes), now)
            .await?;
        Ok(self.moved(OpsAction::RequeueStaleQueuedJobs, limit, affected))
    }

    pub async fn recover_stuck_running_jobs(
        &self,
        limit: Option<i64>,
        stuck_running_minutes: Option<i64>,
    ) -> Result<OpsActionResult, StoreError> {
        let limit = clamp_limit(limit);
        let minutes = clamp_minutes(stuck_running_minutes, DEFAULT_STUCK_RUNNING_MINUTES);
        let now = Utc::now();
        let affected = self
            .store
            .recover_stuck_running_jobs(limit, now - Duration::minutes(minutes), now)
            .await?;
        Ok(self.moved(OpsAction::RecoverStuckRunningJobs, limit, affected))
    }

    pub async fn enqueue_freshness_refresh(&self, limit: Option<i64>) -> Result<OpsActionResult, StoreError> {
        self.enqueue_freshness_refresh_at(limit, Utc::now()).await
    }

    /// One job per bulk kind, keyed by kind and minute so repeats within a
    /// minute collapse onto the same rows.
    pub async fn enqueue_freshness_refresh_at(
        &self,
        limit: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<OpsActionResult, StoreError> {
        let limit = clamp_limit(limit);
        let bucket = minute_bucket_key(now);
        let mut enqueued = Vec::with_capacity(FRESHNESS_REFRESH_KINDS.len());
        for kind in FRESHNESS_REFRESH_KINDS {
            let job = NewJob::new(kind, json!({ "limit": limit }))
                .with_idempotency_key(format!("{kind}:{bucket}"));
            let EnqueueOutcome { job_id, deduped } = self.store.enqueue_job(&job, now).await?;
            enqueued.push(EnqueuedJob {
                kind: kind.to_string(),
                job_id,
                deduped,
            });
        }
        let affected = enqueued.iter().filter(|j| !j.deduped).count() as u64;
        info!(limit, created = affected, bucket = %bucket, "freshness refresh enqueued");
        Ok(OpsActionResult {
            action: OpsAction::EnqueueFreshnessRefresh,
            limit,
            affected,
            enqueued,
        })
    }

    fn moved(&self, action: OpsAction, limit: i64, affected: u64) -> OpsActionResult {
        info!(action = action.as_str(), limit, affected, "ops action applied");
        OpsActionResult {
            action,
            limit,
            affected,
            enqueued: Vec::new(),
        }
    }
}
