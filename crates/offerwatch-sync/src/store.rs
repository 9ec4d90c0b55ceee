//! Persistence seam for the queue, observation log, mappings, runs and the
//! canonical offer write path.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use offerwatch_core::{
    CanonicalMapping, CanonicalType, EnqueueOutcome, EntityType, IngestionEntity, IngestionJob,
    IngestionRun, IngestionSource, NewJob, NewSnapshot, Offer, OfferChange, OfferPatch,
    ParseEnumError, RunCounters, RunStatus, SnapshotRecord,
};
use offerwatch_storage::BackoffPolicy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt row: {0}")]
    Decode(#[from] ParseEnumError),
    #[error("encoding json column: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },
    #[error("{0}")]
    Invalid(String),
}

/// Queue population at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub queued: i64,
    pub running: i64,
    pub success: i64,
    pub failed: i64,
    pub ready_now: i64,
    pub stale_queued: i64,
    pub stuck_running: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferFreshness {
    pub active: i64,
    pub fresh: i64,
}

/// Result of recording a failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedAttempt {
    pub job: IngestionJob,
    pub terminal: bool,
}

#[async_trait]
pub trait IngestionStore: Send + Sync {
    async fn enqueue_job(&self, job: &NewJob, now: DateTime<Utc>) -> Result<EnqueueOutcome, StoreError>;

    /// Claims the first eligible queued job, optionally restricted to `kinds`.
    async fn claim_job(
        &self,
        worker_id: &str,
        kinds: Option<&[String]>,
        now: DateTime<Utc>,
    ) -> Result<Option<IngestionJob>, StoreError>;

    /// Returns false when the job was not running.
    /// Marks a running job held by `worker_id` successful.
    async fn complete_job(&self, job_id: i64, worker_id: &str, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Records a failed attempt for a running job held by `worker_id`.
    async fn fail_job(
        &self,
        job_id: i64,
        worker_id: &str,
        error: &str,
        backoff: &BackoffPolicy,
        now: DateTime<Utc>,
    ) -> Result<Option<FailedAttempt>, StoreError>;

    /// Renews the lock of a running job still held by `worker_id`.
    async fn heartbeat_job(&self, job_id: i64, worker_id: &str, now: DateTime<Utc>) -> Result<bool, StoreError>;

    async fn get_job(&self, job_id: i64) -> Result<Option<IngestionJob>, StoreError>;

    async fn queue_counts(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        stuck_before: DateTime<Utc>,
    ) -> Result<QueueCounts, StoreError>;

    async fn retry_failed_jobs(&self, limit: i64, now: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn requeue_stale_queued_jobs(
        &self,
        limit: i64,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    async fn recover_stuck_running_jobs(
        &self,
        limit: i64,
        stuck_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    async fn ensure_source(&self, slug: &str, display_name: &str) -> Result<IngestionSource, StoreError>;

    async fn upsert_entity(
        &self,
        source_id: i64,
        entity_type: EntityType,
        source_entity_id: &str,
        url: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<IngestionEntity, StoreError>;

    /// Soft-deactivates entities of one type not sighted since `seen_before`.
    async fn deactivate_unseen_entities(
        &self,
        entity_type: EntityType,
        seen_before: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Insert-or-ignore on (entity_id, content_hash); `None` when deduplicated.
    async fn insert_snapshot(&self, snapshot: &NewSnapshot, now: DateTime<Utc>) -> Result<Option<i64>, StoreError>;

    async fn snapshots_for_entity(&self, entity_id: i64) -> Result<Vec<SnapshotRecord>, StoreError>;

    async fn upsert_mapping(
        &self,
        entity_id: i64,
        canonical_type: CanonicalType,
        canonical_id: i64,
        match_method: &str,
        confidence: f64,
        now: DateTime<Utc>,
    ) -> Result<CanonicalMapping, StoreError>;

    async fn mapping_for(&self, entity_id: i64) -> Result<Option<CanonicalMapping>, StoreError>;

    async fn get_offer(&self, offer_id: i64) -> Result<Option<Offer>, StoreError>;

    /// Active offers never checked or checked before `checked_before`, oldest
    /// first, leaving out offers from `skip_sources`.
    async fn stale_offers(
        &self,
        checked_before: DateTime<Utc>,
        skip_sources: &[String],
        limit: i64,
    ) -> Result<Vec<Offer>, StoreError>;

    async fn offers_missing_images(&self, skip_sources: &[String], limit: i64) -> Result<Vec<Offer>, StoreError>;

    async fn offer_freshness(&self, fresh_after: DateTime<Utc>) -> Result<OfferFreshness, StoreError>;

    /// Applies the patch in one row update and returns before/after values.
    async fn apply_offer_patch(
        &self,
        offer_id: i64,
        patch: &OfferPatch,
        checked_at: DateTime<Utc>,
    ) -> Result<Option<OfferChange>, StoreError>;

    async fn start_run(&self, source_slug: &str, job_kind: &str, now: DateTime<Utc>) -> Result<IngestionRun, StoreError>;

    async fn finish_run(
        &self,
        run_id: i64,
        status: RunStatus,
        counters: RunCounters,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn recent_runs(&self, limit: i64) -> Result<Vec<IngestionRun>, StoreError>;
}

/// `run_after` for the next attempt after `attempts` failures.
pub fn retry_at(backoff: &BackoffPolicy, attempts: i32, now: DateTime<Utc>) -> DateTime<Utc> {
    let index = attempts.saturating_sub(1).max(0) as usize;
    let delay = backoff.delay_for_attempt(index);
    now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::hours(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn retry_schedule_doubles_and_caps() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let policy = BackoffPolicy::job_retry();
        assert_eq!(retry_at(&policy, 1, now), now + chrono::Duration::seconds(60));
        assert_eq!(retry_at(&policy, 2, now), now + chrono::Duration::seconds(120));
        assert_eq!(retry_at(&policy, 3, now), now + chrono::Duration::seconds(240));
        assert_eq!(retry_at(&policy, 12, now), now + chrono::Duration::hours(1));
    }
}
