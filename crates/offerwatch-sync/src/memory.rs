//! In-process store with the same semantics as the Postgres backend. Every
//! operation runs under one mutex, which stands in for row locks.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use offerwatch_core::{
    CanonicalMapping, CanonicalType, EnqueueOutcome, EntityType, IngestionEntity, IngestionJob,
    IngestionRun, IngestionSource, JobStatus, NewJob, NewSnapshot, Offer, OfferChange, OfferPatch,
    RunCounters, RunStatus, SnapshotRecord,
};
use offerwatch_storage::BackoffPolicy;
use tokio::sync::Mutex;

use crate::store::{retry_at, FailedAttempt, IngestionStore, OfferFreshness, QueueCounts, StoreError};

#[derive(Debug, Default)]
struct State {
    next_id: i64,
    jobs: BTreeMap<i64, IngestionJob>,
    sources: BTreeMap<i64, IngestionSource>,
    entities: BTreeMap<i64, IngestionEntity>,
    snapshots: BTreeMap<i64, SnapshotRecord>,
    mappings: BTreeMap<i64, CanonicalMapping>,
    offers: BTreeMap<i64, Offer>,
    runs: BTreeMap<i64, IngestionRun>,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog-owned offers are created outside the ingestion core.
    pub async fn insert_offer(&self, offer: Offer) {
        let mut state = self.state.lock().await;
        state.next_id = state.next_id.max(offer.id);
        state.offers.insert(offer.id, offer);
    }

    pub async fn jobs(&self) -> Vec<IngestionJob> {
        self.state.lock().await.jobs.values().cloned().collect()
    }

    pub async fn update_job(&self, job_id: i64, update: impl FnOnce(&mut IngestionJob)) {
        if let Some(job) = self.state.lock().await.jobs.get_mut(&job_id) {
            update(job);
        }
    }

    pub async fn snapshot_count(&self) -> usize {
        self.state.lock().await.snapshots.len()
    }

    pub async fn mapping_count(&self) -> usize {
        self.state.lock().await.mappings.len()
    }
}

fn lock_time(job: &IngestionJob) -> DateTime<Utc> {
    job.locked_at.unwrap_or(job.updated_at)
}

fn take_limit(limit: i64) -> usize {
    limit.max(0) as usize
}

fn requeue(job: &mut IngestionJob, now: DateTime<Utc>) {
    job.status = JobStatus::Queued;
    job.locked_at = None;
    job.locked_by = None;
    job.finished_at = None;
    job.run_after = now;
    job.updated_at = now;
}

#[async_trait]
impl IngestionStore for MemoryStore {
    async fn enqueue_job(&self, job: &NewJob, now: DateTime<Utc>) -> Result<EnqueueOutcome, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(key) = &job.idempotency_key {
            if let Some(existing) = state
                .jobs
                .values()
                .find(|j| j.idempotency_key.as_deref() == Some(key.as_str()))
            {
                return Ok(EnqueueOutcome {
                    job_id: existing.id,
                    deduped: true,
                });
            }
        }
        let id = state.next_id();
        state.jobs.insert(
            id,
            IngestionJob {
                id,
                kind: job.kind.clone(),
                payload: job.payload.clone(),
                status: JobStatus::Queued,
                priority: job.priority,
                attempts: 0,
                max_attempts: job.max_attempts,
                run_after: now,
                locked_at: None,
                locked_by: None,
                last_error: None,
                idempotency_key: job.idempotency_key.clone(),
                created_at: now,
                updated_at: now,
                finished_at: None,
            },
        );
        Ok(EnqueueOutcome {
            job_id: id,
            deduped: false,
        })
    }

    async fn claim_job(
        &self,
        worker_id: &str,
        kinds: Option<&[String]>,
        now: DateTime<Utc>,
    ) -> Result<Option<IngestionJob>, StoreError> {
        let mut state = self.state.lock().await;
        let next = state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Queued && j.run_after <= now)
            .filter(|j| kinds.is_none_or(|k| k.iter().any(|kind| kind == &j.kind)))
            .min_by_key(|j| (j.priority, j.run_after, j.id))
            .map(|j| j.id);
        let Some(id) = next else {
            return Ok(None);
        };
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };
        job.status = JobStatus::Running;
        job.locked_at = Some(now);
        job.locked_by = Some(worker_id.to_string());
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn complete_job(&self, job_id: i64, worker_id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Running && job.locked_by.as_deref() == Some(worker_id) => {
                job.status = JobStatus::Success;
                job.finished_at = Some(now);
                job.locked_at = None;
                job.locked_by = None;
                job.last_error = None;
                job.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail_job(
        &self,
        job_id: i64,
        worker_id: &str,
        error: &str,
        backoff: &BackoffPolicy,
        now: DateTime<Utc>,
    ) -> Result<Option<FailedAttempt>, StoreError> {
        let mut state = self.state.lock().await;
        let Some(job) = state.jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        if job.status != JobStatus::Running || job.locked_by.as_deref() != Some(worker_id) {
            return Ok(None);
        }
        job.attempts += 1;
        job.last_error = Some(error.to_string());
        job.locked_at = None;
        job.locked_by = None;
        job.updated_at = now;
        let terminal = job.attempts >= job.max_attempts;
        if terminal {
            job.status = JobStatus::Failed;
            job.finished_at = Some(now);
        } else {
            job.status = JobStatus::Queued;
            job.run_after = retry_at(backoff, job.attempts, now);
        }
        Ok(Some(FailedAttempt {
            job: job.clone(),
            terminal,
        }))
    }

    async fn heartbeat_job(&self, job_id: i64, worker_id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.jobs.get_mut(&job_id) {
            Some(job)
                if job.status == JobStatus::Running && job.locked_by.as_deref() == Some(worker_id) =>
            {
                job.locked_at = Some(now);
                job.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_job(&self, job_id: i64) -> Result<Option<IngestionJob>, StoreError> {
        Ok(self.state.lock().await.jobs.get(&job_id).cloned())
    }

    async fn queue_counts(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        stuck_before: DateTime<Utc>,
    ) -> Result<QueueCounts, StoreError> {
        let state = self.state.lock().await;
        let mut counts = QueueCounts::default();
        for job in state.jobs.values() {
            match job.status {
                JobStatus::Queued => {
                    counts.queued += 1;
                    if job.run_after <= now {
                        counts.ready_now += 1;
                    }
                    if job.run_after < stale_before {
                        counts.stale_queued += 1;
                    }
                }
                JobStatus::Running => {
                    counts.running += 1;
                    if lock_time(job) < stuck_before {
                        counts.stuck_running += 1;
                    }
                }
                JobStatus::Success => counts.success += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn retry_failed_jobs(&self, limit: i64, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut ids: Vec<(DateTime<Utc>, i64)> = state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Failed)
            .map(|j| (j.updated_at, j.id))
            .collect();
        ids.sort();
        let mut touched = 0;
        for (_, id) in ids.into_iter().take(take_limit(limit)) {
            if let Some(job) = state.jobs.get_mut(&id) {
                requeue(job, now);
                job.attempts = 0;
                job.last_error = None;
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn requeue_stale_queued_jobs(
        &self,
        limit: i64,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut ids: Vec<(DateTime<Utc>, i64)> = state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Queued && j.run_after < stale_before)
            .map(|j| (j.run_after, j.id))
            .collect();
        ids.sort();
        let mut touched = 0;
        for (_, id) in ids.into_iter().take(take_limit(limit)) {
            if let Some(job) = state.jobs.get_mut(&id) {
                requeue(job, now);
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn recover_stuck_running_jobs(
        &self,
        limit: i64,
        stuck_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut ids: Vec<(DateTime<Utc>, i64)> = state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Running && lock_time(j) < stuck_before)
            .map(|j| (lock_time(j), j.id))
            .collect();
        ids.sort();
        let mut touched = 0;
        for (_, id) in ids.into_iter().take(take_limit(limit)) {
            if let Some(job) = state.jobs.get_mut(&id) {
                requeue(job, now);
                job.last_error = None;
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn ensure_source(&self, slug: &str, display_name: &str) -> Result<IngestionSource, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.sources.values().find(|s| s.slug == slug) {
            return Ok(existing.clone());
        }
        let id = state.next_id();
        let source = IngestionSource {
            id,
            slug: slug.to_string(),
            display_name: display_name.to_string(),
        };
        state.sources.insert(id, source.clone());
        Ok(source)
    }

    async fn upsert_entity(
        &self,
        source_id: i64,
        entity_type: EntityType,
        source_entity_id: &str,
        url: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<IngestionEntity, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.entities.values_mut().find(|e| {
            e.source_id == source_id && e.entity_type == entity_type && e.source_entity_id == source_entity_id
        }) {
            existing.active = true;
            existing.last_seen_at = now;
            if let Some(url) = url {
                existing.url = Some(url.to_string());
            }
            return Ok(existing.clone());
        }
        let id = state.next_id();
        let entity = IngestionEntity {
            id,
            source_id,
            entity_type,
            source_entity_id: source_entity_id.to_string(),
            url: url.map(ToString::to_string),
            active: true,
            last_seen_at: now,
            created_at: now,
        };
        state.entities.insert(id, entity.clone());
        Ok(entity)
    }

    async fn deactivate_unseen_entities(
        &self,
        entity_type: EntityType,
        seen_before: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut touched = 0;
        for entity in state.entities.values_mut() {
            if entity.active && entity.entity_type == entity_type && entity.last_seen_at < seen_before {
                entity.active = false;
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn insert_snapshot(&self, snapshot: &NewSnapshot, now: DateTime<Utc>) -> Result<Option<i64>, StoreError> {
        let mut state = self.state.lock().await;
        let duplicate = state
            .snapshots
            .values()
            .any(|s| s.entity_id == snapshot.entity_id && s.content_hash == snapshot.content_hash);
        if duplicate {
            return Ok(None);
        }
        let id = state.next_id();
        state.snapshots.insert(
            id,
            SnapshotRecord {
                id,
                entity_id: snapshot.entity_id,
                fetched_at: snapshot.fetched_at,
                http_status: snapshot.http_status,
                raw_json: snapshot.raw_json.clone(),
                extracted_fields: snapshot.extracted_fields.clone(),
                content_hash: snapshot.content_hash.clone(),
                created_at: now,
            },
        );
        Ok(Some(id))
    }

    async fn snapshots_for_entity(&self, entity_id: i64) -> Result<Vec<SnapshotRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .snapshots
            .values()
            .filter(|s| s.entity_id == entity_id)
            .cloned()
            .collect())
    }

    async fn upsert_mapping(
        &self,
        entity_id: i64,
        canonical_type: CanonicalType,
        canonical_id: i64,
        match_method: &str,
        confidence: f64,
        now: DateTime<Utc>,
    ) -> Result<CanonicalMapping, StoreError> {
        let mut state = self.state.lock().await;
        let mapping = state.mappings.entry(entity_id).or_insert_with(|| CanonicalMapping {
            entity_id,
            canonical_type,
            canonical_id,
            match_method: match_method.to_string(),
            confidence,
            created_at: now,
            updated_at: now,
        });
        mapping.canonical_type = canonical_type;
        mapping.canonical_id = canonical_id;
        mapping.match_method = match_method.to_string();
        mapping.confidence = confidence;
        mapping.updated_at = now;
        Ok(mapping.clone())
    }

    async fn mapping_for(&self, entity_id: i64) -> Result<Option<CanonicalMapping>, StoreError> {
        Ok(self.state.lock().await.mappings.get(&entity_id).cloned())
    }

    async fn get_offer(&self, offer_id: i64) -> Result<Option<Offer>, StoreError> {
        Ok(self.state.lock().await.offers.get(&offer_id).cloned())
    }

    async fn stale_offers(
        &self,
        checked_before: DateTime<Utc>,
        skip_sources: &[String],
        limit: i64,
    ) -> Result<Vec<Offer>, StoreError> {
        let state = self.state.lock().await;
        let mut offers: Vec<Offer> = state
            .offers
            .values()
            .filter(|o| o.active && !skip_sources.contains(&o.source_slug))
            .filter(|o| o.last_checked_at.is_none_or(|at| at < checked_before))
            .cloned()
            .collect();
        // `None` sorts before `Some`, so never-checked offers come first.
        offers.sort_by_key(|o| (o.last_checked_at, o.id));
        offers.truncate(take_limit(limit));
        Ok(offers)
    }

    async fn offers_missing_images(&self, skip_sources: &[String], limit: i64) -> Result<Vec<Offer>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .offers
            .values()
            .filter(|o| o.active && !skip_sources.contains(&o.source_slug))
            .filter(|o| o.product_image_url.as_deref().is_none_or(|u| u.trim().is_empty()))
            .take(take_limit(limit))
            .cloned()
            .collect())
    }

    async fn offer_freshness(&self, fresh_after: DateTime<Utc>) -> Result<OfferFreshness, StoreError> {
        let state = self.state.lock().await;
        let active = state.offers.values().filter(|o| o.active);
        let mut out = OfferFreshness::default();
        for offer in active {
            out.active += 1;
            if offer.last_checked_at.is_some_and(|at| at >= fresh_after) {
                out.fresh += 1;
            }
        }
        Ok(out)
    }

    async fn apply_offer_patch(
        &self,
        offer_id: i64,
        patch: &OfferPatch,
        checked_at: DateTime<Utc>,
    ) -> Result<Option<OfferChange>, StoreError> {
        let mut state = self.state.lock().await;
        let Some(offer) = state.offers.get_mut(&offer_id) else {
            return Ok(None);
        };
        let before = offer.clone();
        let after = patch.merge_into(&before, checked_at);
        *offer = after.clone();
        Ok(Some(OfferChange { before, after }))
    }

    async fn start_run(&self, source_slug: &str, job_kind: &str, now: DateTime<Utc>) -> Result<IngestionRun, StoreError> {
        let mut state = self.state.lock().await;
        let id = state.next_id();
        let run = IngestionRun {
            id,
            source_slug: source_slug.to_string(),
            job_kind: job_kind.to_string(),
            status: RunStatus::Running,
            started_at: now,
            finished_at: None,
            error: None,
            counters: RunCounters::default(),
        };
        state.runs.insert(id, run.clone());
        Ok(run)
    }

    async fn finish_run(
        &self,
        run_id: i64,
        status: RunStatus,
        counters: RunCounters,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let run = state.runs.get_mut(&run_id).ok_or(StoreError::NotFound {
            entity: "ingestion run",
            id: run_id,
        })?;
        run.status = status;
        run.counters = counters;
        run.error = error.map(ToString::to_string);
        run.finished_at = Some(now);
        Ok(())
    }

    async fn recent_runs(&self, limit: i64) -> Result<Vec<IngestionRun>, StoreError> {
        let state = self.state.lock().await;
        let mut runs: Vec<IngestionRun> = state.runs.values().cloned().collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        runs.truncate(take_limit(limit));
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn offer(id: i64, last_checked_at: Option<DateTime<Utc>>) -> Offer {
        Offer {
            id,
            source_slug: "aquashop".into(),
            url: format!("https://aquashop.example/p/{id}"),
            active: true,
            price_cents: None,
            currency: None,
            in_stock: None,
            last_checked_at,
            product_image_url: None,
        }
    }

    #[tokio::test]
    async fn claim_orders_by_priority_then_run_after_then_id() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let late = store
            .enqueue_job(&NewJob::new("offer.refresh", json!({})).with_priority(50), now)
            .await
            .unwrap();
        let urgent = store
            .enqueue_job(&NewJob::new("offer.refresh", json!({})).with_priority(10), now + Duration::seconds(5))
            .await
            .unwrap();
        let tie = store
            .enqueue_job(&NewJob::new("offer.refresh", json!({})).with_priority(50), now)
            .await
            .unwrap();

        let at = now + Duration::seconds(10);
        let order: Vec<i64> = vec![
            store.claim_job("w", None, at).await.unwrap().unwrap().id,
            store.claim_job("w", None, at).await.unwrap().unwrap().id,
            store.claim_job("w", None, at).await.unwrap().unwrap().id,
        ];
        assert_eq!(order, vec![urgent.job_id, late.job_id, tie.job_id]);
        assert!(store.claim_job("w", None, at).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_skips_future_jobs_and_filters_kinds() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .enqueue_job(&NewJob::new("offers.refresh_stale", json!({})), now)
            .await
            .unwrap();
        store
            .enqueue_job(&NewJob::new("offer.refresh", json!({})), now + Duration::minutes(5))
            .await
            .unwrap();

        let kinds = vec!["offer.refresh".to_string()];
        assert!(store.claim_job("w", Some(&kinds), now).await.unwrap().is_none());
        let claimed = store
            .claim_job("w", Some(&kinds), now + Duration::minutes(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.kind, "offer.refresh");
        assert_eq!(claimed.locked_by.as_deref(), Some("w"));
    }

    #[tokio::test]
    async fn upsert_entity_is_keyed_by_source_type_and_id() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let source = store.ensure_source("aquashop", "Aquashop").await.unwrap();
        let again = store.ensure_source("aquashop", "Renamed").await.unwrap();
        assert_eq!(source.id, again.id);

        let first = store
            .upsert_entity(source.id, EntityType::Offer, "7", None, now)
            .await
            .unwrap();
        let later = now + Duration::hours(1);
        let second = store
            .upsert_entity(source.id, EntityType::Offer, "7", Some("https://aquashop.example/p/7"), later)
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.last_seen_at, later);
        assert_eq!(second.url.as_deref(), Some("https://aquashop.example/p/7"));

        let product = store
            .upsert_entity(source.id, EntityType::Product, "7", None, now)
            .await
            .unwrap();
        assert_ne!(product.id, first.id);
    }

    #[tokio::test]
    async fn unseen_entities_are_deactivated_until_sighted_again() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let source = store.ensure_source("aquashop", "Aquashop").await.unwrap();
        let old = store
            .upsert_entity(source.id, EntityType::Offer, "1", None, now - Duration::days(10))
            .await
            .unwrap();
        store
            .upsert_entity(source.id, EntityType::Offer, "2", None, now)
            .await
            .unwrap();
        store
            .upsert_entity(source.id, EntityType::Product, "1", None, now - Duration::days(10))
            .await
            .unwrap();

        let touched = store
            .deactivate_unseen_entities(EntityType::Offer, now - Duration::days(7))
            .await
            .unwrap();
        assert_eq!(touched, 1);
        let again = store
            .deactivate_unseen_entities(EntityType::Offer, now - Duration::days(7))
            .await
            .unwrap();
        assert_eq!(again, 0);

        let revived = store
            .upsert_entity(source.id, EntityType::Offer, "1", None, now)
            .await
            .unwrap();
        assert_eq!(revived.id, old.id);
        assert!(revived.active);
    }

    #[tokio::test]
    async fn stale_offers_put_never_checked_first() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.insert_offer(offer(1, Some(now - Duration::hours(30)))).await;
        store.insert_offer(offer(2, None)).await;
        store.insert_offer(offer(3, Some(now - Duration::hours(2)))).await;
        store.insert_offer(offer(4, Some(now - Duration::hours(48)))).await;

        let stale = store.stale_offers(now - Duration::hours(24), &[], 10).await.unwrap();
        let ids: Vec<i64> = stale.iter().map(|o| o.id).collect();
        assert_eq!(ids, vec![2, 4, 1]);

        let capped = store.stale_offers(now - Duration::hours(24), &[], 1).await.unwrap();
        assert_eq!(capped.len(), 1);
        assert_eq!(capped[0].id, 2);

        let mut paused = offer(5, None);
        paused.source_slug = "retired".into();
        store.insert_offer(paused).await;
        let skip = vec!["retired".to_string()];
        let filtered = store.stale_offers(now - Duration::hours(24), &skip, 10).await.unwrap();
        assert!(filtered.iter().all(|o| o.source_slug != "retired"));
        assert_eq!(filtered.len(), 3);
        assert_eq!(store.offers_missing_images(&skip, 10).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn finish_run_requires_existing_run() {
        let store = MemoryStore::new();
        let err = store
            .finish_run(99, RunStatus::Success, RunCounters::default(), None, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { id: 99, .. }));
    }
}
