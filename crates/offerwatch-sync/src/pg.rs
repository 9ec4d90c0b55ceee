//! Postgres backend. Claims use a `FOR UPDATE SKIP LOCKED` subselect inside a
//! single conditional update; idempotent inserts use `ON CONFLICT`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use offerwatch_core::{
    CanonicalMapping, CanonicalType, EnqueueOutcome, EntityType, IngestionEntity, IngestionJob,
    IngestionRun, IngestionSource, JobStatus, NewJob, NewSnapshot, Offer, OfferChange, OfferPatch,
    RunCounters, RunStatus, SnapshotRecord,
};
use offerwatch_storage::BackoffPolicy;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::info;

use crate::store::{retry_at, FailedAttempt, IngestionStore, OfferFreshness, QueueCounts, StoreError};

const JOB_COLUMNS: &str = "id, kind, payload, status, priority, attempts, max_attempts, run_after, \
     locked_at, locked_by, last_error, idempotency_key, created_at, updated_at, finished_at";

const OFFER_COLUMNS: &str =
    "id, source_slug, url, active, price_cents, currency, in_stock, last_checked_at, product_image_url";

const ENTITY_COLUMNS: &str =
    "id, source_id, entity_type, source_entity_id, url, active, last_seen_at, created_at";

const MAPPING_COLUMNS: &str =
    "entity_id, canonical_type, canonical_id, match_method, confidence, created_at, updated_at";

const RUN_COLUMNS: &str =
    "id, source_slug, job_kind, status, started_at, finished_at, error, scanned, updated, changed, failed";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(2))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

fn job_from_row(row: &PgRow) -> Result<IngestionJob, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(IngestionJob {
        id: row.try_get("id")?,
        kind: row.try_get("kind")?,
        payload: row.try_get("payload")?,
        status: status.parse()?,
        priority: row.try_get("priority")?,
        attempts: row.try_get("attempts")?,
        max_attempts: row.try_get("max_attempts")?,
        run_after: row.try_get("run_after")?,
        locked_at: row.try_get("locked_at")?,
        locked_by: row.try_get("locked_by")?,
        last_error: row.try_get("last_error")?,
        idempotency_key: row.try_get("idempotency_key")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}

fn offer_from_row(row: &PgRow) -> Result<Offer, StoreError> {
    Ok(Offer {
        id: row.try_get("id")?,
        source_slug: row.try_get("source_slug")?,
        url: row.try_get("url")?,
        active: row.try_get("active")?,
        price_cents: row.try_get("price_cents")?,
        currency: row.try_get("currency")?,
        in_stock: row.try_get("in_stock")?,
        last_checked_at: row.try_get("last_checked_at")?,
        product_image_url: row.try_get("product_image_url")?,
    })
}

fn entity_from_row(row: &PgRow) -> Result<IngestionEntity, StoreError> {
    let entity_type: String = row.try_get("entity_type")?;
    Ok(IngestionEntity {
        id: row.try_get("id")?,
        source_id: row.try_get("source_id")?,
        entity_type: entity_type.parse()?,
        source_entity_id: row.try_get("source_entity_id")?,
        url: row.try_get("url")?,
        active: row.try_get("active")?,
        last_seen_at: row.try_get("last_seen_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn mapping_from_row(row: &PgRow) -> Result<CanonicalMapping, StoreError> {
    let canonical_type: String = row.try_get("canonical_type")?;
    Ok(CanonicalMapping {
        entity_id: row.try_get("entity_id")?,
        canonical_type: canonical_type.parse()?,
        canonical_id: row.try_get("canonical_id")?,
        match_method: row.try_get("match_method")?,
        confidence: row.try_get("confidence")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn run_from_row(row: &PgRow) -> Result<IngestionRun, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(IngestionRun {
        id: row.try_get("id")?,
        source_slug: row.try_get("source_slug")?,
        job_kind: row.try_get("job_kind")?,
        status: status.parse()?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        error: row.try_get("error")?,
        counters: RunCounters {
            scanned: row.try_get("scanned")?,
            updated: row.try_get("updated")?,
            changed: row.try_get("changed")?,
            failed: row.try_get("failed")?,
        },
    })
}

fn snapshot_from_row(row: &PgRow) -> Result<SnapshotRecord, StoreError> {
    let http_status: Option<i32> = row.try_get("http_status")?;
    Ok(SnapshotRecord {
        id: row.try_get("id")?,
        entity_id: row.try_get("entity_id")?,
        fetched_at: row.try_get("fetched_at")?,
        http_status: http_status.and_then(|s| u16::try_from(s).ok()),
        raw_json: row.try_get("raw_json")?,
        extracted_fields: row.try_get("extracted_fields")?,
        content_hash: row.try_get("content_hash")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl IngestionStore for PgStore {
    async fn enqueue_job(&self, job: &NewJob, now: DateTime<Utc>) -> Result<EnqueueOutcome, StoreError> {
        let inserted: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO ingestion_jobs
                (kind, payload, status, priority, attempts, max_attempts, run_after,
                 idempotency_key, created_at, updated_at)
            VALUES ($1, $2, 'queued', $3, 0, $4, $5, $6, $5, $5)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&job.kind)
        .bind(&job.payload)
        .bind(job.priority)
        .bind(job.max_attempts)
        .bind(now)
        .bind(&job.idempotency_key)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(job_id) = inserted {
            return Ok(EnqueueOutcome {
                job_id,
                deduped: false,
            });
        }
        let key = job
            .idempotency_key
            .as_deref()
            .ok_or_else(|| StoreError::Invalid("insert conflict without idempotency key".into()))?;
        let job_id: i64 = sqlx::query_scalar("SELECT id FROM ingestion_jobs WHERE idempotency_key = $1")
            .bind(key)
            .fetch_one(&self.pool)
            .await?;
        Ok(EnqueueOutcome {
            job_id,
            deduped: true,
        })
    }

    async fn claim_job(
        &self,
        worker_id: &str,
        kinds: Option<&[String]>,
        now: DateTime<Utc>,
    ) -> Result<Option<IngestionJob>, StoreError> {
        let sql = format!(
            r#"
            UPDATE ingestion_jobs
               SET status = 'running', locked_at = $2, locked_by = $1, updated_at = $2
             WHERE id = (
                   SELECT id FROM ingestion_jobs
                    WHERE status = 'queued'
                      AND run_after <= $2
                      AND ($3::text[] IS NULL OR kind = ANY($3))
                    ORDER BY priority ASC, run_after ASC, id ASC
                    FOR UPDATE SKIP LOCKED
                    LIMIT 1)
               AND status = 'queued'
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(worker_id)
            .bind(now)
            .bind(kinds.map(<[String]>::to_vec))
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn complete_job(&self, job_id: i64, worker_id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE ingestion_jobs
               SET status = 'success', finished_at = $3, locked_at = NULL, locked_by = NULL,
                   last_error = NULL, updated_at = $3
             WHERE id = $1 AND status = 'running' AND locked_by = $2
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn fail_job(
        &self,
        job_id: i64,
        worker_id: &str,
        error: &str,
        backoff: &BackoffPolicy,
        now: DateTime<Utc>,
    ) -> Result<Option<FailedAttempt>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            r#"
            SELECT attempts, max_attempts
              FROM ingestion_jobs
             WHERE id = $1 AND status = 'running' AND locked_by = $2
               FOR UPDATE
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        let attempts: i32 = row.try_get::<i32, _>("attempts")? + 1;
        let max_attempts: i32 = row.try_get("max_attempts")?;
        let terminal = attempts >= max_attempts;
        let (status, run_after, finished_at) = if terminal {
            (JobStatus::Failed, None, Some(now))
        } else {
            (JobStatus::Queued, Some(retry_at(backoff, attempts, now)), None)
        };

        let sql = format!(
            r#"
            UPDATE ingestion_jobs
               SET attempts = $2, status = $3, last_error = $4,
                   run_after = COALESCE($5, run_after), finished_at = $6,
                   locked_at = NULL, locked_by = NULL, updated_at = $7
             WHERE id = $1
            RETURNING {JOB_COLUMNS}
            "#
        );
        let updated = sqlx::query(&sql)
            .bind(job_id)
            .bind(attempts)
            .bind(status.as_str())
            .bind(error)
            .bind(run_after)
            .bind(finished_at)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;
        let job = job_from_row(&updated)?;
        tx.commit().await?;
        Ok(Some(FailedAttempt { job, terminal }))
    }

    async fn heartbeat_job(&self, job_id: i64, worker_id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE ingestion_jobs
               SET locked_at = $3, updated_at = $3
             WHERE id = $1 AND status = 'running' AND locked_by = $2
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_job(&self, job_id: i64) -> Result<Option<IngestionJob>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM ingestion_jobs WHERE id = $1");
        let row = sqlx::query(&sql).bind(job_id).fetch_optional(&self.pool).await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn queue_counts(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        stuck_before: DateTime<Utc>,
    ) -> Result<QueueCounts, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) FILTER (WHERE status = 'queued') AS queued,
                   COUNT(*) FILTER (WHERE status = 'running') AS running,
                   COUNT(*) FILTER (WHERE status = 'success') AS success,
                   COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                   COUNT(*) FILTER (WHERE status = 'queued' AND run_after <= $1) AS ready_now,
                   COUNT(*) FILTER (WHERE status = 'queued' AND run_after < $2) AS stale_queued,
                   COUNT(*) FILTER (
                       WHERE status = 'running' AND COALESCE(locked_at, updated_at) < $3
                   ) AS stuck_running
              FROM ingestion_jobs
            "#,
        )
        .bind(now)
        .bind(stale_before)
        .bind(stuck_before)
        .fetch_one(&self.pool)
        .await?;
        Ok(QueueCounts {
            queued: row.try_get("queued")?,
            running: row.try_get("running")?,
            success: row.try_get("success")?,
            failed: row.try_get("failed")?,
            ready_now: row.try_get("ready_now")?,
            stale_queued: row.try_get("stale_queued")?,
            stuck_running: row.try_get("stuck_running")?,
        })
    }

    async fn retry_failed_jobs(&self, limit: i64, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE ingestion_jobs
               SET status = 'queued', attempts = 0, last_error = NULL, locked_at = NULL,
                   locked_by = NULL, finished_at = NULL, run_after = $2, updated_at = $2
             WHERE id IN (
                   SELECT id FROM ingestion_jobs
                    WHERE status = 'failed'
                    ORDER BY updated_at ASC, id ASC
                    LIMIT $1
                    FOR UPDATE SKIP LOCKED)
            "#,
        )
        .bind(limit)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn requeue_stale_queued_jobs(
        &self,
        limit: i64,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE ingestion_jobs
               SET run_after = $3, locked_at = NULL, locked_by = NULL, updated_at = $3
             WHERE id IN (
                   SELECT id FROM ingestion_jobs
                    WHERE status = 'queued' AND run_after < $2
                    ORDER BY run_after ASC, id ASC
                    LIMIT $1
                    FOR UPDATE SKIP LOCKED)
            "#,
        )
        .bind(limit)
        .bind(stale_before)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn recover_stuck_running_jobs(
        &self,
        limit: i64,
        stuck_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE ingestion_jobs
               SET status = 'queued', locked_at = NULL, locked_by = NULL, finished_at = NULL,
                   last_error = NULL, run_after = $3, updated_at = $3
             WHERE id IN (
                   SELECT id FROM ingestion_jobs
                    WHERE status = 'running' AND COALESCE(locked_at, updated_at) < $2
                    ORDER BY COALESCE(locked_at, updated_at) ASC, id ASC
                    LIMIT $1
                    FOR UPDATE SKIP LOCKED)
            "#,
        )
        .bind(limit)
        .bind(stuck_before)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn ensure_source(&self, slug: &str, display_name: &str) -> Result<IngestionSource, StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO ingestion_sources (slug, display_name)
            VALUES ($1, $2)
            ON CONFLICT (slug) DO NOTHING
            RETURNING id, slug, display_name
            "#,
        )
        .bind(slug)
        .bind(display_name)
        .fetch_optional(&self.pool)
        .await?;
        let row = match inserted {
            Some(row) => row,
            None => {
                sqlx::query("SELECT id, slug, display_name FROM ingestion_sources WHERE slug = $1")
                    .bind(slug)
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(IngestionSource {
            id: row.try_get("id")?,
            slug: row.try_get("slug")?,
            display_name: row.try_get("display_name")?,
        })
    }

    async fn upsert_entity(
        &self,
        source_id: i64,
        entity_type: EntityType,
        source_entity_id: &str,
        url: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<IngestionEntity, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO ingestion_entities
                (source_id, entity_type, source_entity_id, url, active, last_seen_at, created_at)
            VALUES ($1, $2, $3, $4, TRUE, $5, $5)
            ON CONFLICT (source_id, entity_type, source_entity_id) DO UPDATE
               SET active = TRUE,
                   last_seen_at = EXCLUDED.last_seen_at,
                   url = COALESCE(EXCLUDED.url, ingestion_entities.url)
            RETURNING {ENTITY_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(source_id)
            .bind(entity_type.as_str())
            .bind(source_entity_id)
            .bind(url)
            .bind(now)
            .fetch_one(&self.pool)
            .await?;
        entity_from_row(&row)
    }

    async fn deactivate_unseen_entities(
        &self,
        entity_type: EntityType,
        seen_before: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE ingestion_entities
               SET active = FALSE
             WHERE active
               AND entity_type = $1
               AND last_seen_at < $2
            "#,
        )
        .bind(entity_type.as_str())
        .bind(seen_before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn insert_snapshot(&self, snapshot: &NewSnapshot, now: DateTime<Utc>) -> Result<Option<i64>, StoreError> {
        let id: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO ingestion_entity_snapshots
                (entity_id, fetched_at, http_status, raw_json, extracted_fields, content_hash, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (entity_id, content_hash) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(snapshot.entity_id)
        .bind(snapshot.fetched_at)
        .bind(snapshot.http_status.map(i32::from))
        .bind(&snapshot.raw_json)
        .bind(&snapshot.extracted_fields)
        .bind(&snapshot.content_hash)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    async fn snapshots_for_entity(&self, entity_id: i64) -> Result<Vec<SnapshotRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, entity_id, fetched_at, http_status, raw_json, extracted_fields, content_hash, created_at
              FROM ingestion_entity_snapshots
             WHERE entity_id = $1
             ORDER BY fetched_at ASC, id ASC
            "#,
        )
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(snapshot_from_row).collect()
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
        let sql = format!(
            r#"
            INSERT INTO canonical_entity_mappings
                (entity_id, canonical_type, canonical_id, match_method, confidence, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            ON CONFLICT (entity_id) DO UPDATE
               SET canonical_type = EXCLUDED.canonical_type,
                   canonical_id = EXCLUDED.canonical_id,
                   match_method = EXCLUDED.match_method,
                   confidence = EXCLUDED.confidence,
                   updated_at = EXCLUDED.updated_at
            RETURNING {MAPPING_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(entity_id)
            .bind(canonical_type.as_str())
            .bind(canonical_id)
            .bind(match_method)
            .bind(confidence)
            .bind(now)
            .fetch_one(&self.pool)
            .await?;
        mapping_from_row(&row)
    }

    async fn mapping_for(&self, entity_id: i64) -> Result<Option<CanonicalMapping>, StoreError> {
        let sql = format!("SELECT {MAPPING_COLUMNS} FROM canonical_entity_mappings WHERE entity_id = $1");
        let row = sqlx::query(&sql).bind(entity_id).fetch_optional(&self.pool).await?;
        row.as_ref().map(mapping_from_row).transpose()
    }

    async fn get_offer(&self, offer_id: i64) -> Result<Option<Offer>, StoreError> {
        let sql = format!("SELECT {OFFER_COLUMNS} FROM offers WHERE id = $1");
        let row = sqlx::query(&sql).bind(offer_id).fetch_optional(&self.pool).await?;
        row.as_ref().map(offer_from_row).transpose()
    }

    async fn stale_offers(
        &self,
        checked_before: DateTime<Utc>,
        skip_sources: &[String],
        limit: i64,
    ) -> Result<Vec<Offer>, StoreError> {
        let sql = format!(
            r#"
            SELECT {OFFER_COLUMNS}
              FROM offers
             WHERE active AND (last_checked_at IS NULL OR last_checked_at < $1)
               AND NOT (source_slug = ANY($2))
             ORDER BY last_checked_at ASC NULLS FIRST, id ASC
             LIMIT $3
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(checked_before)
            .bind(skip_sources)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(offer_from_row).collect()
    }

    async fn offers_missing_images(&self, skip_sources: &[String], limit: i64) -> Result<Vec<Offer>, StoreError> {
        let sql = format!(
            r#"
            SELECT {OFFER_COLUMNS}
              FROM offers
             WHERE active AND (product_image_url IS NULL OR btrim(product_image_url) = '')
               AND NOT (source_slug = ANY($1))
             ORDER BY id ASC
             LIMIT $2
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(skip_sources)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(offer_from_row).collect()
    }

    async fn offer_freshness(&self, fresh_after: DateTime<Utc>) -> Result<OfferFreshness, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) FILTER (WHERE active) AS active,
                   COUNT(*) FILTER (WHERE active AND last_checked_at >= $1) AS fresh
              FROM offers
            "#,
        )
        .bind(fresh_after)
        .fetch_one(&self.pool)
        .await?;
        Ok(OfferFreshness {
            active: row.try_get("active")?,
            fresh: row.try_get("fresh")?,
        })
    }

    async fn apply_offer_patch(
        &self,
        offer_id: i64,
        patch: &OfferPatch,
        checked_at: DateTime<Utc>,
    ) -> Result<Option<OfferChange>, StoreError> {
        let row = sqlx::query(
            r#"
            WITH prev AS (
                SELECT id, price_cents, currency, in_stock, last_checked_at, product_image_url
                  FROM offers
                 WHERE id = $1
                 FOR UPDATE
            )
            UPDATE offers o
               SET price_cents = COALESCE($2, o.price_cents),
                   currency = COALESCE($3, o.currency),
                   in_stock = COALESCE($4, o.in_stock),
                   product_image_url = CASE
                       WHEN o.product_image_url IS NULL OR btrim(o.product_image_url) = ''
                       THEN COALESCE($5, o.product_image_url)
                       ELSE o.product_image_url
                   END,
                   last_checked_at = $6
              FROM prev
             WHERE o.id = prev.id
            RETURNING o.id, o.source_slug, o.url, o.active, o.price_cents, o.currency, o.in_stock,
                      o.last_checked_at, o.product_image_url,
                      prev.price_cents AS prev_price_cents,
                      prev.currency AS prev_currency,
                      prev.in_stock AS prev_in_stock,
                      prev.last_checked_at AS prev_last_checked_at,
                      prev.product_image_url AS prev_product_image_url
            "#,
        )
        .bind(offer_id)
        .bind(patch.price_cents)
        .bind(&patch.currency)
        .bind(patch.in_stock)
        .bind(&patch.image_url)
        .bind(checked_at)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let after = offer_from_row(&row)?;
        let before = Offer {
            price_cents: row.try_get("prev_price_cents")?,
            currency: row.try_get("prev_currency")?,
            in_stock: row.try_get("prev_in_stock")?,
            last_checked_at: row.try_get("prev_last_checked_at")?,
            product_image_url: row.try_get("prev_product_image_url")?,
            ..after.clone()
        };
        Ok(Some(OfferChange { before, after }))
    }

    async fn start_run(&self, source_slug: &str, job_kind: &str, now: DateTime<Utc>) -> Result<IngestionRun, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO ingestion_runs (source_slug, job_kind, status, started_at)
            VALUES ($1, $2, $3, $4)
            RETURNING {RUN_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(source_slug)
            .bind(job_kind)
            .bind(RunStatus::Running.as_str())
            .bind(now)
            .fetch_one(&self.pool)
            .await?;
        run_from_row(&row)
    }

    async fn finish_run(
        &self,
        run_id: i64,
        status: RunStatus,
        counters: RunCounters,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE ingestion_runs
               SET status = $2, finished_at = $3, error = $4,
                   scanned = $5, updated = $6, changed = $7, failed = $8
             WHERE id = $1
            "#,
        )
        .bind(run_id)
        .bind(status.as_str())
        .bind(now)
        .bind(error)
        .bind(counters.scanned)
        .bind(counters.updated)
        .bind(counters.changed)
        .bind(counters.failed)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "ingestion run",
                id: run_id,
            });
        }
        Ok(())
    }

    async fn recent_runs(&self, limit: i64) -> Result<Vec<IngestionRun>, StoreError> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM ingestion_runs ORDER BY started_at DESC, id DESC LIMIT $1"
        );
        let rows = sqlx::query(&sql).bind(limit).fetch_all(&self.pool).await?;
        rows.iter().map(run_from_row).collect()
    }
}
