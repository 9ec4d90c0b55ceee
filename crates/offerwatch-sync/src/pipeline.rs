//! Offer refresh: fetch, extract, gate, log, reconcile. Sweeps run the same
//! path over batches and record a run row.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use offerwatch_core::{
    CanonicalType, EntityType, IngestionJob, Offer, OfferChange, RunCounters, RunStatus,
    JOB_KIND_HYDRATE_IMAGES, JOB_KIND_OFFER_REFRESH, JOB_KIND_REFRESH_STALE,
};
use offerwatch_extract::{ExtractError, Extraction, ExtractionChain, PageDocument, SourceProfile, SourceRegistry};
use offerwatch_storage::{FetchedDocument, PageFetcher, RawArchive};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};

use crate::config::{clamp_window_hours, DEFAULT_OPS_LIMIT, MAX_OPS_LIMIT};
use crate::mapping::CanonicalMapper;
use crate::observations::{Observation, ObservationLog, RawMetadata};
use crate::reconcile::{evaluate, reconcile, GateDecision, GateInput, RejectReason};
use crate::store::{IngestionStore, StoreError};

/// Source slug recorded on sweep runs, which span every source.
pub const SWEEP_RUN_SOURCE: &str = "all";
pub const OFFER_MATCH_METHOD: &str = "offer_url";
/// Offer entities not sighted for this long are marked inactive.
pub const ENTITY_ABSENCE_DAYS: i64 = 7;

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("offer {0} not found")]
    NotFound(i64),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error("offer {offer_id} observation rejected: {reason}")]
    Rejected { offer_id: i64, reason: RejectReason },
    #[error("offer {offer_id} fetch failed: {message}")]
    Transport { offer_id: i64, message: String },
    #[error("invalid payload for {kind}: {source}")]
    Payload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("unsupported job kind: {0}")]
    UnknownKind(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferRefreshPayload {
    pub offer_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepPayload {
    #[serde(default = "default_sweep_limit")]
    pub limit: u32,
}

fn default_sweep_limit() -> u32 {
    DEFAULT_OPS_LIMIT as u32
}

impl SweepPayload {
    pub fn clamped_limit(&self) -> i64 {
        i64::from(self.limit).clamp(1, MAX_OPS_LIMIT)
    }
}

/// Result of refreshing one offer.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshOutcome {
    pub offer_id: i64,
    pub snapshot_id: Option<i64>,
    pub decision: GateDecision,
    pub change: Option<OfferChange>,
    pub transport_error: Option<String>,
}

impl RefreshOutcome {
    pub fn is_meaningful(&self) -> bool {
        self.change.as_ref().is_some_and(OfferChange::is_meaningful)
    }

    /// Converts a rejected or transport-failed observation into an error.
    pub fn into_result(self) -> Result<Self, RefreshError> {
        if let Some(message) = self.transport_error.clone() {
            return Err(RefreshError::Transport {
                offer_id: self.offer_id,
                message,
            });
        }
        match self.decision.reason.clone() {
            Some(reason) => Err(RefreshError::Rejected {
                offer_id: self.offer_id,
                reason,
            }),
            None => Ok(self),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepSummary {
    pub run_id: i64,
    pub job_kind: String,
    pub counters: RunCounters,
}

/// What a dispatched job did.
#[derive(Debug, Clone, PartialEq)]
pub enum JobReport {
    Offer(RefreshOutcome),
    Sweep(SweepSummary),
}

pub struct RefreshPipeline {
    store: Arc<dyn IngestionStore>,
    fetcher: Arc<dyn PageFetcher>,
    registry: Arc<SourceRegistry>,
    archive: Option<RawArchive>,
    timeout: Duration,
    freshness_window: chrono::Duration,
    observations: ObservationLog,
    mapper: CanonicalMapper,
}

impl RefreshPipeline {
    pub fn new(
        store: Arc<dyn IngestionStore>,
        fetcher: Arc<dyn PageFetcher>,
        registry: Arc<SourceRegistry>,
    ) -> Self {
        Self {
            observations: ObservationLog::new(store.clone()),
            mapper: CanonicalMapper::new(store.clone()),
            store,
            fetcher,
            registry,
            archive: None,
            timeout: Duration::from_secs(20),
            freshness_window: chrono::Duration::hours(24),
        }
    }

    pub fn with_archive(mut self, archive: Option<RawArchive>) -> Self {
        self.archive = archive;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_freshness_window_hours(mut self, hours: i64) -> Self {
        self.freshness_window = chrono::Duration::hours(clamp_window_hours(hours));
        self
    }

    pub fn store(&self) -> &Arc<dyn IngestionStore> {
        &self.store
    }

    pub async fn refresh_offer(&self, offer_id: i64) -> Result<RefreshOutcome, RefreshError> {
        let offer = self
            .store
            .get_offer(offer_id)
            .await?
            .ok_or(RefreshError::NotFound(offer_id))?;
        let span = info_span!("refresh_offer", offer_id, source = %offer.source_slug);
        self.refresh_loaded(&offer).instrument(span).await
    }

    async fn refresh_loaded(&self, offer: &Offer) -> Result<RefreshOutcome, RefreshError> {
        let profile = self.registry.profile(&offer.source_slug);
        if !profile.enabled {
            info!(offer_id = offer.id, source = %profile.slug, "source disabled; refresh skipped");
            return Ok(RefreshOutcome {
                offer_id: offer.id,
                snapshot_id: None,
                decision: GateDecision::source_disabled(),
                change: None,
                transport_error: None,
            });
        }
        let display_name = if profile.display_name.is_empty() {
            profile.slug.clone()
        } else {
            profile.display_name.clone()
        };
        let source = self.store.ensure_source(&profile.slug, &display_name).await?;
        let entity = self
            .store
            .upsert_entity(
                source.id,
                EntityType::Offer,
                &offer.id.to_string(),
                Some(&offer.url),
                Utc::now(),
            )
            .await?;
        self.mapper
            .ensure_mapping(entity.id, CanonicalType::Offer, offer.id, OFFER_MATCH_METHOD, 1.0)
            .await?;

        let (observation, extraction, transport_error) =
            match self.fetcher.fetch(&profile.slug, &offer.url, self.timeout).await {
                Ok(doc) => {
                    let artifact_path = self.archive_body(&profile.slug, &doc).await;
                    let (extraction, decision) = analyze(&profile, &doc)?;
                    let observation = Observation {
                        fetched_at: doc.fetched_at,
                        raw: RawMetadata::from_document(&doc, artifact_path),
                        fields: extraction.fields.clone(),
                        decision,
                    };
                    (observation, extraction, None)
                }
                Err(err) => {
                    warn!(offer_id = offer.id, error = %err, "fetch failed");
                    let observation = Observation {
                        fetched_at: Utc::now(),
                        raw: RawMetadata::from_transport_error(&offer.url, &err),
                        fields: Default::default(),
                        decision: GateDecision::transport_failure(),
                    };
                    (observation, Extraction::none(), Some(err.to_string()))
                }
            };

        let snapshot_id = self.observations.record(&entity, &observation).await?;
        let change = reconcile(
            self.store.as_ref(),
            offer.id,
            &observation.decision,
            &extraction,
            Utc::now(),
        )
        .await?;

        match (&observation.decision.reason, &change) {
            (Some(reason), _) => {
                info!(offer_id = offer.id, parser = %observation.decision.parser, %reason, "observation rejected");
            }
            (None, Some(change)) => {
                info!(offer_id = offer.id, changed = ?change.changed_fields(), "offer reconciled");
            }
            (None, None) => {}
        }

        Ok(RefreshOutcome {
            offer_id: offer.id,
            snapshot_id,
            decision: observation.decision,
            change,
            transport_error,
        })
    }

    async fn archive_body(&self, source_slug: &str, doc: &FetchedDocument) -> Option<String> {
        let archive = self.archive.as_ref()?;
        match archive
            .archive(doc.fetched_at, source_slug, doc.content_type.as_deref(), &doc.body)
            .await
        {
            Ok(stored) => Some(stored.relative_path.to_string_lossy().into_owned()),
            Err(err) => {
                warn!(source = source_slug, error = %err, "failed to archive raw body");
                None
            }
        }
    }

    /// Refreshes active offers whose last check is missing or older than the
    /// freshness window, oldest first.
    pub async fn refresh_stale(&self, limit: i64) -> Result<SweepSummary, RefreshError> {
        let checked_before = Utc::now() - self.freshness_window;
        let skip = self.registry.disabled_slugs();
        let offers = self.store.stale_offers(checked_before, &skip, limit).await?;
        let summary = self.sweep(JOB_KIND_REFRESH_STALE, offers).await?;
        let deactivated = self
            .store
            .deactivate_unseen_entities(EntityType::Offer, Utc::now() - chrono::Duration::days(ENTITY_ABSENCE_DAYS))
            .await?;
        if deactivated > 0 {
            info!(deactivated, "deactivated unseen offer entities");
        }
        Ok(summary)
    }

    pub async fn hydrate_images(&self, limit: i64) -> Result<SweepSummary, RefreshError> {
        let skip = self.registry.disabled_slugs();
        let offers = self.store.offers_missing_images(&skip, limit).await?;
        self.sweep(JOB_KIND_HYDRATE_IMAGES, offers).await
    }

    async fn sweep(&self, job_kind: &str, offers: Vec<Offer>) -> Result<SweepSummary, RefreshError> {
        let run = self.store.start_run(SWEEP_RUN_SOURCE, job_kind, Utc::now()).await?;
        let mut counters = RunCounters::default();

        for offer in &offers {
            counters.scanned += 1;
            let span = info_span!("refresh_offer", offer_id = offer.id, source = %offer.source_slug);
            match self.refresh_loaded(offer).instrument(span).await {
                Ok(outcome) if outcome.decision.accepted => {
                    counters.updated += 1;
                    if outcome.is_meaningful() {
                        counters.changed += 1;
                    }
                }
                Ok(_) => counters.failed += 1,
                Err(err) => {
                    warn!(offer_id = offer.id, error = %err, "offer refresh failed inside sweep");
                    counters.failed += 1;
                }
            }
        }

        self.store
            .finish_run(run.id, RunStatus::Success, counters, None, Utc::now())
            .await?;
        info!(
            run_id = run.id,
            kind = job_kind,
            scanned = counters.scanned,
            updated = counters.updated,
            changed = counters.changed,
            failed = counters.failed,
            "sweep finished"
        );
        Ok(SweepSummary {
            run_id: run.id,
            job_kind: job_kind.to_string(),
            counters,
        })
    }

    /// Runs a claimed job by kind. Single-offer jobs fail on rejected or
    /// transport-failed observations; sweeps only fail when they cannot run.
    pub async fn dispatch(&self, job: &IngestionJob) -> Result<JobReport, RefreshError> {
        match job.kind.as_str() {
            JOB_KIND_OFFER_REFRESH => {
                let payload: OfferRefreshPayload = parse_payload(job)?;
                let outcome = self.refresh_offer(payload.offer_id).await?.into_result()?;
                Ok(JobReport::Offer(outcome))
            }
            JOB_KIND_REFRESH_STALE => {
                let payload: SweepPayload = parse_payload(job)?;
                Ok(JobReport::Sweep(self.refresh_stale(payload.clamped_limit()).await?))
            }
            JOB_KIND_HYDRATE_IMAGES => {
                let payload: SweepPayload = parse_payload(job)?;
                Ok(JobReport::Sweep(self.hydrate_images(payload.clamped_limit()).await?))
            }
            other => Err(RefreshError::UnknownKind(other.to_string())),
        }
    }
}

fn parse_payload<T: serde::de::DeserializeOwned>(job: &IngestionJob) -> Result<T, RefreshError> {
    serde_json::from_value(job.payload.clone()).map_err(|source| RefreshError::Payload {
        kind: job.kind.clone(),
        source,
    })
}

/// Parses and gates the document synchronously; the parsed DOM never lives
/// across an await point.
fn analyze(profile: &SourceProfile, doc: &FetchedDocument) -> Result<(Extraction, GateDecision), ExtractError> {
    let chain = ExtractionChain::for_profile(profile)?;
    let body = doc.body_text();
    let page = PageDocument::parse(&doc.final_url, Some(doc.status), &body);
    let extraction = chain.run(&page);
    let decision = evaluate(
        profile,
        GateInput {
            landing_url: &doc.final_url,
            body: &body,
            extraction: &extraction,
        },
    );
    Ok((extraction, decision))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::replay::FixtureFetcher;
    use chrono::TimeZone;
    use offerwatch_core::{NewJob, ParserId};
    use serde_json::json;
    use std::path::PathBuf;

    const FERN_URL: &str = "https://aquashop.example/products/java-fern";
    const CAPTCHA_REQUEST: &str = "https://www.amazon.com/dp/B0CAPTCHA";

    fn workspace_root() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..")
    }

    fn offer(id: i64, source: &str, url: &str) -> Offer {
        Offer {
            id,
            source_slug: source.into(),
            url: url.into(),
            active: true,
            price_cents: Some(2499),
            currency: Some("USD".into()),
            in_stock: Some(false),
            last_checked_at: None,
            product_image_url: None,
        }
    }

    fn pipeline(store: Arc<MemoryStore>) -> RefreshPipeline {
        let root = workspace_root();
        let fetcher = FixtureFetcher::from_fixtures_root(root.join("fixtures"))
            .unwrap()
            .with_case_dir(CAPTCHA_REQUEST, root.join("fixtures/amazon/captcha-block"))
            .unwrap();
        let registry = SourceRegistry::load(root.join("sources.yaml")).unwrap();
        RefreshPipeline::new(store, Arc::new(fetcher), Arc::new(registry))
    }

    fn job(kind: &str, payload: serde_json::Value) -> IngestionJob {
        let now = Utc::now();
        let new = NewJob::new(kind, payload);
        IngestionJob {
            id: 1,
            kind: new.kind,
            payload: new.payload,
            status: offerwatch_core::JobStatus::Running,
            priority: new.priority,
            attempts: 0,
            max_attempts: new.max_attempts,
            run_after: now,
            locked_at: Some(now),
            locked_by: Some("w1".into()),
            last_error: None,
            idempotency_key: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    #[tokio::test]
    async fn json_ld_fixture_updates_offer() {
        let store = Arc::new(MemoryStore::new());
        store.insert_offer(offer(1, "aquashop", FERN_URL)).await;
        let pipeline = pipeline(store.clone());

        let outcome = pipeline.refresh_offer(1).await.unwrap();
        assert!(outcome.decision.accepted);
        assert_eq!(outcome.decision.parser, ParserId::JsonLd);
        assert!(outcome.snapshot_id.is_some());
        assert!(outcome.is_meaningful());

        let updated = store.get_offer(1).await.unwrap().unwrap();
        assert_eq!(updated.price_cents, Some(1999));
        assert_eq!(updated.in_stock, Some(true));
        assert!(updated.last_checked_at.is_some());
        assert!(updated.product_image_url.is_some());
        assert_eq!(store.mapping_count().await, 1);
    }

    #[tokio::test]
    async fn block_page_leaves_offer_and_fails_job() {
        let store = Arc::new(MemoryStore::new());
        let before = offer(2, "amazon", CAPTCHA_REQUEST);
        store.insert_offer(before.clone()).await;
        let pipeline = pipeline(store.clone());

        let err = pipeline
            .dispatch(&job(JOB_KIND_OFFER_REFRESH, json!({"offer_id": 2})))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RefreshError::Rejected {
                reason: RejectReason::BlockPage { .. },
                ..
            }
        ));
        let after = store.get_offer(2).await.unwrap().unwrap();
        assert_eq!(after, before);
        assert_eq!(store.snapshot_count().await, 1);
    }

    #[tokio::test]
    async fn search_landing_never_changes_commerce_fields() {
        let store = Arc::new(MemoryStore::new());
        let before = offer(3, "aquashop", "https://aquashop.example/search?q=java+fern");
        store.insert_offer(before.clone()).await;
        let pipeline = pipeline(store.clone());

        let outcome = pipeline.refresh_offer(3).await.unwrap();
        assert_eq!(outcome.decision.reason, Some(RejectReason::SearchResults));
        let after = store.get_offer(3).await.unwrap().unwrap();
        assert_eq!(after.price_cents, before.price_cents);
        assert_eq!(after.in_stock, before.in_stock);
    }

    #[tokio::test]
    async fn transport_failure_is_logged_and_fails_single_job() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_offer(offer(4, "aquashop", "https://aquashop.example/products/gone"))
            .await;
        let pipeline = pipeline(store.clone());

        let err = pipeline
            .dispatch(&job(JOB_KIND_OFFER_REFRESH, json!({"offer_id": 4})))
            .await
            .unwrap_err();
        assert!(matches!(err, RefreshError::Transport { offer_id: 4, .. }));
        assert_eq!(store.snapshot_count().await, 1);
        assert_eq!(store.get_offer(4).await.unwrap().unwrap().last_checked_at, None);
    }

    #[tokio::test]
    async fn image_hydration_never_overwrites_curated_image() {
        let store = Arc::new(MemoryStore::new());
        let mut curated = offer(5, "aquashop", FERN_URL);
        curated.product_image_url = Some("https://cdn.example/curated.jpg".into());
        store.insert_offer(curated).await;
        let pipeline = pipeline(store.clone());

        pipeline.refresh_offer(5).await.unwrap();
        let after = store.get_offer(5).await.unwrap().unwrap();
        assert_eq!(after.product_image_url.as_deref(), Some("https://cdn.example/curated.jpg"));
        assert_eq!(after.price_cents, Some(1999));
    }

    #[tokio::test]
    async fn stale_sweep_counts_accepted_and_failed_offers() {
        let store = Arc::new(MemoryStore::new());
        store.insert_offer(offer(10, "aquashop", FERN_URL)).await;
        store
            .insert_offer(offer(11, "aquashop", "https://aquashop.example/products/java-moss"))
            .await;
        store.insert_offer(offer(12, "amazon", CAPTCHA_REQUEST)).await;
        let mut fresh = offer(13, "aquashop", FERN_URL);
        fresh.last_checked_at = Some(Utc::now());
        store.insert_offer(fresh).await;
        let pipeline = pipeline(store.clone());

        let report = pipeline
            .dispatch(&job(JOB_KIND_REFRESH_STALE, json!({"limit": 50})))
            .await
            .unwrap();
        let JobReport::Sweep(summary) = report else {
            panic!("expected sweep report");
        };
        assert_eq!(
            summary.counters,
            RunCounters {
                scanned: 3,
                updated: 1,
                changed: 1,
                failed: 2,
            }
        );

        let runs = store.recent_runs(5).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].source_slug, SWEEP_RUN_SOURCE);
        assert_eq!(runs[0].status, RunStatus::Success);
        assert_eq!(runs[0].counters, summary.counters);
    }

    #[tokio::test]
    async fn hydrate_sweep_only_visits_offers_without_images() {
        let store = Arc::new(MemoryStore::new());
        store.insert_offer(offer(20, "aquashop", FERN_URL)).await;
        let checked = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut with_image = offer(21, "aquashop", FERN_URL);
        with_image.product_image_url = Some("https://cdn.example/x.jpg".into());
        with_image.last_checked_at = Some(checked);
        store.insert_offer(with_image).await;
        let pipeline = pipeline(store.clone());

        let summary = pipeline.hydrate_images(10).await.unwrap();
        assert_eq!(summary.counters.scanned, 1);
        assert_eq!(summary.job_kind, JOB_KIND_HYDRATE_IMAGES);
        assert!(store.get_offer(20).await.unwrap().unwrap().product_image_url.is_some());
        assert_eq!(store.get_offer(21).await.unwrap().unwrap().last_checked_at, Some(checked));
    }

    fn disabled_aquashop(store: Arc<MemoryStore>) -> RefreshPipeline {
        let root = workspace_root();
        let fetcher = FixtureFetcher::from_fixtures_root(root.join("fixtures")).unwrap();
        let registry = SourceRegistry::from_yaml_str("sources:\n  - slug: aquashop\n    enabled: false\n").unwrap();
        RefreshPipeline::new(store, Arc::new(fetcher), Arc::new(registry))
    }

    #[tokio::test]
    async fn disabled_source_refresh_is_rejected_without_side_effects() {
        let store = Arc::new(MemoryStore::new());
        store.insert_offer(offer(30, "aquashop", FERN_URL)).await;
        let pipeline = disabled_aquashop(store.clone());

        let outcome = pipeline.refresh_offer(30).await.unwrap();
        assert!(!outcome.decision.accepted);
        assert_eq!(outcome.decision.reason, Some(RejectReason::SourceDisabled));
        assert!(outcome.snapshot_id.is_none());
        assert!(outcome.change.is_none());

        let after = store.get_offer(30).await.unwrap().unwrap();
        assert_eq!(after.price_cents, Some(2499));
        assert!(after.last_checked_at.is_none());
        assert_eq!(store.snapshot_count().await, 0);
        assert_eq!(store.mapping_count().await, 0);

        let err = pipeline
            .dispatch(&job(JOB_KIND_OFFER_REFRESH, json!({"offer_id": 30})))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RefreshError::Rejected {
                offer_id: 30,
                reason: RejectReason::SourceDisabled,
            }
        ));
    }

    #[tokio::test]
    async fn sweeps_skip_disabled_sources() {
        let store = Arc::new(MemoryStore::new());
        store.insert_offer(offer(31, "aquashop", FERN_URL)).await;
        let pipeline = disabled_aquashop(store.clone());

        let stale = pipeline.refresh_stale(10).await.unwrap();
        assert_eq!(stale.counters.scanned, 0);
        let hydrate = pipeline.hydrate_images(10).await.unwrap();
        assert_eq!(hydrate.counters.scanned, 0);
        assert_eq!(store.snapshot_count().await, 0);
    }

    #[tokio::test]
    async fn archived_body_path_lands_in_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.insert_offer(offer(8, "aquashop", FERN_URL)).await;
        let pipeline = pipeline(store.clone()).with_archive(Some(RawArchive::new(dir.path())));

        pipeline.refresh_offer(8).await.unwrap();

        let source = store.ensure_source("aquashop", "Aquashop").await.unwrap();
        let entity = store
            .upsert_entity(source.id, EntityType::Offer, "8", None, Utc::now())
            .await
            .unwrap();
        let rows = store.snapshots_for_entity(entity.id).await.unwrap();
        assert_eq!(rows.len(), 1);
        let path = rows[0].raw_json["request"]["artifact_path"].as_str().unwrap();
        assert!(path.contains("aquashop"));
        assert!(dir.path().join(path).exists());
    }

    #[tokio::test]
    async fn bad_payloads_and_unknown_kinds_are_errors() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(store);
        assert!(matches!(
            pipeline.dispatch(&job(JOB_KIND_OFFER_REFRESH, json!({"offer": 1}))).await,
            Err(RefreshError::Payload { .. })
        ));
        assert!(matches!(
            pipeline.dispatch(&job("offers.reindex", json!({}))).await,
            Err(RefreshError::UnknownKind(_))
        ));
        assert!(matches!(
            pipeline.dispatch(&job(JOB_KIND_OFFER_REFRESH, json!({"offer_id": 404}))).await,
            Err(RefreshError::NotFound(404))
        ));
    }

    #[test]
    fn sweep_limits_are_clamped() {
        assert_eq!(SweepPayload { limit: 0 }.clamped_limit(), 1);
        assert_eq!(SweepPayload { limit: 90_000 }.clamped_limit(), MAX_OPS_LIMIT);
        let parsed: SweepPayload = serde_json::from_value(json!({})).unwrap();
        assert_eq!(parsed.clamped_limit(), DEFAULT_OPS_LIMIT);
    }
}
