//! Ingestion job queue, offer refresh pipeline, and operator recovery.

use std::sync::Arc;

use anyhow::{Context, Result};
use offerwatch_extract::SourceRegistry;
use offerwatch_storage::{HttpFetcher, RawArchive};

pub mod config;
pub mod mapping;
pub mod memory;
pub mod observations;
pub mod ops;
pub mod pg;
pub mod pipeline;
pub mod queue;
pub mod reconcile;
pub mod replay;
pub mod scheduler;
pub mod store;
pub mod worker;

pub use config::{SyncConfig, WorkerConfig};
pub use mapping::CanonicalMapper;
pub use memory::MemoryStore;
pub use observations::{Observation, ObservationLog, RawMetadata};
pub use ops::{OpsAction, OpsActionRequest, OpsActionResult, OpsService, OpsSnapshot};
pub use pg::PgStore;
pub use pipeline::{JobReport, RefreshError, RefreshOutcome, RefreshPipeline, SweepSummary};
pub use queue::JobQueue;
pub use reconcile::{GateDecision, RejectReason};
pub use replay::FixtureFetcher;
pub use scheduler::maybe_build_scheduler;
pub use store::{IngestionStore, QueueCounts, StoreError};
pub use worker::{JobHandler, JobOutcome, Worker};

pub const CRATE_NAME: &str = "offerwatch-sync";

/// Opens the Postgres store with a pool sized for the worker's concurrency.
pub async fn connect_store(config: &SyncConfig) -> Result<Arc<PgStore>> {
    let max_connections = ((config.worker_concurrency as u32) * 4).max(5);
    let store = PgStore::connect(&config.database_url, max_connections)
        .await
        .context("connecting to database")?;
    Ok(Arc::new(store))
}

/// Production refresh pipeline: live HTTP fetcher, profiles from the
/// configured sources file, optional raw body archive.
pub fn build_pipeline(config: &SyncConfig, store: Arc<dyn IngestionStore>) -> Result<RefreshPipeline> {
    let registry = SourceRegistry::load(&config.sources_file)?;
    let fetcher = HttpFetcher::new(config.http_config())?;
    let archive = config.artifacts_dir.clone().map(RawArchive::new);
    Ok(RefreshPipeline::new(store, Arc::new(fetcher), Arc::new(registry))
        .with_archive(archive)
        .with_timeout(config.http_timeout())
        .with_freshness_window_hours(config.freshness_window_hours))
}

pub fn build_ops(config: &SyncConfig, store: Arc<dyn IngestionStore>) -> OpsService {
    OpsService::new(store).with_freshness_window_hours(config.freshness_window_hours)
}

