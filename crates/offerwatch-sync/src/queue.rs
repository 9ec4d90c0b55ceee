use std::sync::Arc;

use chrono::Utc;
use offerwatch_core::{EnqueueOutcome, IngestionJob, NewJob};
use offerwatch_storage::BackoffPolicy;
use tracing::{debug, info, warn};

use crate::store::{FailedAttempt, IngestionStore, StoreError};

/// Thin queue facade over a store; stamps wall-clock time and applies the
/// job retry policy.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn IngestionStore>,
    backoff: BackoffPolicy,
}

impl JobQueue {
    pub fn new(store: Arc<dyn IngestionStore>) -> Self {
        Self {
            store,
            backoff: BackoffPolicy::job_retry(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn store(&self) -> &Arc<dyn IngestionStore> {
        &self.store
    }

    pub async fn enqueue(&self, job: NewJob) -> Result<EnqueueOutcome, StoreError> {
        let outcome = self.store.enqueue_job(&job, Utc::now()).await?;
        if outcome.deduped {
            debug!(job_id = outcome.job_id, kind = %job.kind, "enqueue deduplicated");
        } else {
            info!(job_id = outcome.job_id, kind = %job.kind, priority = job.priority, "job enqueued");
        }
        Ok(outcome)
    }

    pub async fn claim(
        &self,
        worker_id: &str,
        kinds: Option<&[String]>,
    ) -> Result<Option<IngestionJob>, StoreError> {
        let job = self.store.claim_job(worker_id, kinds, Utc::now()).await?;
        if let Some(job) = &job {
            debug!(job_id = job.id, kind = %job.kind, worker = worker_id, attempts = job.attempts, "job claimed");
        }
        Ok(job)
    }

    pub async fn complete(&self, job_id: i64, worker_id: &str) -> Result<bool, StoreError> {
        let done = self.store.complete_job(job_id, worker_id, Utc::now()).await?;
        if !done {
            warn!(job_id, worker = worker_id, "complete ignored; job is not running under this worker");
        }
        Ok(done)
    }

    pub async fn fail(&self, job_id: i64, worker_id: &str, error: &str) -> Result<Option<FailedAttempt>, StoreError> {
        let attempt = self
            .store
            .fail_job(job_id, worker_id, error, &self.backoff, Utc::now())
            .await?;
        match &attempt {
            Some(FailedAttempt { job, terminal: true }) => {
                warn!(job_id, attempts = job.attempts, error, "job failed permanently");
            }
            Some(FailedAttempt { job, terminal: false }) => {
                info!(job_id, attempts = job.attempts, run_after = %job.run_after, error, "job re-queued with backoff");
            }
            None => warn!(job_id, worker = worker_id, "fail ignored; job is not running under this worker"),
        }
        Ok(attempt)
    }

    pub async fn heartbeat(&self, job_id: i64, worker_id: &str) -> Result<bool, StoreError> {
        self.store.heartbeat_job(job_id, worker_id, Utc::now()).await
    }
}
