use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use offerwatch_core::IngestionJob;
use tokio::task::JoinSet;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::pipeline::{JobReport, RefreshPipeline};
use crate::queue::JobQueue;

#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: &IngestionJob) -> anyhow::Result<()>;
}

#[async_trait]
impl JobHandler for RefreshPipeline {
    async fn handle(&self, job: &IngestionJob) -> anyhow::Result<()> {
        let report = self
            .dispatch(job)
            .await
            .with_context(|| format!("{} job {}", job.kind, job.id))?;
        match report {
            JobReport::Offer(outcome) => {
                debug!(job_id = job.id, offer_id = outcome.offer_id, meaningful = outcome.is_meaningful(), "offer refreshed");
            }
            JobReport::Sweep(summary) => {
                debug!(job_id = job.id, run_id = summary.run_id, "sweep recorded");
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Retrying,
    Failed,
    /// The store no longer considered the job ours when we reported back.
    Lost,
}

pub struct Worker {
    queue: JobQueue,
    handler: Arc<dyn JobHandler>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(queue: JobQueue, handler: Arc<dyn JobHandler>, config: WorkerConfig) -> Self {
        Self {
            queue,
            handler,
            config,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Claims and processes a single job inline.
    pub async fn run_once(&self) -> anyhow::Result<Option<(i64, JobOutcome)>> {
        let Some(job) = self
            .queue
            .claim(&self.config.worker_id, self.config.job_kinds.as_deref())
            .await?
        else {
            return Ok(None);
        };
        let job_id = job.id;
        let outcome = process_job(
            self.queue.clone(),
            self.handler.clone(),
            job,
            Arc::from(self.config.worker_id.as_str()),
            self.config.heartbeat_interval,
        )
        .await;
        Ok(Some((job_id, outcome)))
    }

    /// Keeps up to `concurrency` jobs in flight until `shutdown` resolves,
    /// then drains the jobs already running.
    pub async fn run_until<F>(&self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let worker_id: Arc<str> = Arc::from(self.config.worker_id.as_str());
        let concurrency = self.config.concurrency.max(1);
        let mut set: JoinSet<JobOutcome> = JoinSet::new();
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            worker = %worker_id,
            concurrency,
            poll_ms = self.config.poll_interval.as_millis() as u64,
            kinds = ?self.config.job_kinds,
            "ingestion worker started"
        );

        loop {
            while set.len() < concurrency {
                match self.queue.claim(&worker_id, self.config.job_kinds.as_deref()).await {
                    Ok(Some(job)) => {
                        set.spawn(process_job(
                            self.queue.clone(),
                            self.handler.clone(),
                            job,
                            worker_id.clone(),
                            self.config.heartbeat_interval,
                        ));
                    }
                    Ok(None) => break,
                    Err(err) => {
                        error!(error = %err, "error claiming job; backing off");
                        tokio::time::sleep(self.config.error_backoff).await;
                        break;
                    }
                }
            }

            tokio::select! {
                _ = &mut shutdown => {
                    info!(worker = %worker_id, in_flight = set.len(), "shutdown requested; draining");
                    break;
                }
                Some(res) = set.join_next(), if !set.is_empty() => {
                    if let Err(join_err) = res {
                        error!(error = %join_err, "job task panicked");
                    }
                }
                _ = ticker.tick() => {
                    if set.is_empty() {
                        debug!(worker = %worker_id, "idle tick");
                    }
                }
            }
        }

        while let Some(res) = set.join_next().await {
            if let Err(join_err) = res {
                error!(error = %join_err, "job task panicked");
            }
        }
        info!(worker = %worker_id, "ingestion worker stopped");
        Ok(())
    }
}

async fn process_job(
    queue: JobQueue,
    handler: Arc<dyn JobHandler>,
    job: IngestionJob,
    worker_id: Arc<str>,
    heartbeat_every: std::time::Duration,
) -> JobOutcome {
    let job_id = job.id;
    info!(job_id, kind = %job.kind, worker = %worker_id, attempt = job.attempts + 1, "processing job");

    let work = handler.handle(&job);
    tokio::pin!(work);
    let mut heartbeat = interval_at(Instant::now() + heartbeat_every, heartbeat_every);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let result = loop {
        tokio::select! {
            res = &mut work => break res,
            _ = heartbeat.tick() => {
                match queue.heartbeat(job_id, &worker_id).await {
                    Ok(true) => debug!(job_id, "lock renewed"),
                    Ok(false) => warn!(job_id, worker = %worker_id, "heartbeat found job no longer held"),
                    Err(err) => warn!(job_id, error = %err, "heartbeat failed"),
                }
            }
        }
    };

    match result {
        Ok(()) => match queue.complete(job_id, &worker_id).await {
            Ok(true) => {
                info!(job_id, kind = %job.kind, "job completed");
                JobOutcome::Completed
            }
            Ok(false) => JobOutcome::Lost,
            Err(err) => {
                error!(job_id, error = %err, "failed to mark job complete");
                JobOutcome::Lost
            }
        },
        Err(err) => {
            let message = format!("{err:#}");
            error!(job_id, kind = %job.kind, error = %message, "job failed");
            match queue.fail(job_id, &worker_id, &message).await {
                Ok(Some(attempt)) if attempt.terminal => JobOutcome::Failed,
                Ok(Some(_)) => JobOutcome::Retrying,
                Ok(None) => JobOutcome::Lost,
                Err(db_err) => {
                    error!(job_id, error = %db_err, "failed to record job failure");
                    JobOutcome::Lost
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::store::IngestionStore;
    use offerwatch_core::{JobStatus, NewJob, JOB_KIND_OFFER_REFRESH};
    use serde_json::json;
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl JobHandler for Recorder {
        async fn handle(&self, job: &IngestionJob) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.seen.lock().await.push(job.id);
            if job.payload["fail"].as_bool().unwrap_or(false) {
                anyhow::bail!("simulated failure");
            }
            Ok(())
        }
    }

    fn config(worker_id: &str) -> WorkerConfig {
        WorkerConfig {
            worker_id: worker_id.into(),
            concurrency: 3,
            poll_interval: Duration::from_millis(10),
            heartbeat_interval: Duration::from_millis(20),
            error_backoff: Duration::from_millis(10),
            job_kinds: None,
        }
    }

    async fn wait_until_drained(store: &MemoryStore) {
        for _ in 0..500 {
            let busy = store
                .jobs()
                .await
                .iter()
                .any(|j| j.status == JobStatus::Running || (j.status == JobStatus::Queued && j.attempts == 0));
            if !busy {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("queue did not drain");
    }

    #[tokio::test]
    async fn run_once_completes_and_fails_jobs() {
        let store = Arc::new(MemoryStore::new());
        let queue = JobQueue::new(store.clone());
        let ok = queue
            .enqueue(NewJob::new(JOB_KIND_OFFER_REFRESH, json!({"offer_id": 1})))
            .await
            .unwrap()
            .job_id;
        let bad = queue
            .enqueue(NewJob::new(JOB_KIND_OFFER_REFRESH, json!({"offer_id": 2, "fail": true})).with_priority(200))
            .await
            .unwrap()
            .job_id;
        let worker = Worker::new(queue, Arc::new(Recorder::default()), config("w1"));

        assert_eq!(worker.run_once().await.unwrap(), Some((ok, JobOutcome::Completed)));
        assert_eq!(worker.run_once().await.unwrap(), Some((bad, JobOutcome::Retrying)));
        assert_eq!(worker.run_once().await.unwrap(), None);

        let failed = store.get_job(bad).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Queued);
        assert_eq!(failed.attempts, 1);
        assert!(failed.last_error.unwrap().contains("simulated failure"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_workers_never_share_a_job() {
        let store = Arc::new(MemoryStore::new());
        let queue = JobQueue::new(store.clone());
        for offer_id in 0..40 {
            queue
                .enqueue(NewJob::new(JOB_KIND_OFFER_REFRESH, json!({"offer_id": offer_id})))
                .await
                .unwrap();
        }

        let recorder = Arc::new(Recorder::default());
        let (tx, rx) = tokio::sync::watch::channel(false);
        let mut handles = Vec::new();
        for name in ["w1", "w2", "w3"] {
            let worker = Worker::new(queue.clone(), recorder.clone(), config(name));
            let mut rx = rx.clone();
            handles.push(tokio::spawn(async move {
                worker
                    .run_until(async move {
                        let _ = rx.wait_for(|stop| *stop).await;
                    })
                    .await
            }));
        }

        wait_until_drained(&store).await;
        tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let seen = recorder.seen.lock().await.clone();
        let unique: HashSet<i64> = seen.iter().copied().collect();
        assert_eq!(seen.len(), 40);
        assert_eq!(unique.len(), 40);
        assert!(store.jobs().await.iter().all(|j| j.status == JobStatus::Success));
    }

    struct SlowHandler {
        store: Arc<MemoryStore>,
    }

    #[async_trait]
    impl JobHandler for SlowHandler {
        async fn handle(&self, job: &IngestionJob) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_millis(120)).await;
            let current = self.store.get_job(job.id).await?.context("job vanished")?;
            anyhow::ensure!(current.locked_at > job.locked_at, "lock was not renewed");
            Ok(())
        }
    }

    #[tokio::test]
    async fn long_jobs_renew_their_lock() {
        let store = Arc::new(MemoryStore::new());
        let queue = JobQueue::new(store.clone());
        queue
            .enqueue(NewJob::new(JOB_KIND_OFFER_REFRESH, json!({"offer_id": 9})))
            .await
            .unwrap();
        let worker = Worker::new(queue, Arc::new(SlowHandler { store: store.clone() }), config("w1"));

        let (_, outcome) = worker.run_once().await.unwrap().unwrap();
        assert_eq!(outcome, JobOutcome::Completed);
    }
}
