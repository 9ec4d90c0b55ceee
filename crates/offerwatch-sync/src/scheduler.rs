use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::config::SyncConfig;
use crate::ops::OpsService;

/// Cron-driven freshness enqueues; `None` when the scheduler is disabled.
pub async fn maybe_build_scheduler(config: &SyncConfig, ops: OpsService) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let limit = config.refresh_limit;
    let cron = config.refresh_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let ops = ops.clone();
        Box::pin(async move {
            match ops.enqueue_freshness_refresh(Some(limit)).await {
                Ok(result) => info!(created = result.affected, limit = result.limit, "scheduled freshness refresh"),
                Err(err) => error!(error = %err, "scheduled freshness refresh failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    info!(cron, limit, "freshness scheduler configured");
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use std::sync::Arc;

    fn ops() -> OpsService {
        OpsService::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn disabled_scheduler_builds_nothing() {
        let mut config = SyncConfig::from_env();
        config.scheduler_enabled = false;
        assert!(maybe_build_scheduler(&config, ops()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn invalid_cron_is_reported() {
        let mut config = SyncConfig::from_env();
        config.scheduler_enabled = true;
        config.refresh_cron = "every fifteen minutes".into();
        let Err(err) = maybe_build_scheduler(&config, ops()).await else {
            panic!("invalid cron should not build a scheduler");
        };
        assert!(err.to_string().contains("every fifteen minutes"));
    }
}
