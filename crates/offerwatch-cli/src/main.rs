use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use offerwatch_core::{NewJob, JOB_KIND_HYDRATE_IMAGES, JOB_KIND_OFFER_REFRESH, JOB_KIND_REFRESH_STALE};
use offerwatch_sync::config::parse_job_kinds;
use offerwatch_sync::{IngestionStore, JobQueue, OpsActionResult, SyncConfig, Worker};
use serde::Serialize;
use serde_json::json;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "offerwatch")]
#[command(about = "OfferWatch ingestion queue and offer refresh")]
struct Cli {
    /// Postgres connection string.
    #[arg(long, global = true, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply database migrations.
    Migrate,
    /// Claim and process jobs until Ctrl-C.
    Worker(WorkerArgs),
    /// Enqueue one job.
    Enqueue(EnqueueArgs),
    /// Refresh a single offer inline, bypassing the queue.
    Refresh {
        #[arg(long)]
        offer_id: i64,
    },
    /// Queue health and recovery actions.
    #[command(subcommand)]
    Ops(OpsCommand),
    /// Serve the ops dashboard and JSON API.
    Serve,
    /// Run the cron scheduler that enqueues freshness sweeps.
    Schedule,
}

#[derive(Debug, Args)]
struct WorkerArgs {
    #[arg(long, env = "OFFERWATCH_WORKER_ID")]
    worker_id: Option<String>,
    #[arg(long, env = "OFFERWATCH_WORKER_CONCURRENCY")]
    concurrency: Option<usize>,
    /// Comma separated job kinds to claim.
    #[arg(long, env = "OFFERWATCH_JOB_KINDS")]
    kinds: Option<String>,
    /// Process at most one job and exit.
    #[arg(long)]
    once: bool,
}

#[derive(Debug, Args)]
struct EnqueueArgs {
    /// offer.refresh, offers.refresh_stale or offers.hydrate_images.
    kind: String,
    #[arg(long)]
    offer_id: Option<i64>,
    #[arg(long)]
    limit: Option<u32>,
    #[arg(long)]
    idempotency_key: Option<String>,
    #[arg(long)]
    priority: Option<i32>,
    #[arg(long)]
    max_attempts: Option<i32>,
}

#[derive(Debug, Subcommand)]
enum OpsCommand {
    Snapshot {
        #[arg(long)]
        stale_queued_minutes: Option<i64>,
        #[arg(long)]
        stuck_running_minutes: Option<i64>,
    },
    RetryFailed {
        #[arg(long)]
        limit: Option<i64>,
    },
    RequeueStale {
        #[arg(long)]
        limit: Option<i64>,
        #[arg(long)]
        stale_queued_minutes: Option<i64>,
    },
    RecoverStuck {
        #[arg(long)]
        limit: Option<i64>,
        #[arg(long)]
        stuck_running_minutes: Option<i64>,
    },
    EnqueueRefresh {
        #[arg(long)]
        limit: Option<i64>,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .init();
}

fn job_for(args: EnqueueArgs) -> Result<NewJob> {
    let payload = match args.kind.as_str() {
        JOB_KIND_OFFER_REFRESH => {
            let offer_id = args.offer_id.context("--offer-id is required for offer.refresh")?;
            json!({ "offer_id": offer_id })
        }
        JOB_KIND_REFRESH_STALE | JOB_KIND_HYDRATE_IMAGES => match args.limit {
            Some(limit) => json!({ "limit": limit }),
            None => json!({}),
        },
        other => bail!("unsupported job kind: {other}"),
    };
    let mut job = NewJob::new(args.kind, payload);
    if let Some(key) = args.idempotency_key {
        job = job.with_idempotency_key(key);
    }
    if let Some(priority) = args.priority {
        job = job.with_priority(priority);
    }
    if let Some(max_attempts) = args.max_attempts {
        job = job.with_max_attempts(max_attempts);
    }
    Ok(job)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_action(result: &OpsActionResult) {
    println!(
        "{}: affected={} limit={}",
        result.action.as_str(),
        result.affected,
        result.limit
    );
}

async fn wait_for_ctrl_c() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    let mut config = SyncConfig::from_env();
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }

    match cli.command {
        Commands::Migrate => {
            let store = offerwatch_sync::connect_store(&config).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Worker(args) => {
            if let Some(worker_id) = args.worker_id {
                config.worker_id = worker_id;
            }
            if let Some(concurrency) = args.concurrency {
                config.worker_concurrency = concurrency.max(1);
            }
            if let Some(kinds) = args.kinds {
                config.job_kinds = parse_job_kinds(&kinds);
            }
            let store: Arc<dyn IngestionStore> = offerwatch_sync::connect_store(&config).await?;
            let pipeline = offerwatch_sync::build_pipeline(&config, store.clone())?;
            let worker = Worker::new(JobQueue::new(store), Arc::new(pipeline), config.worker_config());
            if args.once {
                match worker.run_once().await? {
                    Some((job_id, outcome)) => println!("job {job_id}: {outcome:?}"),
                    None => println!("no job ready"),
                }
            } else {
                worker.run_until(wait_for_ctrl_c()).await?;
            }
        }
        Commands::Enqueue(args) => {
            let job = job_for(args)?;
            let store: Arc<dyn IngestionStore> = offerwatch_sync::connect_store(&config).await?;
            let outcome = JobQueue::new(store).enqueue(job).await?;
            println!("job_id={} deduped={}", outcome.job_id, outcome.deduped);
        }
        Commands::Refresh { offer_id } => {
            let store: Arc<dyn IngestionStore> = offerwatch_sync::connect_store(&config).await?;
            let pipeline = offerwatch_sync::build_pipeline(&config, store)?;
            let outcome = pipeline.refresh_offer(offer_id).await?;
            println!(
                "offer {}: accepted={} parser={} reason={} changed={:?}",
                outcome.offer_id,
                outcome.decision.accepted,
                outcome.decision.parser,
                outcome
                    .decision
                    .reason
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "-".into()),
                outcome.change.as_ref().map(|c| c.changed_fields()).unwrap_or_default()
            );
        }
        Commands::Ops(command) => {
            let store: Arc<dyn IngestionStore> = offerwatch_sync::connect_store(&config).await?;
            let ops = offerwatch_sync::build_ops(&config, store);
            match command {
                OpsCommand::Snapshot {
                    stale_queued_minutes,
                    stuck_running_minutes,
                } => print_json(&ops.snapshot(stale_queued_minutes, stuck_running_minutes).await?)?,
                OpsCommand::RetryFailed { limit } => print_action(&ops.retry_failed_jobs(limit).await?),
                OpsCommand::RequeueStale {
                    limit,
                    stale_queued_minutes,
                } => print_action(&ops.requeue_stale_queued_jobs(limit, stale_queued_minutes).await?),
                OpsCommand::RecoverStuck {
                    limit,
                    stuck_running_minutes,
                } => print_action(&ops.recover_stuck_running_jobs(limit, stuck_running_minutes).await?),
                OpsCommand::EnqueueRefresh { limit } => {
                    let result = ops.enqueue_freshness_refresh(limit).await?;
                    print_action(&result);
                    for job in &result.enqueued {
                        println!("  {} job_id={} deduped={}", job.kind, job.job_id, job.deduped);
                    }
                }
            }
        }
        Commands::Serve => offerwatch_web::serve(&config).await?,
        Commands::Schedule => {
            config.scheduler_enabled = true;
            let store: Arc<dyn IngestionStore> = offerwatch_sync::connect_store(&config).await?;
            let ops = offerwatch_sync::build_ops(&config, store);
            let Some(mut sched) = offerwatch_sync::maybe_build_scheduler(&config, ops).await? else {
                bail!("scheduler did not start");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.refresh_cron, "scheduler running; Ctrl-C to stop");
            wait_for_ctrl_c().await;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enqueue_args(argv: &[&str]) -> EnqueueArgs {
        let mut full = vec!["offerwatch", "enqueue"];
        full.extend_from_slice(argv);
        match Cli::try_parse_from(full).unwrap().command {
            Commands::Enqueue(args) => args,
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn offer_refresh_requires_offer_id() {
        let err = job_for(enqueue_args(&["offer.refresh"])).unwrap_err();
        assert!(err.to_string().contains("--offer-id"));

        let job = job_for(enqueue_args(&["offer.refresh", "--offer-id", "42", "--priority", "5"])).unwrap();
        assert_eq!(job.payload, json!({ "offer_id": 42 }));
        assert_eq!(job.priority, 5);
    }

    #[test]
    fn sweep_jobs_carry_optional_limit() {
        let job = job_for(enqueue_args(&["offers.refresh_stale", "--limit", "50"])).unwrap();
        assert_eq!(job.payload, json!({ "limit": 50 }));
        let job = job_for(enqueue_args(&["offers.hydrate_images"])).unwrap();
        assert_eq!(job.payload, json!({}));
        assert!(job_for(enqueue_args(&["offers.delete_all"])).is_err());
    }

    #[test]
    fn ops_snapshot_flags_parse_and_print() {
        let cli = Cli::try_parse_from([
            "offerwatch",
            "--database-url",
            "postgres://localhost/offerwatch",
            "ops",
            "snapshot",
            "--stale-queued-minutes",
            "30",
        ])
        .unwrap();
        assert_eq!(cli.database_url.as_deref(), Some("postgres://localhost/offerwatch"));
        assert!(matches!(
            cli.command,
            Commands::Ops(OpsCommand::Snapshot {
                stale_queued_minutes: Some(30),
                stuck_running_minutes: None
            })
        ));
        print_json(&json!({ "queued": 0 })).unwrap();
    }
}
