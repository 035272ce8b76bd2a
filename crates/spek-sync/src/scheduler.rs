use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::runner::Runner;
use crate::SyncError;

#[derive(Debug, Clone, Copy)]
pub struct SweepConfig {
    pub interval: Duration,
    pub run_timeout: Duration,
    pub concurrency: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            run_timeout: Duration::from_secs(30),
            concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepSummary {
    pub sweep_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub queries: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub new_listings: usize,
}

enum QueryOutcome {
    Done(usize),
    Failed,
    TimedOut,
}

/// Runs every registered query once. A failing or hanging query is logged and
/// counted; it never aborts the sweep. Only a failure to list the queries does.
pub async fn sweep(runner: Arc<Runner>, config: &SweepConfig) -> Result<SweepSummary, SyncError> {
    let sweep_id = Uuid::new_v4();
    let span = info_span!("sweep", %sweep_id);
    sweep_inner(runner, config, sweep_id).instrument(span).await
}

async fn sweep_inner(
    runner: Arc<Runner>,
    config: &SweepConfig,
    sweep_id: Uuid,
) -> Result<SweepSummary, SyncError> {
    let started_at = Utc::now();
    let queries = runner.list().await?;
    let limit = Arc::new(Semaphore::new(config.concurrency.max(1)));
    let run_timeout = config.run_timeout;

    let mut tasks = JoinSet::new();
    for query in &queries {
        let runner = runner.clone();
        let limit = limit.clone();
        let id = query.id.clone();
        tasks.spawn(async move {
            let _permit = limit.acquire_owned().await.expect("semaphore not closed");
            match runner.run_within(&id, run_timeout).await {
                Ok(outcome) => QueryOutcome::Done(outcome.new_listings.len()),
                Err(SyncError::TimedOut(_)) => {
                    warn!(query_id = %id, timeout = ?run_timeout, "query run timed out before recording anything");
                    QueryOutcome::TimedOut
                }
                Err(err) => {
                    warn!(query_id = %id, error = %err, "query run failed");
                    QueryOutcome::Failed
                }
            }
        });
    }

    let mut summary = SweepSummary {
        sweep_id,
        started_at,
        finished_at: started_at,
        queries: queries.len(),
        succeeded: 0,
        failed: 0,
        timed_out: 0,
        new_listings: 0,
    };
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(QueryOutcome::Done(new)) => {
                summary.succeeded += 1;
                summary.new_listings += new;
            }
            Ok(QueryOutcome::Failed) => summary.failed += 1,
            Ok(QueryOutcome::TimedOut) => summary.timed_out += 1,
            Err(err) => {
                error!(error = %err, "query run task panicked");
                summary.failed += 1;
            }
        }
    }
    summary.finished_at = Utc::now();

    info!(
        queries = summary.queries,
        succeeded = summary.succeeded,
        failed = summary.failed,
        timed_out = summary.timed_out,
        new_listings = summary.new_listings,
        "sweep complete"
    );
    Ok(summary)
}

/// Fixed-period sweep driver. A tick that fires while the previous sweep is
/// still running is skipped.
#[derive(Clone)]
pub struct Scheduler {
    runner: Arc<Runner>,
    config: SweepConfig,
    in_flight: Arc<Mutex<()>>,
}

impl Scheduler {
    pub fn new(runner: Arc<Runner>, config: SweepConfig) -> Self {
        Self {
            runner,
            config,
            in_flight: Arc::new(Mutex::new(())),
        }
    }

    /// One scheduled sweep; `None` when another sweep is still running.
    pub async fn tick(&self) -> Option<SweepSummary> {
        let Ok(_running) = self.in_flight.try_lock() else {
            warn!("previous sweep still running; skipping this tick");
            return None;
        };
        match sweep(self.runner.clone(), &self.config).await {
            Ok(summary) => Some(summary),
            Err(err) => {
                error!(error = %err, "sweep aborted");
                None
            }
        }
    }

    pub async fn build(&self) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let scheduler = self.clone();
        let interval = self.config.interval;
        let job = Job::new_repeated_async(interval, move |_uuid, _l| {
            let scheduler = scheduler.clone();
            Box::pin(async move {
                scheduler.tick().await;
            })
        })
        .with_context(|| format!("creating sweep job every {interval:?}"))?;
        sched.add(job).await.context("adding sweep job")?;
        Ok(sched)
    }

    /// Builds and starts the job scheduler; the returned handle keeps it alive.
    pub async fn start(&self) -> Result<JobScheduler> {
        let sched = self.build().await?;
        sched.start().await.context("starting scheduler")?;
        info!(interval = ?self.config.interval, "sweep scheduler started");
        Ok(sched)
    }
}
