/// Stage timeout sweeper
///
/// `TimeoutSweeper` walks running instances and applies each current
/// stage's timeout policy to tasks that have been pending too long.
/// `SweepScheduler` runs it on a cron schedule via tokio-cron-scheduler.
use crate::{
    error::WorkflowError,
    runtime::engine::{TimeoutOutcome, WorkflowEngine},
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

/// Counts from one sweep; `processed` is the number of timed-out tasks acted on
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub processed: usize,
    pub escalated: usize,
    pub auto_approved: usize,
    pub auto_rejected: usize,
    pub notified: usize,
    pub failed: usize,
}

pub struct TimeoutSweeper {
    engine: Arc<WorkflowEngine>,
}

impl TimeoutSweeper {
    pub fn new(engine: Arc<WorkflowEngine>) -> Self {
        Self { engine }
    }

    pub async fn process_timeouts(&self) -> Result<SweepReport> {
        self.process_timeouts_at(Utc::now()).await
    }

    /// Sweep as if the clock read `now`. One instance failing is logged and
    /// counted; the rest of the sweep carries on.
    pub async fn process_timeouts_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        for instance_id in self.engine.running_instance_ids().await? {
            match self.engine.handle_timeouts(&instance_id, now).await {
                Ok(TimeoutOutcome::Untouched) => {}
                Ok(TimeoutOutcome::Escalated(count)) => {
                    report.escalated += count;
                    report.processed += count;
                }
                Ok(TimeoutOutcome::Notified(count)) => {
                    report.notified += count;
                    report.processed += count;
                }
                Ok(TimeoutOutcome::AutoApproved) => {
                    report.auto_approved += 1;
                    report.processed += 1;
                }
                Ok(TimeoutOutcome::AutoRejected) => {
                    report.auto_rejected += 1;
                    report.processed += 1;
                }
                // Someone acted between the scan and the write
                Err(WorkflowError::NotAssigned { .. } | WorkflowError::InvalidState { .. }) => {
                    tracing::debug!("⏭️ Timeout on {} already resolved", instance_id);
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::error!("❌ Timeout handling failed for {}: {}", instance_id, e);
                }
            }
        }

        if report.processed > 0 || report.failed > 0 {
            tracing::info!(
                "⏱️ Timeout sweep: {} processed ({} escalated, {} auto-approved, {} auto-rejected, {} notified), {} failed",
                report.processed,
                report.escalated,
                report.auto_approved,
                report.auto_rejected,
                report.notified,
                report.failed
            );
        }
        Ok(report)
    }
}

/// Background cron job driving the sweeper
pub struct SweepScheduler {
    scheduler: Arc<RwLock<JobScheduler>>,
    job: RwLock<Option<Uuid>>,
    sweeper: Arc<TimeoutSweeper>,
}

impl SweepScheduler {
    pub async fn new(sweeper: Arc<TimeoutSweeper>) -> Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Arc::new(RwLock::new(scheduler)),
            job: RwLock::new(None),
            sweeper,
        })
    }

    /// Register the sweep job on a six-field cron `schedule` and start ticking
    pub async fn start(&self, schedule: &str) -> Result<()> {
        tracing::info!("⏰ Starting timeout sweeper ({})", schedule);

        let sweeper = Arc::clone(&self.sweeper);
        let job = Job::new_async(schedule, move |_uuid, _l| {
            let sweeper = Arc::clone(&sweeper);
            Box::pin(async move {
                tracing::debug!("🔔 Timeout sweep triggered");
                if let Err(e) = sweeper.process_timeouts().await {
                    tracing::error!("❌ Timeout sweep failed: {}", e);
                }
            })
        })?;

        let job_uuid = {
            let scheduler = self.scheduler.write().await;
            scheduler.add(job).await?
        };
        *self.job.write().await = Some(job_uuid);

        {
            let scheduler = self.scheduler.read().await;
            scheduler.start().await?;
        }

        tracing::info!("✅ Timeout sweeper started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        tracing::info!("⏹️ Stopping timeout sweeper");

        if let Some(job_uuid) = self.job.write().await.take() {
            let scheduler = self.scheduler.read().await;
            if let Err(e) = scheduler.remove(&job_uuid).await {
                tracing::warn!("⚠️ Failed to remove sweep job {}: {}", job_uuid, e);
            }
        }

        {
            let mut scheduler = self.scheduler.write().await;
            scheduler.shutdown().await?;
        }

        tracing::info!("✅ Timeout sweeper stopped");
        Ok(())
    }
}
