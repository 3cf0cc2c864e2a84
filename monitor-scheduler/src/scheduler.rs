use chrono::{DateTime, Utc};
use monitor_core::{
    Error, Result,
    config::Config,
    models::{Claim, ExecutionMessage, Monitor},
    queue::WorkQueue,
    schedule::SchedulePolicy,
    store::MonitorStore,
};
use std::{sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    pub due: usize,
    pub enqueued: usize,
    pub conflicts: usize,
    pub enqueue_failures: usize,
    /// The previous tick was still running.
    pub skipped: bool,
}

/// Turns due monitors into claimed execution messages. Safe to run from any
/// number of scheduler processes at once; the store's conditional claim picks
/// one winner per monitor per cycle.
pub struct ClaimDispatcher {
    monitors: Arc<dyn MonitorStore>,
    queue: Arc<dyn WorkQueue>,
    schedule: SchedulePolicy,
    batch_size: i64,
    tick_lock: Mutex<()>,
}

impl ClaimDispatcher {
    pub fn new(
        monitors: Arc<dyn MonitorStore>,
        queue: Arc<dyn WorkQueue>,
        schedule: SchedulePolicy,
        batch_size: i64,
    ) -> Self {
        Self {
            monitors,
            queue,
            schedule,
            batch_size,
            tick_lock: Mutex::new(()),
        }
    }

    pub fn from_config(
        config: &Config,
        monitors: Arc<dyn MonitorStore>,
        queue: Arc<dyn WorkQueue>,
    ) -> Result<Self> {
        Ok(Self::new(
            monitors,
            queue,
            SchedulePolicy::from_config(config)?,
            config.scheduler.batch_size,
        ))
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickSummary> {
        let Ok(_guard) = self.tick_lock.try_lock() else {
            debug!("Previous tick still running; skipping");
            return Ok(TickSummary {
                skipped: true,
                ..TickSummary::default()
            });
        };

        let due = self
            .monitors
            .find_due(now, self.schedule.claim_grace_multiplier, self.batch_size)
            .await?;

        let mut summary = TickSummary {
            due: due.len(),
            ..TickSummary::default()
        };

        for monitor in &due {
            match self.claim_and_enqueue(monitor, now).await {
                Ok(true) => summary.enqueued += 1,
                Ok(false) => summary.conflicts += 1,
                Err(e) => {
                    summary.enqueue_failures += 1;
                    warn!(monitor_id = %monitor.id, error = %e, "Failed to dispatch due monitor");
                }
            }
        }

        if summary.due > 0 {
            info!(
                due = summary.due,
                enqueued = summary.enqueued,
                conflicts = summary.conflicts,
                "Scheduler tick complete"
            );
        }
        Ok(summary)
    }

    /// `Ok(false)` when another scheduler won the claim.
    async fn claim_and_enqueue(&self, monitor: &Monitor, now: DateTime<Utc>) -> Result<bool> {
        let claim = Claim {
            token: Uuid::new_v4(),
            claimed_at: now,
            next_run_at: Some(
                self.schedule
                    .provisional_next_run(now, monitor.interval_seconds),
            ),
        };

        if !self
            .monitors
            .try_claim(monitor.id, monitor.version, &claim)
            .await?
        {
            debug!(monitor_id = %monitor.id, "Claim conflict; another scheduler owns this cycle");
            return Ok(false);
        }

        let message = ExecutionMessage {
            monitor_id: monitor.id,
            claim_token: claim.token,
            enqueued_at: now,
        };
        if let Err(e) = self.queue.enqueue(&message).await {
            if let Err(release_err) = self.monitors.release_claim(monitor.id, claim.token).await {
                error!(
                    monitor_id = %monitor.id,
                    error = %release_err,
                    "Failed to release claim after enqueue failure; it will expire"
                );
            }
            return Err(e);
        }

        debug!(monitor_id = %monitor.id, claim_token = %claim.token, "Enqueued check");
        Ok(true)
    }
}

pub struct MonitorScheduler {
    dispatcher: Arc<ClaimDispatcher>,
    scheduler: JobScheduler,
    tick_interval: Duration,
}

impl MonitorScheduler {
    pub async fn new(dispatcher: Arc<ClaimDispatcher>, tick_interval: Duration) -> Result<Self> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| Error::scheduler(e.to_string()))?;

        Ok(Self {
            dispatcher,
            scheduler,
            tick_interval,
        })
    }

    pub async fn start(&mut self) -> Result<()> {
        info!("Starting monitor scheduler (tick every {:?})", self.tick_interval);

        let dispatcher = self.dispatcher.clone();
        let job = Job::new_repeated_async(self.tick_interval, move |_uuid, _l| {
            let dispatcher = dispatcher.clone();
            Box::pin(async move {
                if let Err(e) = dispatcher.tick(Utc::now()).await {
                    error!(error = %e, "Scheduler tick failed; retrying next interval");
                }
            })
        })
        .map_err(|e| Error::scheduler(e.to_string()))?;

        self.scheduler
            .add(job)
            .await
            .map_err(|e| Error::scheduler(e.to_string()))?;
        self.scheduler
            .start()
            .await
            .map_err(|e| Error::scheduler(e.to_string()))?;

        info!("Monitor scheduler started successfully");
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<()> {
        info!("Stopping monitor scheduler");
        self.scheduler
            .shutdown()
            .await
            .map_err(|e| Error::scheduler(e.to_string()))?;
        info!("Monitor scheduler stopped");
        Ok(())
    }
}
