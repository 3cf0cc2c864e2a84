//! Claim-validated execution of a single monitor check.

use backoff::{ExponentialBackoff, future::retry_notify};
use chrono::Utc;
use std::{future::Future, sync::Arc, time::Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    config::Config,
    error::{Error, Result},
    escalation::{EscalationEngine, EscalationPolicy},
    models::{Check, Claim, ExecutionMessage, Monitor, OutcomeUpdate},
    notify::NotificationDispatcher,
    probe::{HttpProber, ProbeResult},
    schedule::SchedulePolicy,
    store::{CheckStore, MonitorStore},
};

/// Bounded local retry for store writes inside one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistencePolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for PersistencePolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
        }
    }
}

impl PersistencePolicy {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.initial_backoff,
            initial_interval: self.initial_backoff,
            multiplier: 2.0,
            max_interval: self.initial_backoff * 16,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The monitor row no longer exists.
    MonitorMissing,
    /// The stored claim token differs: a duplicate delivery or a reclaimed run.
    StaleClaim,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionReport {
    /// The probe ran and its check was recorded. `applied` is false when a
    /// later check had already updated the monitor's status fields.
    Completed { check: Check, applied: bool },
    Skipped(SkipReason),
}

pub struct CheckExecutor {
    monitors: Arc<dyn MonitorStore>,
    checks: Arc<dyn CheckStore>,
    prober: HttpProber,
    escalation: EscalationEngine,
    schedule: SchedulePolicy,
    persistence: PersistencePolicy,
}

impl CheckExecutor {
    pub fn new(
        monitors: Arc<dyn MonitorStore>,
        checks: Arc<dyn CheckStore>,
        prober: HttpProber,
        escalation: EscalationEngine,
        schedule: SchedulePolicy,
        persistence: PersistencePolicy,
    ) -> Self {
        Self {
            monitors,
            checks,
            prober,
            escalation,
            schedule,
            persistence,
        }
    }

    pub fn from_config(
        config: &Config,
        monitors: Arc<dyn MonitorStore>,
        checks: Arc<dyn CheckStore>,
        dispatcher: Arc<dyn NotificationDispatcher>,
    ) -> Result<Self> {
        let escalation = EscalationEngine::new(
            monitors.clone(),
            checks.clone(),
            dispatcher,
            EscalationPolicy::from_config(&config.escalation),
        );
        Ok(Self::new(
            monitors,
            checks,
            HttpProber::from_config(&config.executor)?,
            escalation,
            SchedulePolicy::from_config(config)?,
            PersistencePolicy {
                max_attempts: config.executor.persistence_max_attempts,
                initial_backoff: Duration::from_millis(config.executor.persistence_backoff_ms),
            },
        ))
    }

    pub fn schedule(&self) -> &SchedulePolicy {
        &self.schedule
    }

    /// Waits for alert and recovery notices still being delivered.
    pub async fn flush_notifications(&self) {
        self.escalation.flush().await;
    }

    /// Runs the check named by a dequeued message.
    ///
    /// The monitor is re-read so concurrent config edits are honoured. Before
    /// probing, the scheduler's token is swapped for a fresh execution token;
    /// a redelivered message that loses that swap is dropped without a record.
    pub async fn handle_message(&self, message: &ExecutionMessage) -> Result<ExecutionReport> {
        let mut monitor = match self.monitors.read_current(message.monitor_id).await {
            Ok(monitor) => monitor,
            Err(Error::NotFound(_)) => {
                warn!(monitor_id = %message.monitor_id, "Monitor vanished before execution");
                return Ok(ExecutionReport::Skipped(SkipReason::MonitorMissing));
            }
            Err(e) => return Err(e),
        };

        if monitor.claim_token != Some(message.claim_token) {
            debug!(
                monitor_id = %monitor.id,
                claim_token = %message.claim_token,
                "Dropping message for a claim that is no longer held"
            );
            return Ok(ExecutionReport::Skipped(SkipReason::StaleClaim));
        }

        let execution = Claim {
            token: Uuid::new_v4(),
            claimed_at: Utc::now(),
            next_run_at: None,
        };
        if !self
            .monitors
            .start_execution(monitor.id, message.claim_token, &execution)
            .await?
        {
            debug!(
                monitor_id = %monitor.id,
                claim_token = %message.claim_token,
                "Another delivery of this message is already executing"
            );
            return Ok(ExecutionReport::Skipped(SkipReason::StaleClaim));
        }
        monitor.claim_token = Some(execution.token);
        monitor.claimed_at = Some(execution.claimed_at);

        let (check, applied) = self.execute_claimed(&monitor, execution.token).await?;
        Ok(ExecutionReport::Completed { check, applied })
    }

    /// Owner-triggered run. Rejected with `Error::Busy` while another execution
    /// holds a live claim; otherwise claims, executes and releases like a
    /// scheduled run.
    pub async fn run_now(&self, monitor_id: Uuid) -> Result<Check> {
        let mut monitor = self.monitors.read_current(monitor_id).await?;
        if !monitor.enabled {
            return Err(Error::validation("Monitor is disabled"));
        }

        let now = Utc::now();
        if monitor.has_live_claim(now, self.schedule.claim_grace_multiplier) {
            return Err(Error::busy(format!("monitor {monitor_id} has a check in flight")));
        }

        let claim = Claim {
            token: Uuid::new_v4(),
            claimed_at: now,
            next_run_at: None,
        };
        if !self
            .monitors
            .try_claim(monitor_id, monitor.version, &claim)
            .await?
        {
            return Err(Error::busy(format!("monitor {monitor_id} was claimed concurrently")));
        }
        monitor.claim_token = Some(claim.token);
        monitor.claimed_at = Some(claim.claimed_at);

        info!(monitor_id = %monitor_id, "Running manual check for {}", monitor.name);
        let (check, _) = self.execute_claimed(&monitor, claim.token).await?;
        Ok(check)
    }

    /// Probe, append, commit, release, escalate. The claim is left to expire
    /// if persistence gives up.
    async fn execute_claimed(&self, monitor: &Monitor, token: Uuid) -> Result<(Check, bool)> {
        let result = self.prober.probe(monitor).await;
        let check = check_from_probe(monitor.id, &result);

        let check = self
            .persist("append check", || self.checks.append(&check))
            .await?;

        let failures = if check.outcome.is_failure() {
            monitor.consecutive_failures + 1
        } else {
            0
        };
        let next_run_at = self
            .schedule
            .next_run_at(result.completed_at, monitor.interval_seconds, failures);
        let update = OutcomeUpdate::from_check(&check, next_run_at);

        let applied = self
            .persist("commit outcome", || self.monitors.commit_outcome(monitor.id, &update))
            .await?;

        match self.monitors.release_claim(monitor.id, token).await {
            Ok(true) => {}
            Ok(false) => debug!(monitor_id = %monitor.id, "Claim was taken over before release"),
            Err(e) => warn!(monitor_id = %monitor.id, error = %e, "Failed to release claim; it will expire"),
        }

        if applied {
            if let Err(e) = self.escalation.on_check(monitor, &check).await {
                warn!(monitor_id = %monitor.id, error = %e, "Escalation evaluation failed");
            }
        } else {
            info!(
                monitor_id = %monitor.id,
                occurred_at = %check.occurred_at,
                "A later check already updated this monitor; status left unchanged"
            );
        }

        Ok((check, applied))
    }

    async fn persist<T, F, Fut>(&self, what: &'static str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.persistence.max_attempts.max(1);
        let mut attempt = 0u32;

        retry_notify(
            self.persistence.backoff(),
            || {
                attempt += 1;
                let current = attempt;
                let pending = operation();
                async move {
                    pending.await.map_err(|e| {
                        if e.is_transient() && current < max_attempts {
                            backoff::Error::transient(e)
                        } else {
                            backoff::Error::permanent(e)
                        }
                    })
                }
            },
            |e: Error, wait: Duration| {
                warn!(error = %e, retry_in_ms = wait.as_millis() as u64, "Retrying {}", what);
            },
        )
        .await
        .map_err(|e| match e {
            e @ (Error::NotFound(_) | Error::Validation(_)) => e,
            e => {
                error!(error = %e, "Giving up on {}", what);
                Error::persistence(format!("{what}: {e}"))
            }
        })
    }
}

fn check_from_probe(monitor_id: Uuid, result: &ProbeResult) -> Check {
    Check {
        id: Uuid::new_v4(),
        monitor_id,
        occurred_at: result.completed_at,
        outcome: result.outcome,
        status_code: result.status_code,
        latency_ms: result.latency_ms,
        error_message: result.error_message.clone(),
    }
}
