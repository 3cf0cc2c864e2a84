//! Alert/recovery decisions driven by the check history.
//!
//! The phase lives on the monitor row and only moves through
//! `MonitorStore::transition_phase`, so whichever process wins the
//! compare-and-set is the one that dispatches. Losing the race means another
//! executor already sent the notice for this incident.
//!
//! Delivery runs in the background so a slow channel never holds up the
//! executor; `flush` waits for whatever is still being sent.

use chrono::Duration;
use std::sync::Arc;
use tokio::{sync::Mutex, task::JoinSet};
use tracing::{debug, error, info, warn};

use crate::{
    config::EscalationConfig,
    error::Result,
    models::{Check, CheckOutcome, EscalationPhase, Monitor},
    notify::{Notification, NotificationDispatcher, NotificationKind},
    store::{CheckStore, MonitorStore},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationPolicy {
    pub threshold: u32,
    pub window_minutes: u32,
}

impl EscalationPolicy {
    pub fn from_config(config: &EscalationConfig) -> Self {
        Self {
            threshold: config.sustained_down_threshold,
            window_minutes: config.sustained_down_window_minutes,
        }
    }

    /// A zero threshold or window switches alerting off.
    pub fn alerts_enabled(&self) -> bool {
        self.threshold > 0 && self.window_minutes > 0
    }

    pub fn window(&self) -> Duration {
        Duration::minutes(i64::from(self.window_minutes))
    }
}

/// What `on_check` decided for one outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationDecision {
    Quiet,
    Alerted { failures: u32 },
    Recovered,
}

pub struct EscalationEngine {
    monitors: Arc<dyn MonitorStore>,
    checks: Arc<dyn CheckStore>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    policy: EscalationPolicy,
    deliveries: Mutex<JoinSet<()>>,
}

impl EscalationEngine {
    pub fn new(
        monitors: Arc<dyn MonitorStore>,
        checks: Arc<dyn CheckStore>,
        dispatcher: Arc<dyn NotificationDispatcher>,
        policy: EscalationPolicy,
    ) -> Self {
        Self {
            monitors,
            checks,
            dispatcher,
            policy,
            deliveries: Mutex::new(JoinSet::new()),
        }
    }

    /// Waits until every notification handed off so far has been attempted.
    pub async fn flush(&self) {
        let mut deliveries = self.deliveries.lock().await;
        while deliveries.join_next().await.is_some() {}
    }

    /// Called once per check whose status fields were committed.
    pub async fn on_check(&self, monitor: &Monitor, check: &Check) -> Result<EscalationDecision> {
        match check.outcome {
            CheckOutcome::Up => {
                let recovered = self
                    .monitors
                    .transition_phase(monitor.id, EscalationPhase::AlertSent, EscalationPhase::Healthy)
                    .await?;
                if !recovered {
                    return Ok(EscalationDecision::Quiet);
                }
                info!(monitor_id = %monitor.id, "Monitor {} recovered", monitor.name);
                self.dispatch(self.notification(monitor, check, NotificationKind::Recovery, 0))
                    .await;
                Ok(EscalationDecision::Recovered)
            }
            CheckOutcome::Down | CheckOutcome::Error => {
                if !self.policy.alerts_enabled() {
                    return Ok(EscalationDecision::Quiet);
                }

                let failures = self.failures_in_window(monitor, check).await?;
                if failures < self.policy.threshold {
                    debug!(
                        monitor_id = %monitor.id,
                        failures,
                        threshold = self.policy.threshold,
                        "Below sustained-down threshold"
                    );
                    return Ok(EscalationDecision::Quiet);
                }

                let raised = self
                    .monitors
                    .transition_phase(monitor.id, EscalationPhase::Healthy, EscalationPhase::AlertSent)
                    .await?;
                if !raised {
                    // already alerted for this incident
                    return Ok(EscalationDecision::Quiet);
                }
                warn!(
                    monitor_id = %monitor.id,
                    failures,
                    window_minutes = self.policy.window_minutes,
                    "Monitor {} is down", monitor.name
                );
                self.dispatch(self.notification(monitor, check, NotificationKind::Alert, failures))
                    .await;
                Ok(EscalationDecision::Alerted { failures })
            }
        }
    }

    /// Failures in the trailing window since the most recent `up`.
    async fn failures_in_window(&self, monitor: &Monitor, check: &Check) -> Result<u32> {
        let since = check.occurred_at - self.policy.window();
        let recent = self.checks.list_recent(monitor.id, since).await?;
        let failures = recent
            .iter()
            .filter(|c| c.occurred_at <= check.occurred_at)
            .take_while(|c| c.outcome.is_failure())
            .count();
        Ok(u32::try_from(failures).unwrap_or(u32::MAX))
    }

    fn notification(
        &self,
        monitor: &Monitor,
        check: &Check,
        kind: NotificationKind,
        failures: u32,
    ) -> Notification {
        Notification {
            monitor_id: monitor.id,
            kind,
            monitor_name: monitor.name.clone(),
            url: monitor.url.clone(),
            failures_in_window: failures,
            window_minutes: self.policy.window_minutes,
            outcome: check.outcome,
            status_code: check.status_code,
            error_message: check.error_message.clone(),
            occurred_at: check.occurred_at,
        }
    }

    async fn dispatch(&self, notification: Notification) {
        let dispatcher = self.dispatcher.clone();
        let mut deliveries = self.deliveries.lock().await;
        while deliveries.try_join_next().is_some() {}

        deliveries.spawn(async move {
            if let Err(e) = dispatcher.notify(&notification).await {
                error!(
                    monitor_id = %notification.monitor_id,
                    kind = ?notification.kind,
                    error = %e,
                    "Failed to dispatch notification"
                );
            }
        });
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        error::Error,
        models::{CreateMonitorRequest, OutcomeUpdate},
        store::MemoryStore,
    };
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use tokio::sync::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    pub(crate) struct RecordingDispatcher {
        pub(crate) sent: Mutex<Vec<Notification>>,
        pub(crate) fail: bool,
    }

    impl RecordingDispatcher {
        pub(crate) async fn kinds(&self) -> Vec<NotificationKind> {
            self.sent.lock().await.iter().map(|n| n.kind).collect()
        }
    }

    #[async_trait]
    impl NotificationDispatcher for RecordingDispatcher {
        async fn notify(&self, notification: &Notification) -> Result<()> {
            self.sent.lock().await.push(notification.clone());
            if self.fail {
                return Err(Error::notification("channel unavailable"));
            }
            Ok(())
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        dispatcher: Arc<RecordingDispatcher>,
        engine: EscalationEngine,
        monitor: Monitor,
    }

    async fn harness_with(
        threshold: u32,
        window_minutes: u32,
        dispatcher: Arc<RecordingDispatcher>,
    ) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let engine = EscalationEngine::new(
            store.clone(),
            store.clone(),
            dispatcher.clone(),
            EscalationPolicy {
                threshold,
                window_minutes,
            },
        );
        let monitor = store
            .create(&CreateMonitorRequest {
                owner_id: Uuid::new_v4(),
                name: "billing".to_string(),
                url: "https://billing.example.com".to_string(),
                method: "GET".to_string(),
                interval_seconds: 60,
                timeout_seconds: 10,
                enabled: true,
            })
            .await
            .unwrap();
        Harness {
            store,
            dispatcher,
            engine,
            monitor,
        }
    }

    async fn harness(threshold: u32, window_minutes: u32) -> Harness {
        harness_with(threshold, window_minutes, Arc::default()).await
    }

    impl Harness {
        /// Records a check the way the executor does, then runs escalation.
        async fn observe(&self, outcome: CheckOutcome, at: DateTime<Utc>) -> EscalationDecision {
            let check = Check {
                id: Uuid::new_v4(),
                monitor_id: self.monitor.id,
                occurred_at: at,
                outcome,
                status_code: match outcome {
                    CheckOutcome::Up => Some(200),
                    CheckOutcome::Down => Some(500),
                    CheckOutcome::Error => None,
                },
                latency_ms: Some(10),
                error_message: None,
            };
            self.store.append(&check).await.unwrap();
            self.store
                .commit_outcome(self.monitor.id, &OutcomeUpdate::from_check(&check, at))
                .await
                .unwrap();
            let decision = self.engine.on_check(&self.monitor, &check).await.unwrap();
            self.engine.flush().await;
            decision
        }
    }

    #[tokio::test]
    async fn one_alert_and_one_recovery_per_incident() {
        let h = harness(3, 5).await;
        let start = Utc::now();
        let at = |minutes: i64| start + Duration::minutes(minutes);

        assert_eq!(h.observe(CheckOutcome::Down, at(0)).await, EscalationDecision::Quiet);
        assert_eq!(h.observe(CheckOutcome::Down, at(1)).await, EscalationDecision::Quiet);
        assert_eq!(
            h.observe(CheckOutcome::Down, at(2)).await,
            EscalationDecision::Alerted { failures: 3 }
        );
        // still failing, already alerted
        assert_eq!(h.observe(CheckOutcome::Error, at(3)).await, EscalationDecision::Quiet);
        assert_eq!(h.observe(CheckOutcome::Down, at(4)).await, EscalationDecision::Quiet);

        assert_eq!(h.observe(CheckOutcome::Up, at(5)).await, EscalationDecision::Recovered);
        assert_eq!(h.observe(CheckOutcome::Up, at(6)).await, EscalationDecision::Quiet);

        assert_eq!(
            h.dispatcher.kinds().await,
            vec![NotificationKind::Alert, NotificationKind::Recovery]
        );
        let current = h.store.read_current(h.monitor.id).await.unwrap();
        assert_eq!(current.escalation_phase, EscalationPhase::Healthy);
    }

    #[tokio::test]
    async fn failures_outside_window_do_not_count() {
        let h = harness(3, 5).await;
        let start = Utc::now();

        h.observe(CheckOutcome::Down, start).await;
        h.observe(CheckOutcome::Down, start + Duration::minutes(3)).await;
        // the first failure has aged out of the 5 minute window
        assert_eq!(
            h.observe(CheckOutcome::Down, start + Duration::minutes(6)).await,
            EscalationDecision::Quiet
        );
        assert_eq!(
            h.observe(CheckOutcome::Down, start + Duration::minutes(7)).await,
            EscalationDecision::Alerted { failures: 3 }
        );
    }

    #[tokio::test]
    async fn recovery_resets_the_window() {
        let h = harness(3, 5).await;
        let start = Utc::now();
        let at = |seconds: i64| start + Duration::seconds(seconds);

        h.observe(CheckOutcome::Down, at(0)).await;
        h.observe(CheckOutcome::Down, at(30)).await;
        h.observe(CheckOutcome::Up, at(60)).await;
        assert_eq!(h.observe(CheckOutcome::Down, at(90)).await, EscalationDecision::Quiet);
        assert_eq!(h.observe(CheckOutcome::Down, at(120)).await, EscalationDecision::Quiet);
        assert!(h.dispatcher.kinds().await.is_empty());
    }

    #[tokio::test]
    async fn dispatch_failure_still_transitions() {
        let failing = Arc::new(RecordingDispatcher {
            fail: true,
            ..Default::default()
        });
        let h = harness_with(1, 5, failing).await;

        let decision = h.observe(CheckOutcome::Down, Utc::now()).await;
        assert_eq!(decision, EscalationDecision::Alerted { failures: 1 });
        let current = h.store.read_current(h.monitor.id).await.unwrap();
        assert_eq!(current.escalation_phase, EscalationPhase::AlertSent);
        assert_eq!(h.dispatcher.sent.lock().await.len(), 1);
    }

    /// Holds every delivery until released.
    #[derive(Default)]
    struct GatedDispatcher {
        gate: tokio::sync::Notify,
        delivered: Mutex<Vec<NotificationKind>>,
    }

    #[async_trait]
    impl NotificationDispatcher for GatedDispatcher {
        async fn notify(&self, notification: &Notification) -> Result<()> {
            self.gate.notified().await;
            self.delivered.lock().await.push(notification.kind);
            Ok(())
        }
    }

    #[tokio::test]
    async fn slow_delivery_does_not_block_the_decision() {
        let store = Arc::new(MemoryStore::new());
        let dispatcher = Arc::new(GatedDispatcher::default());
        let engine = EscalationEngine::new(
            store.clone(),
            store.clone(),
            dispatcher.clone(),
            EscalationPolicy {
                threshold: 1,
                window_minutes: 5,
            },
        );
        let monitor = store
            .create(&CreateMonitorRequest {
                owner_id: Uuid::new_v4(),
                name: "search".to_string(),
                url: "https://search.example.com".to_string(),
                method: "GET".to_string(),
                interval_seconds: 60,
                timeout_seconds: 10,
                enabled: true,
            })
            .await
            .unwrap();
        let check = Check {
            id: Uuid::new_v4(),
            monitor_id: monitor.id,
            occurred_at: Utc::now(),
            outcome: CheckOutcome::Down,
            status_code: Some(503),
            latency_ms: Some(8),
            error_message: None,
        };
        store.append(&check).await.unwrap();

        let decision = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            engine.on_check(&monitor, &check),
        )
        .await
        .expect("on_check waited for delivery")
        .unwrap();
        assert_eq!(decision, EscalationDecision::Alerted { failures: 1 });
        assert!(dispatcher.delivered.lock().await.is_empty());

        dispatcher.gate.notify_one();
        engine.flush().await;
        assert_eq!(*dispatcher.delivered.lock().await, vec![NotificationKind::Alert]);
    }

    #[tokio::test]
    async fn zero_threshold_disables_alerts() {
        let h = harness(0, 5).await;
        for i in 0..5 {
            assert_eq!(
                h.observe(CheckOutcome::Down, Utc::now() + Duration::seconds(i)).await,
                EscalationDecision::Quiet
            );
        }
        assert!(h.dispatcher.kinds().await.is_empty());
    }
}
