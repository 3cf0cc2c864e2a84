//! Process-local store with the same guard semantics as the Postgres one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{CheckStore, MonitorStore};
use crate::{
    error::{Error, Result},
    models::{
        Check, Claim, CreateMonitorRequest, EscalationPhase, Monitor, OutcomeUpdate,
        UpdateMonitorRequest,
    },
};

#[derive(Debug, Default)]
struct Tables {
    monitors: HashMap<Uuid, Monitor>,
    checks: Vec<Check>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces a monitor row wholesale, bypassing every guard.
    pub async fn put_monitor(&self, monitor: Monitor) {
        self.tables.lock().await.monitors.insert(monitor.id, monitor);
    }

    pub async fn check_count(&self, monitor_id: Uuid) -> usize {
        self.tables
            .lock()
            .await
            .checks
            .iter()
            .filter(|check| check.monitor_id == monitor_id)
            .count()
    }
}

fn monitor_not_found(monitor_id: Uuid) -> Error {
    Error::not_found(format!("monitor {monitor_id}"))
}

fn install_claim(monitor: &mut Monitor, claim: &Claim) {
    monitor.claim_token = Some(claim.token);
    monitor.claimed_at = Some(claim.claimed_at);
    if let Some(next_run_at) = claim.next_run_at {
        monitor.next_run_at = next_run_at;
    }
    monitor.updated_at = claim.claimed_at;
    monitor.version += 1;
}

#[async_trait]
impl MonitorStore for MemoryStore {
    async fn create(&self, request: &CreateMonitorRequest) -> Result<Monitor> {
        let now = Utc::now();
        let monitor = Monitor {
            id: Uuid::new_v4(),
            owner_id: request.owner_id,
            name: request.name.clone(),
            url: request.url.clone(),
            method: request.method.clone(),
            interval_seconds: request.interval_seconds,
            timeout_seconds: request.timeout_seconds,
            enabled: request.enabled,
            last_checked_at: None,
            last_status_code: None,
            last_latency_ms: None,
            last_outcome: None,
            consecutive_failures: 0,
            next_run_at: now,
            claim_token: None,
            claimed_at: None,
            escalation_phase: EscalationPhase::Healthy,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        self.put_monitor(monitor.clone()).await;
        Ok(monitor)
    }

    async fn update_config(&self, monitor_id: Uuid, request: &UpdateMonitorRequest) -> Result<Monitor> {
        let mut tables = self.tables.lock().await;
        let monitor = tables
            .monitors
            .get_mut(&monitor_id)
            .ok_or_else(|| monitor_not_found(monitor_id))?;

        if let Some(name) = &request.name {
            monitor.name = name.clone();
        }
        if let Some(url) = &request.url {
            monitor.url = url.clone();
        }
        if let Some(method) = &request.method {
            monitor.method = method.clone();
        }
        if let Some(interval) = request.interval_seconds {
            monitor.interval_seconds = interval;
        }
        if let Some(timeout) = request.timeout_seconds {
            monitor.timeout_seconds = timeout;
        }
        if let Some(enabled) = request.enabled {
            monitor.enabled = enabled;
        }
        monitor.updated_at = Utc::now();
        Ok(monitor.clone())
    }

    async fn set_enabled(&self, monitor_id: Uuid, enabled: bool) -> Result<Monitor> {
        let request = UpdateMonitorRequest {
            enabled: Some(enabled),
            ..Default::default()
        };
        self.update_config(monitor_id, &request).await
    }

    async fn list(&self) -> Result<Vec<Monitor>> {
        let tables = self.tables.lock().await;
        let mut monitors: Vec<Monitor> = tables.monitors.values().cloned().collect();
        monitors.sort_by_key(|m| (m.created_at, m.id));
        Ok(monitors)
    }

    async fn find_due(&self, now: DateTime<Utc>, grace_multiplier: f64, limit: i64) -> Result<Vec<Monitor>> {
        let tables = self.tables.lock().await;
        let mut due: Vec<Monitor> = tables
            .monitors
            .values()
            .filter(|m| m.is_due(now, grace_multiplier))
            .cloned()
            .collect();
        due.sort_by_key(|m| m.next_run_at);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn try_claim(&self, monitor_id: Uuid, expected_version: i64, claim: &Claim) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        let Some(monitor) = tables.monitors.get_mut(&monitor_id) else {
            return Ok(false);
        };
        if !monitor.enabled || monitor.version != expected_version {
            return Ok(false);
        }

        install_claim(monitor, claim);
        Ok(true)
    }

    async fn start_execution(&self, monitor_id: Uuid, from_token: Uuid, claim: &Claim) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        match tables.monitors.get_mut(&monitor_id) {
            Some(monitor) if monitor.claim_token == Some(from_token) => {
                install_claim(monitor, claim);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn read_current(&self, monitor_id: Uuid) -> Result<Monitor> {
        self.tables
            .lock()
            .await
            .monitors
            .get(&monitor_id)
            .cloned()
            .ok_or_else(|| monitor_not_found(monitor_id))
    }

    async fn commit_outcome(&self, monitor_id: Uuid, update: &OutcomeUpdate) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        let Some(monitor) = tables.monitors.get_mut(&monitor_id) else {
            return Ok(false);
        };
        if monitor
            .last_checked_at
            .is_some_and(|applied| applied >= update.occurred_at)
        {
            return Ok(false);
        }

        monitor.last_checked_at = Some(update.occurred_at);
        monitor.last_status_code = update.status_code;
        monitor.last_latency_ms = update.latency_ms;
        monitor.last_outcome = Some(update.outcome.monitor_status());
        monitor.consecutive_failures = if update.outcome.is_failure() {
            monitor.consecutive_failures + 1
        } else {
            0
        };
        monitor.next_run_at = update.next_run_at;
        monitor.updated_at = update.occurred_at;
        monitor.version += 1;
        Ok(true)
    }

    async fn release_claim(&self, monitor_id: Uuid, token: Uuid) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        match tables.monitors.get_mut(&monitor_id) {
            Some(monitor) if monitor.claim_token == Some(token) => {
                monitor.claim_token = None;
                monitor.claimed_at = None;
                monitor.version += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn transition_phase(&self, monitor_id: Uuid, from: EscalationPhase, to: EscalationPhase) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        match tables.monitors.get_mut(&monitor_id) {
            Some(monitor) if monitor.escalation_phase == from => {
                monitor.escalation_phase = to;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl CheckStore for MemoryStore {
    async fn append(&self, check: &Check) -> Result<Check> {
        let mut tables = self.tables.lock().await;
        if !tables.checks.iter().any(|existing| existing.id == check.id) {
            tables.checks.push(check.clone());
        }
        Ok(check.clone())
    }

    async fn list_recent(&self, monitor_id: Uuid, since: DateTime<Utc>) -> Result<Vec<Check>> {
        let tables = self.tables.lock().await;
        let mut checks: Vec<Check> = tables
            .checks
            .iter()
            .filter(|c| c.monitor_id == monitor_id && c.occurred_at >= since)
            .cloned()
            .collect();
        checks.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at));
        Ok(checks)
    }

    async fn list_latest(&self, monitor_id: Uuid, limit: i64) -> Result<Vec<Check>> {
        let tables = self.tables.lock().await;
        let mut checks: Vec<Check> = tables
            .checks
            .iter()
            .filter(|c| c.monitor_id == monitor_id)
            .cloned()
            .collect();
        checks.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at));
        checks.truncate(limit.max(0) as usize);
        Ok(checks)
    }
}
