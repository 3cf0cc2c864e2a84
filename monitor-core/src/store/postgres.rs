use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use super::{CheckStore, MonitorStore};
use crate::{
    db::DatabasePool,
    error::{Error, Result},
    models::{
        Check, CheckOutcome, Claim, CreateMonitorRequest, EscalationPhase, Monitor,
        MonitorStatus, OutcomeUpdate, UpdateMonitorRequest,
    },
};

const MONITOR_COLUMNS: &str = "id, owner_id, name, url, method, interval_seconds, timeout_seconds, \
     enabled, last_checked_at, last_status_code, last_latency_ms, last_outcome, \
     consecutive_failures, next_run_at, claim_token, claimed_at, escalation_phase, \
     version, created_at, updated_at";

const CHECK_COLUMNS: &str =
    "id, monitor_id, occurred_at, outcome, status_code, latency_ms, error_message";

#[derive(Debug, FromRow)]
struct MonitorRow {
    id: Uuid,
    owner_id: Uuid,
    name: String,
    url: String,
    method: String,
    interval_seconds: i32,
    timeout_seconds: i32,
    enabled: bool,
    last_checked_at: Option<DateTime<Utc>>,
    last_status_code: Option<i32>,
    last_latency_ms: Option<i32>,
    last_outcome: Option<String>,
    consecutive_failures: i32,
    next_run_at: DateTime<Utc>,
    claim_token: Option<Uuid>,
    claimed_at: Option<DateTime<Utc>>,
    escalation_phase: String,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<MonitorRow> for Monitor {
    type Error = Error;

    fn try_from(row: MonitorRow) -> Result<Self> {
        Ok(Monitor {
            id: row.id,
            owner_id: row.owner_id,
            name: row.name,
            url: row.url,
            method: row.method,
            interval_seconds: row.interval_seconds,
            timeout_seconds: row.timeout_seconds,
            enabled: row.enabled,
            last_checked_at: row.last_checked_at,
            last_status_code: row.last_status_code,
            last_latency_ms: row.last_latency_ms,
            last_outcome: row.last_outcome.as_deref().map(str::parse::<MonitorStatus>).transpose()?,
            consecutive_failures: row.consecutive_failures,
            next_run_at: row.next_run_at,
            claim_token: row.claim_token,
            claimed_at: row.claimed_at,
            escalation_phase: row.escalation_phase.parse::<EscalationPhase>()?,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct CheckRow {
    id: Uuid,
    monitor_id: Uuid,
    occurred_at: DateTime<Utc>,
    outcome: String,
    status_code: Option<i32>,
    latency_ms: Option<i32>,
    error_message: Option<String>,
}

impl TryFrom<CheckRow> for Check {
    type Error = Error;

    fn try_from(row: CheckRow) -> Result<Self> {
        Ok(Check {
            id: row.id,
            monitor_id: row.monitor_id,
            occurred_at: row.occurred_at,
            outcome: row.outcome.parse::<CheckOutcome>()?,
            status_code: row.status_code,
            latency_ms: row.latency_ms,
            error_message: row.error_message,
        })
    }
}

fn into_monitors(rows: Vec<MonitorRow>) -> Result<Vec<Monitor>> {
    rows.into_iter().map(Monitor::try_from).collect()
}

fn into_checks(rows: Vec<CheckRow>) -> Result<Vec<Check>> {
    rows.into_iter().map(Check::try_from).collect()
}

fn monitor_not_found(monitor_id: Uuid) -> Error {
    Error::not_found(format!("monitor {monitor_id}"))
}

#[derive(Clone, Debug)]
pub struct PgMonitorStore {
    db: DatabasePool,
}

impl PgMonitorStore {
    pub fn new(db: DatabasePool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl MonitorStore for PgMonitorStore {
    async fn create(&self, request: &CreateMonitorRequest) -> Result<Monitor> {
        let now = Utc::now();
        let row: MonitorRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO monitors (id, owner_id, name, url, method, interval_seconds, timeout_seconds,
                                  enabled, next_run_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9, $9)
            RETURNING {MONITOR_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(request.owner_id)
        .bind(&request.name)
        .bind(&request.url)
        .bind(&request.method)
        .bind(request.interval_seconds)
        .bind(request.timeout_seconds)
        .bind(request.enabled)
        .bind(now)
        .fetch_one(&self.db)
        .await?;

        row.try_into()
    }

    async fn update_config(&self, monitor_id: Uuid, request: &UpdateMonitorRequest) -> Result<Monitor> {
        let row: Option<MonitorRow> = sqlx::query_as(&format!(
            r#"
            UPDATE monitors
            SET name = COALESCE($2, name),
                url = COALESCE($3, url),
                method = COALESCE($4, method),
                interval_seconds = COALESCE($5, interval_seconds),
                timeout_seconds = COALESCE($6, timeout_seconds),
                enabled = COALESCE($7, enabled),
                updated_at = $8
            WHERE id = $1
            RETURNING {MONITOR_COLUMNS}
            "#
        ))
        .bind(monitor_id)
        .bind(&request.name)
        .bind(&request.url)
        .bind(&request.method)
        .bind(request.interval_seconds)
        .bind(request.timeout_seconds)
        .bind(request.enabled)
        .bind(Utc::now())
        .fetch_optional(&self.db)
        .await?;

        row.ok_or_else(|| monitor_not_found(monitor_id))?.try_into()
    }

    async fn set_enabled(&self, monitor_id: Uuid, enabled: bool) -> Result<Monitor> {
        let request = UpdateMonitorRequest {
            enabled: Some(enabled),
            ..Default::default()
        };
        self.update_config(monitor_id, &request).await
    }

    async fn list(&self) -> Result<Vec<Monitor>> {
        let rows: Vec<MonitorRow> = sqlx::query_as(&format!(
            "SELECT {MONITOR_COLUMNS} FROM monitors ORDER BY created_at, id"
        ))
        .fetch_all(&self.db)
        .await?;

        into_monitors(rows)
    }

    async fn find_due(&self, now: DateTime<Utc>, grace_multiplier: f64, limit: i64) -> Result<Vec<Monitor>> {
        let rows: Vec<MonitorRow> = sqlx::query_as(&format!(
            r#"
            SELECT {MONITOR_COLUMNS}
            FROM monitors
            WHERE enabled = TRUE
              AND next_run_at <= $1
              AND (
                    claim_token IS NULL
                 OR claimed_at IS NULL
                 OR claimed_at + make_interval(secs => timeout_seconds * $2) <= $1
              )
            ORDER BY next_run_at
            LIMIT $3
            "#
        ))
        .bind(now)
        .bind(grace_multiplier)
        .bind(limit)
        .fetch_all(&self.db)
        .await?;

        into_monitors(rows)
    }

    async fn try_claim(&self, monitor_id: Uuid, expected_version: i64, claim: &Claim) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE monitors
            SET claim_token = $2,
                claimed_at = $3,
                next_run_at = COALESCE($4, next_run_at),
                updated_at = $3,
                version = version + 1
            WHERE id = $1
              AND enabled = TRUE
              AND version = $5
            "#,
        )
        .bind(monitor_id)
        .bind(claim.token)
        .bind(claim.claimed_at)
        .bind(claim.next_run_at)
        .bind(expected_version)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn start_execution(&self, monitor_id: Uuid, from_token: Uuid, claim: &Claim) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE monitors
            SET claim_token = $2,
                claimed_at = $3,
                next_run_at = COALESCE($4, next_run_at),
                updated_at = $3,
                version = version + 1
            WHERE id = $1
              AND claim_token = $5
            "#,
        )
        .bind(monitor_id)
        .bind(claim.token)
        .bind(claim.claimed_at)
        .bind(claim.next_run_at)
        .bind(from_token)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn read_current(&self, monitor_id: Uuid) -> Result<Monitor> {
        let row: Option<MonitorRow> = sqlx::query_as(&format!(
            "SELECT {MONITOR_COLUMNS} FROM monitors WHERE id = $1"
        ))
        .bind(monitor_id)
        .fetch_optional(&self.db)
        .await?;

        row.ok_or_else(|| monitor_not_found(monitor_id))?.try_into()
    }

    async fn commit_outcome(&self, monitor_id: Uuid, update: &OutcomeUpdate) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE monitors
            SET last_checked_at = $2,
                last_status_code = $3,
                last_latency_ms = $4,
                last_outcome = $5,
                consecutive_failures = CASE WHEN $6 THEN consecutive_failures + 1 ELSE 0 END,
                next_run_at = $7,
                updated_at = $2,
                version = version + 1
            WHERE id = $1
              AND (last_checked_at IS NULL OR last_checked_at < $2)
            "#,
        )
        .bind(monitor_id)
        .bind(update.occurred_at)
        .bind(update.status_code)
        .bind(update.latency_ms)
        .bind(update.outcome.monitor_status().as_str())
        .bind(update.outcome.is_failure())
        .bind(update.next_run_at)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_claim(&self, monitor_id: Uuid, token: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE monitors
            SET claim_token = NULL,
                claimed_at = NULL,
                version = version + 1
            WHERE id = $1 AND claim_token = $2
            "#,
        )
        .bind(monitor_id)
        .bind(token)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn transition_phase(&self, monitor_id: Uuid, from: EscalationPhase, to: EscalationPhase) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE monitors SET escalation_phase = $3 WHERE id = $1 AND escalation_phase = $2",
        )
        .bind(monitor_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[derive(Clone, Debug)]
pub struct PgCheckStore {
    db: DatabasePool,
}

impl PgCheckStore {
    pub fn new(db: DatabasePool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CheckStore for PgCheckStore {
    async fn append(&self, check: &Check) -> Result<Check> {
        sqlx::query(
            r#"
            INSERT INTO monitor_checks (id, monitor_id, occurred_at, outcome, status_code, latency_ms, error_message)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(check.id)
        .bind(check.monitor_id)
        .bind(check.occurred_at)
        .bind(check.outcome.as_str())
        .bind(check.status_code)
        .bind(check.latency_ms)
        .bind(&check.error_message)
        .execute(&self.db)
        .await?;

        Ok(check.clone())
    }

    async fn list_recent(&self, monitor_id: Uuid, since: DateTime<Utc>) -> Result<Vec<Check>> {
        let rows: Vec<CheckRow> = sqlx::query_as(&format!(
            r#"
            SELECT {CHECK_COLUMNS}
            FROM monitor_checks
            WHERE monitor_id = $1 AND occurred_at >= $2
            ORDER BY occurred_at DESC
            "#
        ))
        .bind(monitor_id)
        .bind(since)
        .fetch_all(&self.db)
        .await?;

        into_checks(rows)
    }

    async fn list_latest(&self, monitor_id: Uuid, limit: i64) -> Result<Vec<Check>> {
        let rows: Vec<CheckRow> = sqlx::query_as(&format!(
            r#"
            SELECT {CHECK_COLUMNS}
            FROM monitor_checks
            WHERE monitor_id = $1
            ORDER BY occurred_at DESC
            LIMIT $2
            "#
        ))
        .bind(monitor_id)
        .bind(limit)
        .fetch_all(&self.db)
        .await?;

        into_checks(rows)
    }
}
