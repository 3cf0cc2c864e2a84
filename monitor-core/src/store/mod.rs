//! Durable state behind the scheduler and executor.
//!
//! Every conditional operation returns `Ok(false)` when its guard does not
//! hold; callers treat that as a lost race, never as a failure.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    error::Result,
    models::{
        Check, Claim, CreateMonitorRequest, EscalationPhase, Monitor, OutcomeUpdate,
        UpdateMonitorRequest,
    },
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::{PgCheckStore, PgMonitorStore};

#[async_trait]
pub trait MonitorStore: Send + Sync {
    /// Inserts a monitor from validated config fields; it is due immediately.
    async fn create(&self, request: &CreateMonitorRequest) -> Result<Monitor>;

    /// Applies the present config fields. Scheduling and status fields are untouched.
    async fn update_config(&self, monitor_id: Uuid, request: &UpdateMonitorRequest) -> Result<Monitor>;

    async fn set_enabled(&self, monitor_id: Uuid, enabled: bool) -> Result<Monitor>;

    async fn list(&self) -> Result<Vec<Monitor>>;

    /// Enabled monitors with `next_run_at <= now` and no live claim, oldest first.
    async fn find_due(&self, now: DateTime<Utc>, grace_multiplier: f64, limit: i64) -> Result<Vec<Monitor>>;

    /// Installs `claim` only if the monitor is enabled and its `version` still
    /// equals `expected_version`, i.e. nothing claimed, committed or released
    /// since the caller read the row.
    async fn try_claim(&self, monitor_id: Uuid, expected_version: i64, claim: &Claim) -> Result<bool>;

    /// Swaps the scheduler's token for the executor's own while `claim_token`
    /// is still `from_token`. Exactly one delivery of a message wins.
    /// Does not require `enabled`: a claimed check still runs if the monitor
    /// was paused after it was enqueued.
    async fn start_execution(&self, monitor_id: Uuid, from_token: Uuid, claim: &Claim) -> Result<bool>;

    /// Fails with `Error::NotFound` when the monitor does not exist.
    async fn read_current(&self, monitor_id: Uuid) -> Result<Monitor>;

    /// Writes status fields unless a check with an equal or later `occurred_at`
    /// was already applied. `consecutive_failures` is derived from the stored value.
    async fn commit_outcome(&self, monitor_id: Uuid, update: &OutcomeUpdate) -> Result<bool>;

    async fn release_claim(&self, monitor_id: Uuid, token: Uuid) -> Result<bool>;

    async fn transition_phase(&self, monitor_id: Uuid, from: EscalationPhase, to: EscalationPhase) -> Result<bool>;
}

#[async_trait]
pub trait CheckStore: Send + Sync {
    /// Appends a check. Appending an id that already exists is a no-op.
    async fn append(&self, check: &Check) -> Result<Check>;

    /// Checks at or after `since`, newest first.
    async fn list_recent(&self, monitor_id: Uuid, since: DateTime<Utc>) -> Result<Vec<Check>>;

    /// The `limit` newest checks.
    async fn list_latest(&self, monitor_id: Uuid, limit: i64) -> Result<Vec<Check>>;
}
