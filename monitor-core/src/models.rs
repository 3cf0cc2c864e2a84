use chrono::{DateTime, Utc};
use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use uuid::Uuid;

use crate::error::{Error, Result};

pub const MIN_INTERVAL_SECONDS: i32 = 30;
pub const MAX_INTERVAL_SECONDS: i32 = 86_400;
pub const MIN_TIMEOUT_SECONDS: i32 = 1;
pub const MAX_TIMEOUT_SECONDS: i32 = 60;
pub const MAX_NAME_LENGTH: usize = 255;
pub const MAX_URL_LENGTH: usize = 1024;
pub const MAX_ERROR_MESSAGE_LENGTH: usize = 1024;

const ALLOWED_METHODS: &[&str] = &["GET", "HEAD", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"];

/// Result of a single probe as stored in the check log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckOutcome {
    Up,
    Down,
    Error,
}

impl CheckOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckOutcome::Up => "up",
            CheckOutcome::Down => "down",
            CheckOutcome::Error => "error",
        }
    }

    pub fn is_failure(&self) -> bool {
        !matches!(self, CheckOutcome::Up)
    }

    /// Status folded onto the monitor row: anything but `up` reads as `down`.
    pub fn monitor_status(&self) -> MonitorStatus {
        match self {
            CheckOutcome::Up => MonitorStatus::Up,
            CheckOutcome::Down | CheckOutcome::Error => MonitorStatus::Down,
        }
    }
}

impl fmt::Display for CheckOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckOutcome {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "up" => Ok(CheckOutcome::Up),
            "down" => Ok(CheckOutcome::Down),
            "error" => Ok(CheckOutcome::Error),
            other => Err(Error::internal(format!("unknown check outcome '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorStatus {
    Up,
    Down,
}

impl MonitorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorStatus::Up => "up",
            MonitorStatus::Down => "down",
        }
    }
}

impl FromStr for MonitorStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "up" => Ok(MonitorStatus::Up),
            "down" => Ok(MonitorStatus::Down),
            other => Err(Error::internal(format!("unknown monitor status '{other}'"))),
        }
    }
}

/// Whether a downtime alert is outstanding for a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationPhase {
    #[default]
    Healthy,
    AlertSent,
}

impl EscalationPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationPhase::Healthy => "healthy",
            EscalationPhase::AlertSent => "alert_sent",
        }
    }
}

impl FromStr for EscalationPhase {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "healthy" => Ok(EscalationPhase::Healthy),
            "alert_sent" => Ok(EscalationPhase::AlertSent),
            other => Err(Error::internal(format!("unknown escalation phase '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Monitor {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub url: String,
    pub method: String,
    pub interval_seconds: i32,
    pub timeout_seconds: i32,
    pub enabled: bool,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_status_code: Option<i32>,
    pub last_latency_ms: Option<i32>,
    pub last_outcome: Option<MonitorStatus>,
    pub consecutive_failures: i32,
    pub next_run_at: DateTime<Utc>,
    pub claim_token: Option<Uuid>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub escalation_phase: EscalationPhase,
    /// Bumped by every claim, commit and release; claims compare against it.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Monitor {
    /// When the current claim stops protecting the monitor, if one is held.
    pub fn claim_expires_at(&self, grace_multiplier: f64) -> Option<DateTime<Utc>> {
        self.claim_token?;
        let claimed_at = self.claimed_at?;
        Some(claimed_at + crate::schedule::claim_ttl(self.timeout_seconds, grace_multiplier))
    }

    pub fn has_live_claim(&self, now: DateTime<Utc>, grace_multiplier: f64) -> bool {
        match (self.claim_token, self.claim_expires_at(grace_multiplier)) {
            (Some(_), Some(expires_at)) => expires_at > now,
            // A token without a timestamp can never be aged out; treat it as abandoned.
            _ => false,
        }
    }

    /// Selection predicate of `find_due`, shared by every store implementation.
    pub fn is_due(&self, now: DateTime<Utc>, grace_multiplier: f64) -> bool {
        self.enabled && self.next_run_at <= now && !self.has_live_claim(now, grace_multiplier)
    }
}

/// One immutable probe result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Check {
    pub id: Uuid,
    pub monitor_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub outcome: CheckOutcome,
    pub status_code: Option<i32>,
    pub latency_ms: Option<i32>,
    pub error_message: Option<String>,
}

/// Message carried by the work queue from scheduler to worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionMessage {
    pub monitor_id: Uuid,
    pub claim_token: Uuid,
    pub enqueued_at: DateTime<Utc>,
}

/// A fresh claim to install on a monitor.
///
/// `next_run_at` is the scheduler's provisional advance; manual runs leave it
/// untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct Claim {
    pub token: Uuid,
    pub claimed_at: DateTime<Utc>,
    pub next_run_at: Option<DateTime<Utc>>,
}

/// Status fields written by the executor once a probe has been recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeUpdate {
    pub occurred_at: DateTime<Utc>,
    pub outcome: CheckOutcome,
    pub status_code: Option<i32>,
    pub latency_ms: Option<i32>,
    pub next_run_at: DateTime<Utc>,
}

impl OutcomeUpdate {
    pub fn from_check(check: &Check, next_run_at: DateTime<Utc>) -> Self {
        Self {
            occurred_at: check.occurred_at,
            outcome: check.outcome,
            status_code: check.status_code,
            latency_ms: check.latency_ms,
            next_run_at,
        }
    }
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_interval() -> i32 {
    60
}

fn default_timeout() -> i32 {
    10
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateMonitorRequest {
    pub owner_id: Uuid,
    pub name: String,
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default = "default_interval")]
    pub interval_seconds: i32,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl CreateMonitorRequest {
    /// Validates the request and normalises the method to upper case.
    pub fn validate(mut self) -> Result<Self> {
        validate_name(&self.name)?;
        validate_url(&self.url)?;
        self.method = normalize_method(&self.method)?;
        validate_interval(self.interval_seconds)?;
        validate_timeout(self.timeout_seconds)?;
        Ok(self)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateMonitorRequest {
    pub name: Option<String>,
    pub url: Option<String>,
    pub method: Option<String>,
    pub interval_seconds: Option<i32>,
    pub timeout_seconds: Option<i32>,
    pub enabled: Option<bool>,
}

impl UpdateMonitorRequest {
    pub fn validate(mut self) -> Result<Self> {
        if let Some(name) = &self.name {
            validate_name(name)?;
        }
        if let Some(url) = &self.url {
            validate_url(url)?;
        }
        if let Some(method) = &self.method {
            self.method = Some(normalize_method(method)?);
        }
        if let Some(interval) = self.interval_seconds {
            validate_interval(interval)?;
        }
        if let Some(timeout) = self.timeout_seconds {
            validate_timeout(timeout)?;
        }
        Ok(self)
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::validation("name must not be empty"));
    }
    if name.chars().count() > MAX_NAME_LENGTH {
        return Err(Error::validation(format!(
            "name must be at most {MAX_NAME_LENGTH} characters"
        )));
    }
    Ok(())
}

fn validate_url(url: &str) -> Result<()> {
    if url.len() > MAX_URL_LENGTH {
        return Err(Error::validation(format!(
            "url must be at most {MAX_URL_LENGTH} characters"
        )));
    }
    let parsed = Url::parse(url).map_err(|e| Error::validation(format!("invalid url: {e}")))?;
    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Ok(()),
        _ => Err(Error::validation("url must be an absolute http or https url")),
    }
}

fn normalize_method(method: &str) -> Result<String> {
    let upper = method.trim().to_ascii_uppercase();
    if !ALLOWED_METHODS.contains(&upper.as_str()) {
        return Err(Error::validation(format!("unsupported http method '{method}'")));
    }
    Method::from_bytes(upper.as_bytes())
        .map_err(|e| Error::validation(format!("invalid http method: {e}")))?;
    Ok(upper)
}

fn validate_interval(interval_seconds: i32) -> Result<()> {
    if !(MIN_INTERVAL_SECONDS..=MAX_INTERVAL_SECONDS).contains(&interval_seconds) {
        return Err(Error::validation(format!(
            "interval_seconds must be between {MIN_INTERVAL_SECONDS} and {MAX_INTERVAL_SECONDS}"
        )));
    }
    Ok(())
}

fn validate_timeout(timeout_seconds: i32) -> Result<()> {
    if !(MIN_TIMEOUT_SECONDS..=MAX_TIMEOUT_SECONDS).contains(&timeout_seconds) {
        return Err(Error::validation(format!(
            "timeout_seconds must be between {MIN_TIMEOUT_SECONDS} and {MAX_TIMEOUT_SECONDS}"
        )));
    }
    Ok(())
}

/// Caps an error message at the stored column width without splitting a character.
pub fn truncate_error_message(message: &str) -> String {
    match message.char_indices().nth(MAX_ERROR_MESSAGE_LENGTH) {
        Some((cut, _)) => message[..cut].to_string(),
        None => message.to_string(),
    }
}
