//! Run-time arithmetic shared by the scheduler and the executor.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use std::str::FromStr;

use crate::config::Config;
use crate::error::{Error, Result};

/// How long a claim protects a monitor before it is treated as abandoned.
pub fn claim_ttl(timeout_seconds: i32, grace_multiplier: f64) -> Duration {
    let millis = f64::from(timeout_seconds.max(0)) * grace_multiplier * 1000.0;
    Duration::milliseconds(millis.round() as i64)
}

/// One step of the accelerated cadence used while a monitor keeps failing.
///
/// `attempts: None` covers every remaining failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryStage {
    pub attempts: Option<u32>,
    pub interval_seconds: u32,
}

impl RetryStage {
    /// Parses `attempts:seconds` pairs separated by commas, e.g. `3:30,5:60,*:120`.
    pub fn parse_list(raw: &str) -> Result<Vec<RetryStage>> {
        raw.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(RetryStage::from_str)
            .collect()
    }
}

impl FromStr for RetryStage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (attempts, interval) = s
            .split_once(':')
            .ok_or_else(|| Error::validation(format!("retry stage '{s}' must be attempts:seconds")))?;

        let attempts = match attempts.trim() {
            "*" => None,
            n => Some(
                n.parse::<u32>()
                    .ok()
                    .filter(|n| *n > 0)
                    .ok_or_else(|| Error::validation(format!("invalid retry attempts in '{s}'")))?,
            ),
        };
        let interval_seconds = interval
            .trim()
            .parse::<u32>()
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| Error::validation(format!("invalid retry interval in '{s}'")))?;

        Ok(RetryStage {
            attempts,
            interval_seconds,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulePolicy {
    pub jitter_ratio: f64,
    pub claim_grace_multiplier: f64,
    pub retry_stages: Vec<RetryStage>,
}

impl Default for SchedulePolicy {
    fn default() -> Self {
        Self {
            jitter_ratio: 0.1,
            claim_grace_multiplier: 2.0,
            retry_stages: Vec::new(),
        }
    }
}

impl SchedulePolicy {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            jitter_ratio: config.scheduler.jitter_ratio,
            claim_grace_multiplier: config.scheduler.claim_grace_multiplier,
            retry_stages: RetryStage::parse_list(&config.executor.failure_retry_stages)?,
        })
    }

    pub fn claim_ttl(&self, timeout_seconds: i32) -> Duration {
        claim_ttl(timeout_seconds, self.claim_grace_multiplier)
    }

    /// Interval to wait after the `consecutive_failures`-th failure in a row.
    pub fn retry_interval(&self, consecutive_failures: i32, default_interval: i32) -> i32 {
        if consecutive_failures <= 0 {
            return default_interval;
        }

        let mut remaining = consecutive_failures as u32;
        for stage in &self.retry_stages {
            match stage.attempts {
                Some(attempts) if remaining > attempts => remaining -= attempts,
                _ => return stage.interval_seconds.max(1) as i32,
            }
        }
        default_interval
    }

    /// Bounded random offset of `±jitter_ratio × interval`, in milliseconds.
    pub fn jitter(&self, interval_seconds: i32) -> Duration {
        let bound = (f64::from(interval_seconds) * self.jitter_ratio * 1000.0).abs();
        if bound < 1.0 {
            return Duration::zero();
        }
        let offset = rand::rng().random_range(-bound..=bound);
        Duration::milliseconds(offset.round() as i64)
    }

    /// Provisional advance installed by the scheduler when it claims a monitor.
    pub fn provisional_next_run(&self, now: DateTime<Utc>, interval_seconds: i32) -> DateTime<Utc> {
        now + Duration::seconds(i64::from(interval_seconds)) + self.jitter(interval_seconds)
    }

    /// Next run computed from the actual completion time of a check.
    pub fn next_run_at(
        &self,
        completed_at: DateTime<Utc>,
        interval_seconds: i32,
        consecutive_failures: i32,
    ) -> DateTime<Utc> {
        let interval = self.retry_interval(consecutive_failures, interval_seconds);
        completed_at + Duration::seconds(i64::from(interval)) + self.jitter(interval)
    }
}
