use chrono::{DateTime, Utc};
use reqwest::{Client, Method, redirect};
use std::error::Error as _;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::{
    config::ExecutorConfig,
    error::Result,
    models::{CheckOutcome, Monitor, truncate_error_message},
};

/// What a single probe observed.
///
/// `status_code` and `latency_ms` are only set when a response arrived.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub outcome: CheckOutcome,
    pub completed_at: DateTime<Utc>,
    pub status_code: Option<i32>,
    pub latency_ms: Option<i32>,
    pub error_message: Option<String>,
}

/// A response is reachable (`up`) below the threshold and `down` at or above it.
pub fn classify(status_code: u16, down_status_threshold: u16) -> CheckOutcome {
    if status_code < down_status_threshold {
        CheckOutcome::Up
    } else {
        CheckOutcome::Down
    }
}

#[derive(Clone, Debug)]
pub struct HttpProber {
    client: Client,
    down_status_threshold: u16,
}

impl HttpProber {
    pub fn new(user_agent: &str, down_status_threshold: u16) -> Result<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .redirect(redirect::Policy::none())
            .build()?;

        Ok(Self {
            client,
            down_status_threshold,
        })
    }

    pub fn from_config(config: &ExecutorConfig) -> Result<Self> {
        Self::new(&config.user_agent, config.down_status_threshold)
    }

    /// Issues exactly one request, bounded by the monitor's timeout. Never retries.
    pub async fn probe(&self, monitor: &Monitor) -> ProbeResult {
        let method = Method::from_bytes(monitor.method.as_bytes()).unwrap_or(Method::GET);
        let timeout = Duration::from_secs(monitor.timeout_seconds.max(1) as u64);
        let request = self.client.request(method, &monitor.url);

        let start_time = Instant::now();
        match tokio::time::timeout(timeout, request.send()).await {
            Ok(Ok(response)) => {
                let latency_ms = start_time.elapsed().as_millis().min(i32::MAX as u128) as i32;
                let status = response.status().as_u16();
                let outcome = classify(status, self.down_status_threshold);

                match outcome {
                    CheckOutcome::Up => info!(
                        monitor_id = %monitor.id,
                        status,
                        latency_ms,
                        "Monitor {} responded", monitor.name
                    ),
                    _ => warn!(
                        monitor_id = %monitor.id,
                        status,
                        latency_ms,
                        "Monitor {} returned failing status", monitor.name
                    ),
                }

                ProbeResult {
                    outcome,
                    completed_at: Utc::now(),
                    status_code: Some(i32::from(status)),
                    latency_ms: Some(latency_ms),
                    error_message: None,
                }
            }
            Ok(Err(e)) => {
                warn!(monitor_id = %monitor.id, error = %e, "Monitor {} request failed", monitor.name);
                unreachable_result(describe_request_error(&e))
            }
            Err(_) => {
                warn!(monitor_id = %monitor.id, "Monitor {} timed out", monitor.name);
                unreachable_result(format!(
                    "request timed out after {}s",
                    monitor.timeout_seconds
                ))
            }
        }
    }
}

fn unreachable_result(error_message: String) -> ProbeResult {
    ProbeResult {
        outcome: CheckOutcome::Error,
        completed_at: Utc::now(),
        status_code: None,
        latency_ms: None,
        error_message: Some(truncate_error_message(&error_message)),
    }
}

/// reqwest's top-level message hides the cause (DNS, refused, TLS); walk the chain.
fn describe_request_error(error: &reqwest::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
