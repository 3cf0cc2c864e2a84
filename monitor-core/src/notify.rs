//! Best-effort delivery of downtime alerts and recovery notices.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    config::NotificationConfig,
    error::{Error, Result},
    models::CheckOutcome,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Alert,
    Recovery,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub monitor_id: Uuid,
    pub kind: NotificationKind,
    pub monitor_name: String,
    pub url: String,
    pub failures_in_window: u32,
    pub window_minutes: u32,
    pub outcome: CheckOutcome,
    pub status_code: Option<i32>,
    pub error_message: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl Notification {
    pub fn subject(&self) -> String {
        match self.kind {
            NotificationKind::Alert => format!("Monitor '{}' appears down", self.monitor_name),
            NotificationKind::Recovery => format!("Monitor '{}' has recovered", self.monitor_name),
        }
    }

    pub fn body(&self) -> String {
        let latest_status = match self.status_code {
            Some(code) => format!("{code} ({})", self.outcome),
            None => self.outcome.to_string(),
        };
        let error_line = self
            .error_message
            .as_deref()
            .map(|e| format!("\nLast error: {e}"))
            .unwrap_or_default();

        match self.kind {
            NotificationKind::Alert => format!(
                "We detected {} failed checks for '{}' within the last {} minutes.\nURL: {}\nLatest status: {}{}",
                self.failures_in_window, self.monitor_name, self.window_minutes, self.url, latest_status, error_line
            ),
            NotificationKind::Recovery => format!(
                "'{}' is responding again.\nURL: {}\nLatest status: {}",
                self.monitor_name, self.url, latest_status
            ),
        }
    }
}

#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    /// Delivers one notification. Callers log failures and never retry.
    async fn notify(&self, notification: &Notification) -> Result<()>;
}

/// Writes notifications to the log; used when no delivery channel is configured.
#[derive(Debug, Default, Clone)]
pub struct LogDispatcher;

#[async_trait]
impl NotificationDispatcher for LogDispatcher {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        info!(
            monitor_id = %notification.monitor_id,
            kind = ?notification.kind,
            "{}: {}",
            notification.subject(),
            notification.body()
        );
        Ok(())
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    subject: String,
    message: String,
    #[serde(flatten)]
    notification: &'a Notification,
}

/// POSTs each notification as JSON to a fixed URL.
#[derive(Debug, Clone)]
pub struct WebhookDispatcher {
    client: Client,
    url: String,
}

impl WebhookDispatcher {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl NotificationDispatcher for WebhookDispatcher {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        let payload = WebhookPayload {
            subject: notification.subject(),
            message: notification.body(),
            notification,
        };

        let response = self.client.post(&self.url).json(&payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::notification(format!(
                "webhook responded with {status}"
            )));
        }
        Ok(())
    }
}

/// Webhook delivery when a URL is configured, log output otherwise.
pub fn dispatcher_from_config(config: &NotificationConfig) -> Result<Arc<dyn NotificationDispatcher>> {
    match config.webhook_url.as_deref().filter(|url| !url.trim().is_empty()) {
        Some(url) => {
            info!("Delivering notifications to webhook {}", url);
            Ok(Arc::new(WebhookDispatcher::new(
                url,
                Duration::from_secs(config.timeout_seconds),
            )?))
        }
        None => {
            warn!("ALERT_WEBHOOK_URL not set; notifications will only be logged");
            Ok(Arc::new(LogDispatcher))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, extract::State, http::StatusCode, routing::post};
    use tokio::{net::TcpListener, sync::Mutex};

    fn alert() -> Notification {
        Notification {
            monitor_id: Uuid::new_v4(),
            kind: NotificationKind::Alert,
            monitor_name: "checkout".to_string(),
            url: "https://shop.example.com/checkout".to_string(),
            failures_in_window: 3,
            window_minutes: 5,
            outcome: CheckOutcome::Down,
            status_code: Some(502),
            error_message: None,
            occurred_at: Utc::now(),
        }
    }

    #[test]
    fn alert_text_mentions_window_and_status() {
        let body = alert().body();
        assert!(body.contains("3 failed checks"));
        assert!(body.contains("last 5 minutes"));
        assert!(body.contains("502 (down)"));
        assert_eq!(alert().subject(), "Monitor 'checkout' appears down");
    }

    #[tokio::test]
    async fn webhook_posts_json_payload() {
        let received: Arc<Mutex<Vec<serde_json::Value>>> = Arc::default();
        let router = Router::new()
            .route(
                "/hook",
                post(
                    |State(received): State<Arc<Mutex<Vec<serde_json::Value>>>>,
                     Json(body): Json<serde_json::Value>| async move {
                        received.lock().await.push(body);
                        StatusCode::NO_CONTENT
                    },
                ),
            )
            .with_state(received.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });

        let dispatcher =
            WebhookDispatcher::new(format!("http://{addr}/hook"), Duration::from_secs(5)).unwrap();
        dispatcher.notify(&alert()).await.unwrap();

        let received = received.lock().await;
        assert_eq!(received.len(), 1);
        assert_eq!(received[0]["kind"], "alert");
        assert_eq!(received[0]["failures_in_window"], 3);
        assert_eq!(received[0]["subject"], "Monitor 'checkout' appears down");
    }

    #[tokio::test]
    async fn webhook_rejection_is_an_error() {
        let router = Router::new().route("/hook", post(|| async { StatusCode::BAD_GATEWAY }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });

        let dispatcher =
            WebhookDispatcher::new(format!("http://{addr}/hook"), Duration::from_secs(5)).unwrap();
        let err = dispatcher.notify(&alert()).await.unwrap_err();
        assert!(matches!(err, Error::Notification(_)));
    }
}
