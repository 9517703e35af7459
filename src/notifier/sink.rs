//! Notification sinks. `WebhookSink` is fully implemented against
//! `reqwest` (already the teacher's HTTP client dependency); `EmailSink`/
//! `SlackSink` are intentionally stubbed — see the Open Question resolution
//! in DESIGN.md.

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;

use crate::types::Alert;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("webhook request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("webhook target returned status {0}")]
    BadStatus(reqwest::StatusCode),

    #[error("{0} sink is not implemented in this deployment")]
    NotImplemented(&'static str),
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, alert: &Alert, target: &str) -> Result<(), SinkError>;
}

pub struct WebhookSink {
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for WebhookSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn send(&self, alert: &Alert, target: &str) -> Result<(), SinkError> {
        let body = json!({
            "alert_id": alert.id,
            "rule_id": alert.rule_id,
            "name": alert.name,
            "description": alert.description,
            "severity": alert.severity,
            "state": alert.state,
            "last_value": alert.last_value,
            "threshold": alert.threshold,
            "labels": alert.labels,
            "first_detected_at": alert.first_detected_at,
            "last_detected_at": alert.last_detected_at,
        });

        let response = self.client.post(target).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(SinkError::BadStatus(response.status()));
        }
        Ok(())
    }
}

/// SMTP delivery is out of this crate's size budget — wiring a real mailer
/// (e.g. `lettre`) is a follow-up once product settles on a provider.
pub struct EmailSink;

#[async_trait]
impl NotificationSink for EmailSink {
    async fn send(&self, _alert: &Alert, _target: &str) -> Result<(), SinkError> {
        Err(SinkError::NotImplemented("email"))
    }
}

/// Same reasoning as `EmailSink`: no Slack app/bot token management is in
/// scope here, so this sink always reports not-implemented rather than
/// silently no-opping.
pub struct SlackSink;

#[async_trait]
impl NotificationSink for SlackSink {
    async fn send(&self, _alert: &Alert, _target: &str) -> Result<(), SinkError> {
        Err(SinkError::NotImplemented("slack"))
    }
}
