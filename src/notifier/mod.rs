//! Notifier (C9): drains due notification rows FIFO and dispatches them to
//! the sink their `sink_type` names, retrying on a fixed backoff ladder up
//! to a configured attempt cap.
//!
//! Grounded on
//! `original_source/backend/app/plugins/monitoring/service.py::_process_notifications`,
//! with the retry policy spec.md mandates
//! (1s/5s/30s/5m, 10-attempt cap) replacing the original's unbounded retry.

mod sink;

pub use sink::{EmailSink, NotificationSink, SinkError, SlackSink, WebhookSink};

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tracing::{error, info, warn};

use crate::cron::{JobHandle, Scheduler};
use crate::database::{AlertStore, Database, NotificationStore};
use crate::error::Result;
use crate::types::{AlertNotification, SinkType};

/// Fixed backoff ladder: (failed attempts so far) -> delay before the next
/// try. Past the ladder's length the last entry repeats until the attempt
/// cap kicks in.
const BACKOFF_LADDER: [Duration; 4] = [
    Duration::from_secs(1),
    Duration::from_secs(5),
    Duration::from_secs(30),
    Duration::from_secs(5 * 60),
];

fn backoff_delay(attempts: u32) -> Duration {
    let idx = (attempts as usize).min(BACKOFF_LADDER.len() - 1);
    BACKOFF_LADDER[idx]
}

pub struct Notifier {
    db: Arc<Database>,
    webhook: WebhookSink,
    email: EmailSink,
    slack: SlackSink,
    max_attempts: u32,
    retention_days: i64,
}

impl Notifier {
    pub fn new(db: Arc<Database>, max_attempts: u32, retention_days: i64) -> Self {
        Self {
            db,
            webhook: WebhookSink::new(),
            email: EmailSink,
            slack: SlackSink,
            max_attempts,
            retention_days,
        }
    }

    pub async fn enqueue(&self, alert_id: &str, sink_type: SinkType, target: &str) -> Result<()> {
        let notification = AlertNotification {
            id: uuid::Uuid::new_v4().to_string(),
            alert_id: alert_id.to_string(),
            sink_type,
            target: target.to_string(),
            status: crate::types::NotificationStatus::Pending,
            attempts: 0,
            next_attempt_at: Utc::now(),
            sent_at: None,
            error: None,
            created_at: Utc::now(),
        };
        self.db
            .with_conn(move |conn| NotificationStore::enqueue(conn, &notification))
            .await?;
        Ok(())
    }

    /// Drain every currently-due notification, FIFO. Each send failure is
    /// rescheduled rather than propagated — a single bad webhook target
    /// must not stall the rest of the queue.
    pub async fn drain_due(&self) -> Result<()> {
        let due = self.db.with_conn(|conn| NotificationStore::due(conn, Utc::now())).await?;
        for notification in due {
            self.dispatch(notification).await;
        }
        Ok(())
    }

    async fn dispatch(&self, notification: AlertNotification) {
        let alert = match self
            .db
            .with_conn({
                let alert_id = notification.alert_id.clone();
                move |conn| AlertStore::get(conn, &alert_id)
            })
            .await
        {
            Ok(Some(alert)) => alert,
            Ok(None) => {
                warn!(notification_id = %notification.id, "notification references a deleted alert, dropping");
                return;
            }
            Err(e) => {
                error!(notification_id = %notification.id, error = %e, "failed to load alert for notification");
                return;
            }
        };

        let result = match notification.sink_type {
            SinkType::Webhook => self.webhook.send(&alert, &notification.target).await,
            SinkType::Email => self.email.send(&alert, &notification.target).await,
            SinkType::Slack => self.slack.send(&alert, &notification.target).await,
        };

        match result {
            Ok(()) => {
                if let Err(e) = self
                    .db
                    .with_conn({
                        let id = notification.id.clone();
                        move |conn| NotificationStore::mark_sent(conn, &id)
                    })
                    .await
                {
                    error!(notification_id = %notification.id, error = %e, "failed to mark notification sent");
                    return;
                }
                let alert_id = notification.alert_id.clone();
                if let Err(e) = self
                    .db
                    .with_conn(move |conn| AlertStore::mark_notification_sent(conn, &alert_id))
                    .await
                {
                    warn!(alert_id = %notification.alert_id, error = %e, "failed to flag alert as notified");
                }
                info!(notification_id = %notification.id, sink = ?notification.sink_type, "notification sent");
            }
            Err(e) => {
                let delay = backoff_delay(notification.attempts);
                let next_attempt_at = Utc::now() + ChronoDuration::from_std(delay).unwrap_or(ChronoDuration::seconds(1));
                let error_message = e.to_string();
                let max_attempts = self.max_attempts;
                let result = self
                    .db
                    .with_conn({
                        let id = notification.id.clone();
                        move |conn| {
                            NotificationStore::mark_attempt_failed(
                                conn,
                                &id,
                                &error_message,
                                next_attempt_at,
                                max_attempts,
                            )
                        }
                    })
                    .await;
                if let Err(db_err) = result {
                    error!(notification_id = %notification.id, error = %db_err, "failed to record notification failure");
                }
                warn!(notification_id = %notification.id, error = %e, attempts = notification.attempts + 1, "notification send failed");
            }
        }
    }

    pub async fn cleanup(&self) -> Result<usize> {
        let older_than = Utc::now() - ChronoDuration::days(self.retention_days);
        Ok(self.db.with_conn(move |conn| NotificationStore::cleanup(conn, older_than)).await?)
    }
}

pub struct NotifierWorker {
    notifier: Arc<Notifier>,
    scheduler: Scheduler,
}

impl NotifierWorker {
    pub fn new(notifier: Arc<Notifier>) -> Self {
        Self {
            notifier,
            scheduler: Scheduler::new(),
        }
    }

    pub async fn start(&self, poll_interval: Duration, cleanup_interval: Duration) -> (JobHandle, JobHandle) {
        let drain_notifier = self.notifier.clone();
        let drain_handle = self
            .scheduler
            .schedule("notifier:drain".to_string(), poll_interval, move || {
                let notifier = drain_notifier.clone();
                async move {
                    if let Err(e) = notifier.drain_due().await {
                        error!(error = %e, "notification drain pass failed");
                    }
                }
            })
            .await;

        let cleanup_notifier = self.notifier.clone();
        let cleanup_handle = self
            .scheduler
            .schedule("notifier:cleanup".to_string(), cleanup_interval, move || {
                let notifier = cleanup_notifier.clone();
                async move {
                    if let Err(e) = notifier.cleanup().await {
                        error!(error = %e, "notification cleanup pass failed");
                    }
                }
            })
            .await;

        (drain_handle, cleanup_handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_ladder_steps_through_then_holds() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(5));
        assert_eq!(backoff_delay(2), Duration::from_secs(30));
        assert_eq!(backoff_delay(3), Duration::from_secs(300));
        assert_eq!(backoff_delay(99), Duration::from_secs(300));
    }
}
