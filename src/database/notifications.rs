use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{DatabaseError, DatabaseResult};
use crate::types::{AlertNotification, NotificationStatus, SinkType};

pub struct NotificationStore;

impl NotificationStore {
    pub fn enqueue(conn: &Connection, notification: &AlertNotification) -> DatabaseResult<()> {
        conn.execute(
            r#"
            INSERT INTO notifications
                (id, alert_id, sink_type, target, status, attempts, next_attempt_at, sent_at, error, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                notification.id,
                notification.alert_id,
                serde_json::to_string(&notification.sink_type).map_err(ser_err)?,
                notification.target,
                serde_json::to_string(&notification.status).map_err(ser_err)?,
                notification.attempts,
                notification.next_attempt_at.timestamp(),
                notification.sent_at.map(|t| t.timestamp()),
                notification.error,
                notification.created_at.timestamp(),
            ],
        )?;
        Ok(())
    }

    pub fn get(conn: &Connection, id: &str) -> DatabaseResult<Option<AlertNotification>> {
        conn.query_row(
            "SELECT id, alert_id, sink_type, target, status, attempts, next_attempt_at, \
             sent_at, error, created_at FROM notifications WHERE id = ?1",
            [id],
            row_to_notification,
        )
        .optional()
        .map_err(DatabaseError::from)
    }

    /// Pending notifications whose `next_attempt_at` has passed, oldest first
    /// — the FIFO order the notifier worker drains in.
    pub fn due(conn: &Connection, now: DateTime<Utc>) -> DatabaseResult<Vec<AlertNotification>> {
        let mut stmt = conn.prepare(
            "SELECT id, alert_id, sink_type, target, status, attempts, next_attempt_at, \
             sent_at, error, created_at FROM notifications \
             WHERE status = 'pending' AND next_attempt_at <= ?1 \
             ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map(params![now.timestamp()], row_to_notification)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn mark_sent(conn: &Connection, id: &str) -> DatabaseResult<()> {
        conn.execute(
            "UPDATE notifications SET status = 'sent', sent_at = ?2, error = NULL WHERE id = ?1",
            params![id, Utc::now().timestamp()],
        )?;
        Ok(())
    }

    /// Record a failed attempt. If `attempts + 1` reaches `max_attempts` the
    /// row is left in `failed` state permanently; otherwise it's rescheduled
    /// at `next_attempt_at` for the backoff worker to retry.
    pub fn mark_attempt_failed(
        conn: &Connection,
        id: &str,
        error: &str,
        next_attempt_at: DateTime<Utc>,
        max_attempts: u32,
    ) -> DatabaseResult<()> {
        let attempts: u32 = conn.query_row(
            "SELECT attempts FROM notifications WHERE id = ?1",
            [id],
            |row| row.get(0),
        )?;
        let attempts = attempts + 1;
        let status = if attempts >= max_attempts { "failed" } else { "pending" };
        conn.execute(
            "UPDATE notifications SET attempts = ?2, status = ?3, next_attempt_at = ?4, error = ?5 \
             WHERE id = ?1",
            params![id, attempts, status, next_attempt_at.timestamp(), error],
        )?;
        Ok(())
    }

    pub fn cleanup(conn: &Connection, older_than: DateTime<Utc>) -> DatabaseResult<usize> {
        let deleted = conn.execute(
            "DELETE FROM notifications WHERE created_at < ?1 AND status != 'pending'",
            params![older_than.timestamp()],
        )?;
        Ok(deleted)
    }
}

fn row_to_notification(row: &rusqlite::Row) -> rusqlite::Result<AlertNotification> {
    let sink_type_str: String = row.get(2)?;
    let status_str: String = row.get(4)?;
    let next_attempt_at: i64 = row.get(6)?;
    let sent_at: Option<i64> = row.get(7)?;
    let created_at: i64 = row.get(9)?;

    Ok(AlertNotification {
        id: row.get(0)?,
        alert_id: row.get(1)?,
        sink_type: serde_json::from_str::<SinkType>(&sink_type_str).unwrap_or(SinkType::Webhook),
        target: row.get(3)?,
        status: match status_str.as_str() {
            "sent" => NotificationStatus::Sent,
            "failed" => NotificationStatus::Failed,
            _ => NotificationStatus::Pending,
        },
        attempts: row.get(5)?,
        next_attempt_at: DateTime::from_timestamp(next_attempt_at, 0).unwrap_or_else(Utc::now),
        sent_at: sent_at.and_then(|t| DateTime::from_timestamp(t, 0)),
        error: row.get(8)?,
        created_at: DateTime::from_timestamp(created_at, 0).unwrap_or_else(Utc::now),
    })
}

fn ser_err(e: serde_json::Error) -> DatabaseError {
    DatabaseError::Serialization(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;

    fn sample_notification(alert_id: &str) -> AlertNotification {
        let now = Utc::now();
        AlertNotification {
            id: uuid::Uuid::new_v4().to_string(),
            alert_id: alert_id.to_string(),
            sink_type: SinkType::Webhook,
            target: "https://example.invalid/hook".to_string(),
            status: NotificationStatus::Pending,
            attempts: 0,
            next_attempt_at: now,
            sent_at: None,
            error: None,
            created_at: now,
        }
    }

    #[tokio::test]
    async fn enqueue_then_due_finds_pending() {
        let db = Database::open_in_memory().unwrap();
        let notification = sample_notification("alert-1");

        db.with_conn(|conn| NotificationStore::enqueue(conn, &notification))
            .await
            .unwrap();

        let due = db
            .with_conn(move |conn| NotificationStore::due(conn, Utc::now()))
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
    }

    #[tokio::test]
    async fn mark_attempt_failed_reschedules_until_cap() {
        let db = Database::open_in_memory().unwrap();
        let notification = sample_notification("alert-2");
        let id = notification.id.clone();
        db.with_conn(|conn| NotificationStore::enqueue(conn, &notification))
            .await
            .unwrap();

        for _ in 0..9 {
            db.with_conn({
                let id = id.clone();
                move |conn| {
                    NotificationStore::mark_attempt_failed(conn, &id, "timeout", Utc::now(), 10)
                }
            })
            .await
            .unwrap();
        }

        let loaded = db
            .with_conn({
                let id = id.clone();
                move |conn| NotificationStore::get(conn, &id)
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.status, NotificationStatus::Pending);
        assert_eq!(loaded.attempts, 9);

        db.with_conn({
            let id = id.clone();
            move |conn| NotificationStore::mark_attempt_failed(conn, &id, "timeout", Utc::now(), 10)
        })
        .await
        .unwrap();

        let loaded = db
            .with_conn(move |conn| NotificationStore::get(conn, &id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.status, NotificationStatus::Failed);
        assert_eq!(loaded.attempts, 10);
    }
}
