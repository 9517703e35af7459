use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use super::{DatabaseError, DatabaseResult};
use crate::types::{
    Alert, AlertCondition, AlertRule, AlertSeverity, AlertState, NotificationSinkConfig,
};
use crate::types::metric::canonicalize_labels;

pub struct AlertRuleStore;

impl AlertRuleStore {
    pub fn insert(conn: &Connection, rule: &AlertRule) -> DatabaseResult<()> {
        conn.execute(
            r#"
            INSERT INTO alert_rules
                (id, name, severity, condition, enabled, notifications, labels, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                rule.id,
                rule.name,
                serde_json::to_string(&rule.severity).map_err(ser_err)?,
                serde_json::to_string(&rule.condition).map_err(ser_err)?,
                rule.enabled,
                serde_json::to_string(&rule.notifications).map_err(ser_err)?,
                serde_json::to_string(&rule.labels).map_err(ser_err)?,
                rule.created_at.timestamp(),
                rule.updated_at.timestamp(),
            ],
        )?;
        Ok(())
    }

    pub fn get(conn: &Connection, id: &str) -> DatabaseResult<Option<AlertRule>> {
        conn.query_row(
            "SELECT id, name, severity, condition, enabled, notifications, labels, \
             created_at, updated_at FROM alert_rules WHERE id = ?1",
            [id],
            row_to_rule,
        )
        .optional()
        .map_err(DatabaseError::from)
    }

    pub fn list(conn: &Connection) -> DatabaseResult<Vec<AlertRule>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, severity, condition, enabled, notifications, labels, \
             created_at, updated_at FROM alert_rules ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map([], row_to_rule)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn list_enabled(conn: &Connection) -> DatabaseResult<Vec<AlertRule>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, severity, condition, enabled, notifications, labels, \
             created_at, updated_at FROM alert_rules WHERE enabled = 1 ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map([], row_to_rule)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn update(conn: &Connection, rule: &AlertRule) -> DatabaseResult<()> {
        let updated = conn.execute(
            r#"
            UPDATE alert_rules SET
                name = ?2, severity = ?3, condition = ?4, enabled = ?5,
                notifications = ?6, labels = ?7, updated_at = ?8
            WHERE id = ?1
            "#,
            params![
                rule.id,
                rule.name,
                serde_json::to_string(&rule.severity).map_err(ser_err)?,
                serde_json::to_string(&rule.condition).map_err(ser_err)?,
                rule.enabled,
                serde_json::to_string(&rule.notifications).map_err(ser_err)?,
                serde_json::to_string(&rule.labels).map_err(ser_err)?,
                Utc::now().timestamp(),
            ],
        )?;
        if updated == 0 {
            return Err(DatabaseError::NotFound(rule.id.clone()));
        }
        Ok(())
    }

    pub fn delete(conn: &Connection, id: &str) -> DatabaseResult<()> {
        conn.execute("DELETE FROM alert_rules WHERE id = ?1", [id])?;
        Ok(())
    }
}

fn row_to_rule(row: &rusqlite::Row) -> rusqlite::Result<AlertRule> {
    let severity_str: String = row.get(2)?;
    let condition_str: String = row.get(3)?;
    let notifications_str: String = row.get(5)?;
    let labels_str: String = row.get(6)?;
    let created_at: i64 = row.get(7)?;
    let updated_at: i64 = row.get(8)?;

    Ok(AlertRule {
        id: row.get(0)?,
        name: row.get(1)?,
        severity: serde_json::from_str::<AlertSeverity>(&severity_str)
            .unwrap_or(AlertSeverity::Warning),
        condition: serde_json::from_str::<AlertCondition>(&condition_str).unwrap_or_default(),
        enabled: row.get(4)?,
        notifications: serde_json::from_str::<Vec<NotificationSinkConfig>>(&notifications_str)
            .unwrap_or_default(),
        labels: serde_json::from_str(&labels_str).unwrap_or_default(),
        created_at: chrono::DateTime::from_timestamp(created_at, 0).unwrap_or_else(Utc::now),
        updated_at: chrono::DateTime::from_timestamp(updated_at, 0).unwrap_or_else(Utc::now),
    })
}

pub struct AlertStore;

impl AlertStore {
    pub fn insert(conn: &Connection, alert: &Alert) -> DatabaseResult<()> {
        conn.execute(
            r#"
            INSERT INTO alerts
                (id, rule_id, name, description, severity, state, last_value, threshold,
                 labels, first_detected_at, last_detected_at, resolved_at, acknowledged_at,
                 acknowledged_by, resolution_note, notification_sent)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
            "#,
            params![
                alert.id,
                alert.rule_id,
                alert.name,
                alert.description,
                serde_json::to_string(&alert.severity).map_err(ser_err)?,
                serde_json::to_string(&alert.state).map_err(ser_err)?,
                alert.last_value,
                alert.threshold,
                canonicalize_labels(&alert.labels),
                alert.first_detected_at.timestamp(),
                alert.last_detected_at.timestamp(),
                alert.resolved_at.map(|t| t.timestamp()),
                alert.acknowledged_at.map(|t| t.timestamp()),
                alert.acknowledged_by,
                alert.resolution_note,
                alert.notification_sent,
            ],
        )?;
        Ok(())
    }

    pub fn get(conn: &Connection, id: &str) -> DatabaseResult<Option<Alert>> {
        conn.query_row(
            "SELECT id, rule_id, name, description, severity, state, last_value, threshold, \
             labels, first_detected_at, last_detected_at, resolved_at, acknowledged_at, \
             acknowledged_by, resolution_note, notification_sent FROM alerts WHERE id = ?1",
            [id],
            row_to_alert,
        )
        .optional()
        .map_err(DatabaseError::from)
    }

    /// Find the ACTIVE alert for a given rule and label-set, if one exists.
    /// Mirrors the storage-layer partial unique index.
    pub fn find_active(
        conn: &Connection,
        rule_id: &str,
        labels: &std::collections::BTreeMap<String, String>,
    ) -> DatabaseResult<Option<Alert>> {
        conn.query_row(
            "SELECT id, rule_id, name, description, severity, state, last_value, threshold, \
             labels, first_detected_at, last_detected_at, resolved_at, acknowledged_at, \
             acknowledged_by, resolution_note, notification_sent FROM alerts \
             WHERE rule_id = ?1 AND labels = ?2 AND state = 'active'",
            params![rule_id, canonicalize_labels(labels)],
            row_to_alert,
        )
        .optional()
        .map_err(DatabaseError::from)
    }

    pub fn list(conn: &Connection) -> DatabaseResult<Vec<Alert>> {
        let mut stmt = conn.prepare(
            "SELECT id, rule_id, name, description, severity, state, last_value, threshold, \
             labels, first_detected_at, last_detected_at, resolved_at, acknowledged_at, \
             acknowledged_by, resolution_note, notification_sent FROM alerts \
             ORDER BY first_detected_at DESC",
        )?;
        let rows = stmt
            .query_map([], row_to_alert)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn list_active(conn: &Connection) -> DatabaseResult<Vec<Alert>> {
        let mut stmt = conn.prepare(
            "SELECT id, rule_id, name, description, severity, state, last_value, threshold, \
             labels, first_detected_at, last_detected_at, resolved_at, acknowledged_at, \
             acknowledged_by, resolution_note, notification_sent FROM alerts \
             WHERE state = 'active' ORDER BY first_detected_at DESC",
        )?;
        let rows = stmt
            .query_map([], row_to_alert)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Re-fire: bump `last_detected_at`/`last_value` on an already-active alert
    /// instead of inserting a duplicate row.
    pub fn touch(conn: &Connection, id: &str, last_value: f64) -> DatabaseResult<()> {
        conn.execute(
            "UPDATE alerts SET last_value = ?2, last_detected_at = ?3 WHERE id = ?1",
            params![id, last_value, Utc::now().timestamp()],
        )?;
        Ok(())
    }

    pub fn acknowledge(conn: &Connection, id: &str, by: &str) -> DatabaseResult<()> {
        let updated = conn.execute(
            "UPDATE alerts SET state = 'acknowledged', acknowledged_at = ?2, acknowledged_by = ?3 \
             WHERE id = ?1",
            params![id, Utc::now().timestamp(), by],
        )?;
        if updated == 0 {
            return Err(DatabaseError::NotFound(id.to_string()));
        }
        Ok(())
    }

    pub fn resolve(conn: &Connection, id: &str, note: Option<&str>) -> DatabaseResult<()> {
        let updated = conn.execute(
            "UPDATE alerts SET state = 'resolved', resolved_at = ?2, resolution_note = ?3 \
             WHERE id = ?1",
            params![id, Utc::now().timestamp(), note],
        )?;
        if updated == 0 {
            return Err(DatabaseError::NotFound(id.to_string()));
        }
        Ok(())
    }

    pub fn mark_notification_sent(conn: &Connection, id: &str) -> DatabaseResult<()> {
        conn.execute(
            "UPDATE alerts SET notification_sent = 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }
}

fn row_to_alert(row: &rusqlite::Row) -> rusqlite::Result<Alert> {
    let severity_str: String = row.get(4)?;
    let state_str: String = row.get(5)?;
    let labels_str: String = row.get(8)?;
    let first_detected_at: i64 = row.get(9)?;
    let last_detected_at: i64 = row.get(10)?;
    let resolved_at: Option<i64> = row.get(11)?;
    let acknowledged_at: Option<i64> = row.get(12)?;

    Ok(Alert {
        id: row.get(0)?,
        rule_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        severity: serde_json::from_str(&severity_str).unwrap_or(AlertSeverity::Warning),
        state: match state_str.as_str() {
            "acknowledged" => AlertState::Acknowledged,
            "resolved" => AlertState::Resolved,
            _ => AlertState::Active,
        },
        last_value: row.get(6)?,
        threshold: row.get(7)?,
        labels: serde_json::from_str(&labels_str).unwrap_or_default(),
        first_detected_at: chrono::DateTime::from_timestamp(first_detected_at, 0)
            .unwrap_or_else(Utc::now),
        last_detected_at: chrono::DateTime::from_timestamp(last_detected_at, 0)
            .unwrap_or_else(Utc::now),
        resolved_at: resolved_at.and_then(|t| chrono::DateTime::from_timestamp(t, 0)),
        acknowledged_at: acknowledged_at.and_then(|t| chrono::DateTime::from_timestamp(t, 0)),
        acknowledged_by: row.get(13)?,
        resolution_note: row.get(14)?,
        notification_sent: row.get(15)?,
    })
}

fn ser_err(e: serde_json::Error) -> DatabaseError {
    DatabaseError::Serialization(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::types::Operator;
    use std::collections::BTreeMap;

    fn sample_rule(name: &str) -> AlertRule {
        let now = Utc::now();
        AlertRule {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            severity: AlertSeverity::Warning,
            condition: AlertCondition {
                metric_name: "cpu.usage".to_string(),
                operator: Operator::Gt,
                threshold: 90.0,
                duration_seconds: 0,
                labels: BTreeMap::new(),
            },
            enabled: true,
            notifications: vec![],
            labels: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    fn sample_alert(rule_id: &str) -> Alert {
        let now = Utc::now();
        Alert {
            id: uuid::Uuid::new_v4().to_string(),
            rule_id: rule_id.to_string(),
            name: "high cpu".to_string(),
            description: String::new(),
            severity: AlertSeverity::Warning,
            state: AlertState::Active,
            last_value: 95.0,
            threshold: 90.0,
            labels: BTreeMap::new(),
            first_detected_at: now,
            last_detected_at: now,
            resolved_at: None,
            acknowledged_at: None,
            acknowledged_by: None,
            resolution_note: None,
            notification_sent: false,
        }
    }

    #[tokio::test]
    async fn insert_rule_then_get_round_trips() {
        let db = Database::open_in_memory().unwrap();
        let rule = sample_rule("high-cpu");

        db.with_conn(|conn| AlertRuleStore::insert(conn, &rule))
            .await
            .unwrap();

        let loaded = db
            .with_conn(|conn| AlertRuleStore::get(conn, &rule.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.condition.threshold, 90.0);
    }

    #[tokio::test]
    async fn duplicate_active_alert_for_same_rule_and_labels_is_rejected() {
        let db = Database::open_in_memory().unwrap();
        let rule = sample_rule("dup-rule");
        db.with_conn(|conn| AlertRuleStore::insert(conn, &rule)).await.unwrap();

        let a = sample_alert(&rule.id);
        let mut b = sample_alert(&rule.id);
        b.id = uuid::Uuid::new_v4().to_string();

        db.with_conn(|conn| AlertStore::insert(conn, &a)).await.unwrap();
        let result = db.with_conn(|conn| AlertStore::insert(conn, &b)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn resolved_alert_does_not_block_a_new_active_one() {
        let db = Database::open_in_memory().unwrap();
        let rule = sample_rule("resolve-rule");
        db.with_conn(|conn| AlertRuleStore::insert(conn, &rule)).await.unwrap();

        let a = sample_alert(&rule.id);
        db.with_conn(|conn| AlertStore::insert(conn, &a)).await.unwrap();
        db.with_conn({
            let id = a.id.clone();
            move |conn| AlertStore::resolve(conn, &id, None)
        })
        .await
        .unwrap();

        let mut b = sample_alert(&rule.id);
        b.id = uuid::Uuid::new_v4().to_string();
        db.with_conn(|conn| AlertStore::insert(conn, &b)).await.unwrap();
    }

    #[tokio::test]
    async fn acknowledge_then_resolve_transitions_state() {
        let db = Database::open_in_memory().unwrap();
        let rule = sample_rule("ack-rule");
        db.with_conn(|conn| AlertRuleStore::insert(conn, &rule)).await.unwrap();

        let alert = sample_alert(&rule.id);
        db.with_conn(|conn| AlertStore::insert(conn, &alert)).await.unwrap();

        db.with_conn({
            let id = alert.id.clone();
            move |conn| AlertStore::acknowledge(conn, &id, "alice")
        })
        .await
        .unwrap();

        let loaded = db
            .with_conn({
                let id = alert.id.clone();
                move |conn| AlertStore::get(conn, &id)
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.state, AlertState::Acknowledged);
        assert_eq!(loaded.acknowledged_by.as_deref(), Some("alice"));
    }
}
