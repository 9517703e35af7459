//! Latest-value cache for raw `Metric` envelopes (id-addressable, 24h TTL).
//! Distinct from the `ts_*` rollup tables: this stores the most recent full
//! envelope (name, type, unit, labels) per metric id for cheap point lookups,
//! while `timeseries` owns the historical series.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{DatabaseError, DatabaseResult};
use crate::types::{Metric, MetricType};

const TTL_SECONDS: i64 = 24 * 3600;

pub struct MetricKvStore;

impl MetricKvStore {
    pub fn upsert(conn: &Connection, metric: &Metric) -> DatabaseResult<()> {
        let expires_at = metric.timestamp.timestamp() + TTL_SECONDS;
        conn.execute(
            r#"
            INSERT INTO metrics_kv (id, name, metric_type, value, unit, labels, timestamp, expires_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name, metric_type = excluded.metric_type,
                value = excluded.value, unit = excluded.unit, labels = excluded.labels,
                timestamp = excluded.timestamp, expires_at = excluded.expires_at
            "#,
            params![
                metric.id,
                metric.name,
                serde_json::to_string(&metric.metric_type).map_err(ser_err)?,
                metric.value,
                metric.unit,
                serde_json::to_string(&metric.labels).map_err(ser_err)?,
                metric.timestamp.timestamp(),
                expires_at,
            ],
        )?;
        Ok(())
    }

    pub fn get(conn: &Connection, id: &str) -> DatabaseResult<Option<Metric>> {
        conn.query_row(
            "SELECT id, name, metric_type, value, unit, labels, timestamp \
             FROM metrics_kv WHERE id = ?1",
            [id],
            row_to_metric,
        )
        .optional()
        .map_err(DatabaseError::from)
    }

    pub fn cleanup(conn: &Connection, now: DateTime<Utc>) -> DatabaseResult<usize> {
        let deleted = conn.execute(
            "DELETE FROM metrics_kv WHERE expires_at < ?1",
            params![now.timestamp()],
        )?;
        Ok(deleted)
    }
}

fn row_to_metric(row: &rusqlite::Row) -> rusqlite::Result<Metric> {
    let metric_type_str: String = row.get(2)?;
    let labels_str: String = row.get(5)?;
    let timestamp: i64 = row.get(6)?;

    Ok(Metric {
        id: row.get(0)?,
        name: row.get(1)?,
        metric_type: serde_json::from_str::<MetricType>(&metric_type_str)
            .unwrap_or(MetricType::Gauge),
        value: row.get(3)?,
        unit: row.get(4)?,
        labels: serde_json::from_str(&labels_str).unwrap_or_default(),
        timestamp: DateTime::from_timestamp(timestamp, 0).unwrap_or_else(Utc::now),
    })
}

fn ser_err(e: serde_json::Error) -> DatabaseError {
    DatabaseError::Serialization(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use std::collections::BTreeMap;

    fn sample_metric(id: &str) -> Metric {
        Metric {
            id: id.to_string(),
            name: "cpu.usage".to_string(),
            metric_type: MetricType::Gauge,
            value: 55.0,
            unit: Some("percent".to_string()),
            labels: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn upsert_then_get_round_trips() {
        let db = Database::open_in_memory().unwrap();
        let metric = sample_metric("m1");

        db.with_conn(|conn| MetricKvStore::upsert(conn, &metric))
            .await
            .unwrap();

        let loaded = db
            .with_conn(|conn| MetricKvStore::get(conn, "m1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.value, 55.0);
    }

    #[tokio::test]
    async fn upsert_overwrites_existing_value() {
        let db = Database::open_in_memory().unwrap();
        let mut metric = sample_metric("m2");
        db.with_conn(|conn| MetricKvStore::upsert(conn, &metric))
            .await
            .unwrap();

        metric.value = 70.0;
        db.with_conn(|conn| MetricKvStore::upsert(conn, &metric))
            .await
            .unwrap();

        let loaded = db
            .with_conn(|conn| MetricKvStore::get(conn, "m2"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.value, 70.0);
    }

    #[tokio::test]
    async fn cleanup_removes_expired_entries() {
        let db = Database::open_in_memory().unwrap();
        let mut metric = sample_metric("m3");
        metric.timestamp = Utc::now() - chrono::Duration::hours(25);
        db.with_conn(|conn| MetricKvStore::upsert(conn, &metric))
            .await
            .unwrap();

        let deleted = db
            .with_conn(|conn| MetricKvStore::cleanup(conn, Utc::now()))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
    }
}
