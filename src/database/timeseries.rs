//! Storage for the three rollup resolutions (`ts_1m`/`ts_1h`/`ts_1d`). The
//! `timeseries` module owns rollup policy and TTL constants; this store is a
//! thin, resolution-parameterized CRUD layer over the three tables.

use rusqlite::{params, Connection};

use super::DatabaseResult;
use crate::types::metric::canonicalize_labels;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    OneMinute,
    OneHour,
    OneDay,
}

impl Resolution {
    fn table(&self) -> &'static str {
        match self {
            Resolution::OneMinute => "ts_1m",
            Resolution::OneHour => "ts_1h",
            Resolution::OneDay => "ts_1d",
        }
    }

    /// Storage TTL for this resolution, per SPEC_FULL.md's retention policy
    /// (7d raw / 30d hourly / 365d daily).
    pub fn ttl_seconds(&self) -> i64 {
        match self {
            Resolution::OneMinute => 7 * 24 * 3600,
            Resolution::OneHour => 30 * 24 * 3600,
            Resolution::OneDay => 365 * 24 * 3600,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TsPoint {
    pub ts: i64,
    pub value: f64,
}

pub struct TimeSeriesStore;

impl TimeSeriesStore {
    pub fn insert(
        conn: &Connection,
        resolution: Resolution,
        metric_name: &str,
        labels: &BTreeMap<String, String>,
        ts: i64,
        value: f64,
    ) -> DatabaseResult<()> {
        let label_key = canonicalize_labels(labels);
        let sql = format!(
            "INSERT INTO {} (metric_name, labels, ts, value) VALUES (?1, ?2, ?3, ?4)",
            resolution.table()
        );
        conn.execute(&sql, params![metric_name, label_key, ts, value])?;
        Ok(())
    }

    pub fn series(
        conn: &Connection,
        resolution: Resolution,
        metric_name: &str,
        labels: &BTreeMap<String, String>,
        from_ts: i64,
        to_ts: i64,
    ) -> DatabaseResult<Vec<TsPoint>> {
        let label_key = canonicalize_labels(labels);
        let sql = format!(
            "SELECT ts, value FROM {} WHERE metric_name = ?1 AND labels = ?2 \
             AND ts >= ?3 AND ts <= ?4 ORDER BY ts ASC",
            resolution.table()
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![metric_name, label_key, from_ts, to_ts], |row| {
                Ok(TsPoint {
                    ts: row.get(0)?,
                    value: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Finest-to-coarsest lookup: tries `ts_1m`, then falls back to `ts_1h`
    /// then `ts_1d`, returning the single most recent point found.
    pub fn latest(
        conn: &Connection,
        metric_name: &str,
        labels: &BTreeMap<String, String>,
    ) -> DatabaseResult<Option<TsPoint>> {
        let label_key = canonicalize_labels(labels);
        for resolution in [Resolution::OneMinute, Resolution::OneHour, Resolution::OneDay] {
            let sql = format!(
                "SELECT ts, value FROM {} WHERE metric_name = ?1 AND labels = ?2 \
                 ORDER BY ts DESC LIMIT 1",
                resolution.table()
            );
            let point = conn
                .query_row(&sql, params![metric_name, label_key], |row| {
                    Ok(TsPoint {
                        ts: row.get(0)?,
                        value: row.get(1)?,
                    })
                })
                .ok();
            if point.is_some() {
                return Ok(point);
            }
        }
        Ok(None)
    }

    pub fn has_point(
        conn: &Connection,
        resolution: Resolution,
        metric_name: &str,
        labels: &BTreeMap<String, String>,
        ts: i64,
    ) -> DatabaseResult<bool> {
        let label_key = canonicalize_labels(labels);
        let sql = format!(
            "SELECT 1 FROM {} WHERE metric_name = ?1 AND labels = ?2 AND ts = ?3",
            resolution.table()
        );
        let exists = conn
            .query_row(&sql, params![metric_name, label_key, ts], |_| Ok(()))
            .ok()
            .is_some();
        Ok(exists)
    }

    /// Average of all points in `[from_ts, to_ts)`, or `None` if there are none.
    pub fn average(
        conn: &Connection,
        resolution: Resolution,
        metric_name: &str,
        labels: &BTreeMap<String, String>,
        from_ts: i64,
        to_ts: i64,
    ) -> DatabaseResult<Option<f64>> {
        let label_key = canonicalize_labels(labels);
        let sql = format!(
            "SELECT AVG(value) FROM {} WHERE metric_name = ?1 AND labels = ?2 \
             AND ts >= ?3 AND ts < ?4",
            resolution.table()
        );
        let avg: Option<f64> =
            conn.query_row(&sql, params![metric_name, label_key, from_ts, to_ts], |row| row.get(0))?;
        Ok(avg)
    }

    /// Delete points older than `resolution`'s TTL, anchored at `now`.
    pub fn cleanup(conn: &Connection, resolution: Resolution, now: i64) -> DatabaseResult<usize> {
        let cutoff = now - resolution.ttl_seconds();
        let sql = format!("DELETE FROM {} WHERE ts < ?1", resolution.table());
        let deleted = conn.execute(&sql, params![cutoff])?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;

    #[tokio::test]
    async fn insert_then_series_round_trips() {
        let db = Database::open_in_memory().unwrap();
        let labels = BTreeMap::new();

        db.with_conn(|conn| {
            TimeSeriesStore::insert(conn, Resolution::OneMinute, "cpu.usage", &labels, 100, 42.0)
        })
        .await
        .unwrap();

        let points = db
            .with_conn(|conn| {
                TimeSeriesStore::series(conn, Resolution::OneMinute, "cpu.usage", &labels, 0, 200)
            })
            .await
            .unwrap();

        assert_eq!(points.len(), 1);
        assert_eq!(points[0].value, 42.0);
    }

    #[tokio::test]
    async fn latest_falls_back_through_resolutions() {
        let db = Database::open_in_memory().unwrap();
        let labels = BTreeMap::new();

        db.with_conn(|conn| {
            TimeSeriesStore::insert(conn, Resolution::OneDay, "disk.used", &labels, 500, 7.0)
        })
        .await
        .unwrap();

        let latest = db
            .with_conn(|conn| TimeSeriesStore::latest(conn, "disk.used", &labels))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(latest.value, 7.0);
    }

    #[tokio::test]
    async fn cleanup_removes_points_past_ttl() {
        let db = Database::open_in_memory().unwrap();
        let labels = BTreeMap::new();
        let now = 10_000_000i64;
        let old_ts = now - Resolution::OneMinute.ttl_seconds() - 10;

        db.with_conn(move |conn| {
            TimeSeriesStore::insert(conn, Resolution::OneMinute, "mem.used", &labels, old_ts, 1.0)
        })
        .await
        .unwrap();

        let deleted = db
            .with_conn(move |conn| TimeSeriesStore::cleanup(conn, Resolution::OneMinute, now))
            .await
            .unwrap();

        assert_eq!(deleted, 1);
    }
}
