//! Time-Series Store (C5): ingest into the 1-minute raw table and
//! opportunistically roll stale buckets up into hourly/daily resolutions as
//! new points arrive, rather than running a dedicated rollup job.
//!
//! Grounded on `database::timeseries` for storage and the teacher's
//! `cron::Scheduler` for the periodic TTL cleanup.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::database::{Database, Resolution, TimeSeriesStore as Store};
use crate::error::Result;

const HOUR: i64 = 3600;
const DAY: i64 = 24 * HOUR;

pub struct TimeSeries {
    db: Arc<Database>,
}

impl TimeSeries {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Ingest one raw sample at `ts` (unix seconds). Rolls the just-completed
    /// hour into `ts_1h` and the just-completed day into `ts_1d` if those
    /// buckets haven't been rolled up yet.
    pub async fn ingest(
        &self,
        metric_name: &str,
        labels: &BTreeMap<String, String>,
        value: f64,
        ts: i64,
    ) -> Result<()> {
        let metric_name = metric_name.to_string();
        let labels = labels.clone();
        self.db
            .with_conn(move |conn| {
                Store::insert(conn, Resolution::OneMinute, &metric_name, &labels, ts, value)?;

                let hour_start = floor_to(ts, HOUR);
                let prev_hour_start = hour_start - HOUR;
                if !Store::has_point(conn, Resolution::OneHour, &metric_name, &labels, prev_hour_start)? {
                    if let Some(avg) = Store::average(
                        conn,
                        Resolution::OneMinute,
                        &metric_name,
                        &labels,
                        prev_hour_start,
                        hour_start,
                    )? {
                        Store::insert(
                            conn,
                            Resolution::OneHour,
                            &metric_name,
                            &labels,
                            prev_hour_start,
                            avg,
                        )?;
                    }
                }

                let day_start = floor_to(ts, DAY);
                let prev_day_start = day_start - DAY;
                if !Store::has_point(conn, Resolution::OneDay, &metric_name, &labels, prev_day_start)? {
                    if let Some(avg) = Store::average(
                        conn,
                        Resolution::OneHour,
                        &metric_name,
                        &labels,
                        prev_day_start,
                        day_start,
                    )? {
                        Store::insert(conn, Resolution::OneDay, &metric_name, &labels, prev_day_start, avg)?;
                    }
                }

                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn series(
        &self,
        resolution: Resolution,
        metric_name: &str,
        labels: &BTreeMap<String, String>,
        from_ts: i64,
        to_ts: i64,
    ) -> Result<Vec<crate::database::timeseries::TsPoint>> {
        let metric_name = metric_name.to_string();
        let labels = labels.clone();
        Ok(self
            .db
            .with_conn(move |conn| Store::series(conn, resolution, &metric_name, &labels, from_ts, to_ts))
            .await?)
    }

    pub async fn latest(
        &self,
        metric_name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Option<crate::database::timeseries::TsPoint>> {
        let metric_name = metric_name.to_string();
        let labels = labels.clone();
        Ok(self.db.with_conn(move |conn| Store::latest(conn, &metric_name, &labels)).await?)
    }

    /// Delete expired points across all three resolutions. Intended to be
    /// called on a `cron::Scheduler` tick, not inline with ingestion.
    pub async fn cleanup(&self, now: i64) -> Result<usize> {
        let mut total = 0;
        for resolution in [Resolution::OneMinute, Resolution::OneHour, Resolution::OneDay] {
            total += self.db.with_conn(move |conn| Store::cleanup(conn, resolution, now)).await?;
        }
        debug!(deleted = total, "timeseries cleanup pass complete");
        Ok(total)
    }
}

fn floor_to(ts: i64, unit_secs: i64) -> i64 {
    ts - ts.rem_euclid(unit_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;

    #[tokio::test]
    async fn ingest_rolls_up_completed_hour() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let ts = TimeSeries::new(db);
        let labels = BTreeMap::new();

        // Two points within hour 0.
        ts.ingest("cpu.usage", &labels, 10.0, 100).await.unwrap();
        ts.ingest("cpu.usage", &labels, 20.0, 200).await.unwrap();

        // A point in hour 1 triggers rollup of hour 0.
        ts.ingest("cpu.usage", &labels, 30.0, HOUR + 100).await.unwrap();

        let hourly = ts
            .series(Resolution::OneHour, "cpu.usage", &labels, 0, HOUR * 2)
            .await
            .unwrap();
        assert_eq!(hourly.len(), 1);
        assert_eq!(hourly[0].value, 15.0);
    }

    #[tokio::test]
    async fn latest_returns_most_recent_raw_point() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let ts = TimeSeries::new(db);
        let labels = BTreeMap::new();

        ts.ingest("mem.used", &labels, 1.0, 10).await.unwrap();
        ts.ingest("mem.used", &labels, 2.0, 20).await.unwrap();

        let latest = ts.latest("mem.used", &labels).await.unwrap().unwrap();
        assert_eq!(latest.value, 2.0);
    }
}
