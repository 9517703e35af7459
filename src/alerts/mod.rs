//! Alert Evaluator (C8): a polling loop that reads the latest value for each
//! enabled rule's metric, applies the rule's comparison operator, and drives
//! the Active/Acknowledged/Resolved alert lifecycle.
//!
//! Grounded on
//! `original_source/backend/app/plugins/monitoring/service.py::_check_alert_rules`,
//! reimplemented as the stateless `duration` evaluator the design notes call
//! for: instead of tracking an in-memory "condition first became true at"
//! timestamp, a firing `duration_seconds > 0` rule walks back through the
//! `ts_1m` bucket and requires every sample in that window to already satisfy
//! the operator.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, warn};
use uuid::Uuid;

use crate::cron::{JobHandle, Scheduler};
use crate::database::{AlertRuleStore, AlertStore, Database, Resolution};
use crate::error::Result;
use crate::notifier::Notifier;
use crate::timeseries::TimeSeries;
use crate::types::{Alert, AlertRule, AlertState};

pub struct Evaluator {
    db: Arc<Database>,
    timeseries: Arc<TimeSeries>,
    notifier: Option<Arc<Notifier>>,
}

impl Evaluator {
    pub fn new(db: Arc<Database>, timeseries: Arc<TimeSeries>) -> Self {
        Self { db, timeseries, notifier: None }
    }

    /// Attach a notifier so newly-created alerts enqueue deliveries to each
    /// of their rule's configured sinks. Re-firing an already-active alert
    /// never re-enqueues — that would spam the sink on every eval tick.
    pub fn with_notifier(mut self, notifier: Arc<Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Evaluate a single rule against its latest metric sample, creating,
    /// re-firing, or leaving alone the corresponding alert row.
    ///
    /// Returns the alert that is now ACTIVE, if the condition currently
    /// holds; `None` if it doesn't (or there's no data yet).
    pub async fn evaluate_rule(&self, rule: &AlertRule) -> Result<Option<Alert>> {
        let labels = &rule.condition.labels;
        let latest = self
            .timeseries
            .latest(&rule.condition.metric_name, labels)
            .await?;

        let Some(point) = latest else {
            return Ok(None);
        };

        let condition_holds = if rule.condition.duration_seconds == 0 {
            rule.condition.operator.apply(point.value, rule.condition.threshold)
        } else {
            self.holds_for_duration(rule, labels, point.ts).await?
        };

        // TODO(auto-resolve): once product decides on `rule.auto_resolve`,
        // an ACTIVE alert whose condition no longer holds should transition
        // to RESOLVED here instead of staying ACTIVE until acknowledged by
        // an operator.
        if !condition_holds {
            return Ok(None);
        }

        let rule_id = rule.id.clone();
        let labels_owned = labels.clone();
        let existing = self
            .db
            .with_conn(move |conn| AlertStore::find_active(conn, &rule_id, &labels_owned))
            .await?;

        if let Some(alert) = existing {
            let id = alert.id.clone();
            self.db
                .with_conn(move |conn| AlertStore::touch(conn, &id, point.value))
                .await?;
            return Ok(Some(alert));
        }

        let now = Utc::now();
        let alert = Alert {
            id: Uuid::new_v4().to_string(),
            rule_id: rule.id.clone(),
            name: rule.name.clone(),
            description: format!(
                "{} {:?} {} (observed {})",
                rule.condition.metric_name, rule.condition.operator, rule.condition.threshold, point.value
            ),
            severity: rule.severity,
            state: AlertState::Active,
            last_value: point.value,
            threshold: rule.condition.threshold,
            labels: labels.clone(),
            first_detected_at: now,
            last_detected_at: now,
            resolved_at: None,
            acknowledged_at: None,
            acknowledged_by: None,
            resolution_note: None,
            notification_sent: false,
        };

        self.db
            .with_conn({
                let alert = alert.clone();
                move |conn| AlertStore::insert(conn, &alert)
            })
            .await?;

        if let Some(notifier) = &self.notifier {
            for sink in &rule.notifications {
                if let Err(e) = notifier.enqueue(&alert.id, sink.sink_type, &sink.target).await {
                    warn!(alert_id = %alert.id, sink = ?sink.sink_type, error = %e, "failed to enqueue alert notification");
                }
            }
        }

        Ok(Some(alert))
    }

    /// Stateless duration check: every 1-minute sample covering
    /// `[latest_ts - duration_seconds, latest_ts]` must satisfy the operator.
    async fn holds_for_duration(
        &self,
        rule: &AlertRule,
        labels: &BTreeMap<String, String>,
        latest_ts: i64,
    ) -> Result<bool> {
        let from_ts = latest_ts - rule.condition.duration_seconds as i64;
        let points = self
            .timeseries
            .series(Resolution::OneMinute, &rule.condition.metric_name, labels, from_ts, latest_ts + 1)
            .await?;

        if points.is_empty() {
            return Ok(false);
        }
        Ok(points
            .iter()
            .all(|p| rule.condition.operator.apply(p.value, rule.condition.threshold)))
    }

    async fn evaluate_all_enabled(&self) -> Result<()> {
        let rules = self.db.with_conn(AlertRuleStore::list_enabled).await?;
        for rule in rules {
            if let Err(e) = self.evaluate_rule(&rule).await {
                warn!(rule_id = %rule.id, error = %e, "alert rule evaluation failed");
            }
        }
        Ok(())
    }
}

pub struct AlertWorker {
    evaluator: Arc<Evaluator>,
    scheduler: Scheduler,
}

impl AlertWorker {
    pub fn new(evaluator: Arc<Evaluator>) -> Self {
        Self {
            evaluator,
            scheduler: Scheduler::new(),
        }
    }

    /// Start the periodic evaluation job. Default interval is 60s per
    /// spec's `_check_alert_rules` cadence.
    pub async fn start(&self, interval: Duration) -> JobHandle {
        let evaluator = self.evaluator.clone();
        self.scheduler
            .schedule("alerts:evaluate".to_string(), interval, move || {
                let evaluator = evaluator.clone();
                async move {
                    if let Err(e) = evaluator.evaluate_all_enabled().await {
                        error!(error = %e, "alert evaluation pass failed");
                    }
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AlertCondition, AlertSeverity, Operator};

    fn rule(metric: &str, operator: Operator, threshold: f64, duration_seconds: u64) -> AlertRule {
        let now = Utc::now();
        AlertRule {
            id: Uuid::new_v4().to_string(),
            name: "test rule".to_string(),
            severity: AlertSeverity::Warning,
            condition: AlertCondition {
                metric_name: metric.to_string(),
                operator,
                threshold,
                duration_seconds,
                labels: BTreeMap::new(),
            },
            enabled: true,
            notifications: vec![],
            labels: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn instant_condition_fires_on_single_breach() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let ts = Arc::new(TimeSeries::new(db.clone()));
        ts.ingest("cpu.usage", &BTreeMap::new(), 95.0, 1000).await.unwrap();

        let evaluator = Evaluator::new(db, ts);
        let rule = rule("cpu.usage", Operator::Gt, 90.0, 0);
        let alert = evaluator.evaluate_rule(&rule).await.unwrap();
        assert!(alert.is_some());
    }

    #[tokio::test]
    async fn no_data_never_fires() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let ts = Arc::new(TimeSeries::new(db.clone()));
        let evaluator = Evaluator::new(db, ts);
        let rule = rule("cpu.usage", Operator::Gt, 90.0, 0);
        assert!(evaluator.evaluate_rule(&rule).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duration_condition_requires_every_sample_in_window() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let ts = Arc::new(TimeSeries::new(db.clone()));
        let labels = BTreeMap::new();
        ts.ingest("cpu.usage", &labels, 95.0, 100).await.unwrap();
        ts.ingest("cpu.usage", &labels, 40.0, 160).await.unwrap();
        ts.ingest("cpu.usage", &labels, 95.0, 220).await.unwrap();

        let evaluator = Evaluator::new(db, ts);
        let rule = rule("cpu.usage", Operator::Gt, 90.0, 120);
        // Window covers [100, 220]; the dip at 160 breaks it.
        assert!(evaluator.evaluate_rule(&rule).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duration_condition_fires_when_every_sample_qualifies() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let ts = Arc::new(TimeSeries::new(db.clone()));
        let labels = BTreeMap::new();
        ts.ingest("cpu.usage", &labels, 95.0, 100).await.unwrap();
        ts.ingest("cpu.usage", &labels, 96.0, 160).await.unwrap();
        ts.ingest("cpu.usage", &labels, 97.0, 220).await.unwrap();

        let evaluator = Evaluator::new(db, ts);
        let rule = rule("cpu.usage", Operator::Gt, 90.0, 120);
        assert!(evaluator.evaluate_rule(&rule).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn re_firing_touches_existing_alert_instead_of_duplicating() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let ts = Arc::new(TimeSeries::new(db.clone()));
        let labels = BTreeMap::new();
        ts.ingest("cpu.usage", &labels, 95.0, 100).await.unwrap();

        let evaluator = Evaluator::new(db.clone(), ts.clone());
        let rule = rule("cpu.usage", Operator::Gt, 90.0, 0);
        let first = evaluator.evaluate_rule(&rule).await.unwrap().unwrap();

        ts.ingest("cpu.usage", &labels, 99.0, 200).await.unwrap();
        let second = evaluator.evaluate_rule(&rule).await.unwrap().unwrap();
        assert_eq!(first.id, second.id);

        let all = db.with_conn(AlertStore::list).await.unwrap();
        assert_eq!(all.len(), 1);
    }
}
