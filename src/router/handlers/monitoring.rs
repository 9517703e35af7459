//! Time-Series Store and Alert Evaluator HTTP surface: raw metric ingestion,
//! timeseries queries, alert rule CRUD, and the alert lifecycle
//! (list/acknowledge/resolve).

use std::collections::BTreeMap;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::database::{AlertRuleStore, AlertStore, MetricKvStore, Resolution};
use crate::error::{DaemonError, Result};
use crate::types::{Alert, AlertRule, AlertSeverity, AlertState, Metric};

use super::super::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/metrics", post(ingest_metric))
        .route("/metrics/:name/timeseries", get(timeseries))
        .route("/alerts/rules", post(create_rule).get(list_rules))
        .route("/alerts/rules/:id", get(get_rule).delete(delete_rule))
        .route("/alerts", get(list_alerts))
        .route("/alerts/:id/acknowledge", post(acknowledge))
        .route("/alerts/:id/resolve", post(resolve))
}

async fn ingest_metric(State(state): State<AppState>, Json(metric): Json<Metric>) -> Result<Json<serde_json::Value>> {
    state
        .timeseries
        .ingest(&metric.name, &metric.labels, metric.value, metric.timestamp.timestamp())
        .await?;

    state
        .db
        .with_conn({
            let metric = metric.clone();
            move |conn| MetricKvStore::upsert(conn, &metric)
        })
        .await?;

    Ok(Json(serde_json::json!({"ingested": true})))
}

fn parse_resolution(s: &str) -> Result<Resolution> {
    match s {
        "1m" => Ok(Resolution::OneMinute),
        "1h" => Ok(Resolution::OneHour),
        "1d" => Ok(Resolution::OneDay),
        other => Err(DaemonError::validation("interval", format!("must be 1m, 1h, or 1d, got '{other}'"))),
    }
}

#[derive(Debug, Deserialize)]
pub struct TimeseriesQuery {
    pub start: i64,
    pub end: i64,
    #[serde(default = "default_interval")]
    pub interval: String,
}

fn default_interval() -> String {
    "1m".to_string()
}

async fn timeseries(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<TimeseriesQuery>,
) -> Result<Json<Vec<crate::database::timeseries::TsPoint>>> {
    let resolution = parse_resolution(&query.interval)?;
    let points = state
        .timeseries
        .series(resolution, &name, &BTreeMap::new(), query.start, query.end)
        .await?;
    Ok(Json(points))
}

#[derive(Debug, Deserialize)]
pub struct CreateRuleRequest {
    pub name: String,
    pub severity: AlertSeverity,
    pub condition: crate::types::AlertCondition,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub notifications: Vec<crate::types::NotificationSinkConfig>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

fn default_enabled() -> bool {
    true
}

async fn create_rule(State(state): State<AppState>, Json(req): Json<CreateRuleRequest>) -> Result<Json<AlertRule>> {
    let now = Utc::now();
    let rule = AlertRule {
        id: Uuid::new_v4().to_string(),
        name: req.name,
        severity: req.severity,
        condition: req.condition,
        enabled: req.enabled,
        notifications: req.notifications,
        labels: req.labels,
        created_at: now,
        updated_at: now,
    };

    state
        .db
        .with_conn({
            let rule = rule.clone();
            move |conn| AlertRuleStore::insert(conn, &rule)
        })
        .await?;

    Ok(Json(rule))
}

async fn list_rules(State(state): State<AppState>) -> Result<Json<Vec<AlertRule>>> {
    let rules = state.db.with_conn(AlertRuleStore::list).await?;
    Ok(Json(rules))
}

async fn get_rule(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<AlertRule>> {
    let rule = state
        .db
        .with_conn({
            let id = id.clone();
            move |conn| AlertRuleStore::get(conn, &id)
        })
        .await?
        .ok_or_else(|| DaemonError::NotFound(id))?;
    Ok(Json(rule))
}

async fn delete_rule(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<serde_json::Value>> {
    state
        .db
        .with_conn({
            let id = id.clone();
            move |conn| AlertRuleStore::delete(conn, &id)
        })
        .await?;
    Ok(Json(serde_json::json!({"deleted": true})))
}

#[derive(Debug, Deserialize)]
pub struct ListAlertsQuery {
    pub severity: Option<AlertSeverity>,
    pub state: Option<AlertState>,
}

async fn list_alerts(
    State(state): State<AppState>,
    Query(query): Query<ListAlertsQuery>,
) -> Result<Json<Vec<Alert>>> {
    let mut alerts = state.db.with_conn(AlertStore::list).await?;
    if let Some(severity) = query.severity {
        alerts.retain(|a| a.severity == severity);
    }
    if let Some(desired_state) = query.state {
        alerts.retain(|a| a.state == desired_state);
    }
    Ok(Json(alerts))
}

#[derive(Debug, Deserialize)]
pub struct AcknowledgeRequest {
    pub by: String,
}

async fn acknowledge(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<AcknowledgeRequest>,
) -> Result<Json<serde_json::Value>> {
    state
        .db
        .with_conn(move |conn| AlertStore::acknowledge(conn, &id, &req.by))
        .await?;
    Ok(Json(serde_json::json!({"acknowledged": true})))
}

#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    pub note: Option<String>,
}

async fn resolve(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ResolveRequest>,
) -> Result<Json<serde_json::Value>> {
    state
        .db
        .with_conn(move |conn| AlertStore::resolve(conn, &id, req.note.as_deref()))
        .await?;
    Ok(Json(serde_json::json!({"resolved": true})))
}
